//! Configuration for ClinicComm

use crate::types::DeliveryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "CLINICOMM_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dispatch scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Channel provider endpoints and credentials
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Outbound webhook configuration
    #[serde(default)]
    pub webhooks: WebhookConfig,

    /// Delivery settings used when none are stored yet
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Base URL used to build unsubscribe links
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Secret used to sign unsubscribe tokens
    #[serde(default)]
    pub unsubscribe_secret: Option<String>,

    /// Bearer key required on `/api/v1` routes; unset disables the check
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
            public_url: default_public_url(),
            unsubscribe_secret: None,
            api_key: None,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a free connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:///var/lib/clinicomm/clinicomm.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on how long the worker sleeps between checks (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum number of messages dequeued in one pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    500
}

/// Provider configuration for every channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub email: SmtpProviderConfig,

    #[serde(default)]
    pub sms: HttpProviderConfig,

    #[serde(default)]
    pub messaging_app: HttpProviderConfig,
}

/// SMTP security mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    Tls,
    Starttls,
    None,
}

/// SMTP submission settings for the email channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpProviderConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    #[serde(default = "default_smtp_security")]
    pub security: SmtpSecurity,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Maximum concurrent submissions
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for SmtpProviderConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            security: default_smtp_security(),
            timeout_secs: default_provider_timeout(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_security() -> SmtpSecurity {
    SmtpSecurity::Starttls
}

/// JSON-over-HTTP provider settings (SMS and messaging app)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    /// Submission endpoint
    #[serde(default)]
    pub endpoint: String,

    /// Bearer token sent with every request
    pub api_key: Option<String>,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Maximum concurrent submissions
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            timeout_secs: default_provider_timeout(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    10
}

/// Outbound webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Request timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,

    /// Permit loopback and private network targets
    #[serde(default)]
    pub allow_private_targets: bool,

    /// Consecutive failures before a registration is skipped
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,

    /// Seconds a tripped registration stays skipped
    #[serde(default = "default_circuit_reset")]
    pub circuit_reset_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout(),
            allow_private_targets: false,
            circuit_threshold: default_circuit_threshold(),
            circuit_reset_secs: default_circuit_reset(),
        }
    }
}

fn default_webhook_timeout() -> u64 {
    5
}

fn default_circuit_threshold() -> u32 {
    5
}

fn default_circuit_reset() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from the first file found, overlaid with
    /// `CLINICOMM__SECTION__KEY` environment variables
    pub fn load() -> crate::Result<Self> {
        let mut candidates = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            candidates.push(PathBuf::from(explicit));
        }
        candidates.push(PathBuf::from("./clinicomm.toml"));
        candidates.push(PathBuf::from("/etc/clinicomm/config.toml"));

        let mut builder = ::config::Config::builder();
        if let Some(path) = candidates.iter().find(|p| p.exists()) {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path.as_path()));
        } else {
            tracing::warn!("No configuration file found, using defaults");
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("CLINICOMM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}
