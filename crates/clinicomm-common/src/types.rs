//! Common types for ClinicComm

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for messages
pub type MessageId = Uuid;

/// Unique identifier for templates
pub type TemplateId = Uuid;

/// Unique identifier for webhook registrations
pub type WebhookId = Uuid;

/// Identifier of the clinician owning a template
pub type ClinicianId = Uuid;

/// Name to value map used when rendering templates
pub type VariableMap = HashMap<String, String>;

/// Upper bound for `DeliveryConfig::retry_attempts`
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Upper bound for `DeliveryConfig::retry_delay_minutes` (one day)
pub const MAX_RETRY_DELAY_MINUTES: u32 = 24 * 60;

/// Delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    MessagingApp,
}

impl Channel {
    /// All channels, in a stable order
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::MessagingApp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::MessagingApp => "messaging_app",
        }
    }

    /// Whether messages on this channel carry a subject line
    pub fn supports_subject(&self) -> bool {
        matches!(self, Channel::Email)
    }

    /// Whether a read receipt moves a message into the `read` status
    pub fn tracks_read_status(&self) -> bool {
        matches!(self, Channel::Email)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "messaging_app" | "whatsapp" => Ok(Channel::MessagingApp),
            other => Err(crate::Error::Validation(format!("Unknown channel: {}", other))),
        }
    }
}

/// Per-channel switch and provider selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Provider key, matched against the configured provider sections
    #[serde(default)]
    pub provider: String,
}

impl ChannelSettings {
    fn with_provider(provider: &str) -> Self {
        Self {
            enabled: true,
            provider: provider.to_string(),
        }
    }
}

/// Sender identity used by outbound messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub name: String,
    pub email: String,
    pub sms_sender_id: Option<String>,
}

impl Default for SenderIdentity {
    fn default() -> Self {
        Self {
            name: "Clinic".to_string(),
            email: "no-reply@clinic.local".to_string(),
            sms_sender_id: None,
        }
    }
}

/// Engagement tracking toggles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingSettings {
    #[serde(default)]
    pub track_opens: bool,
    #[serde(default)]
    pub track_clicks: bool,
}

/// Jurisdiction compliance flags, enforced by the external compliance store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceFlags {
    #[serde(default)]
    pub lgpd: bool,
    #[serde(default)]
    pub gdpr: bool,
    #[serde(default)]
    pub hipaa: bool,
    #[serde(default)]
    pub require_consent: bool,
}

/// Runtime delivery settings shared by every component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_email_settings")]
    pub email: ChannelSettings,

    #[serde(default = "default_sms_settings")]
    pub sms: ChannelSettings,

    #[serde(default = "default_messaging_app_settings")]
    pub messaging_app: ChannelSettings,

    #[serde(default)]
    pub sender: SenderIdentity,

    #[serde(default)]
    pub reply_to: Option<String>,

    /// Provider attempts allowed before a transient error becomes terminal
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between retries in minutes
    #[serde(default = "default_retry_delay_minutes")]
    pub retry_delay_minutes: u32,

    #[serde(default)]
    pub tracking: TrackingSettings,

    /// Append an unsubscribe link to email content
    #[serde(default)]
    pub unsubscribe_link: bool,

    /// Calling code prefixed to national phone numbers
    #[serde(default = "default_country_code")]
    pub default_country_code: String,

    #[serde(default)]
    pub compliance: ComplianceFlags,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            email: default_email_settings(),
            sms: default_sms_settings(),
            messaging_app: default_messaging_app_settings(),
            sender: SenderIdentity::default(),
            reply_to: None,
            retry_attempts: default_retry_attempts(),
            retry_delay_minutes: default_retry_delay_minutes(),
            tracking: TrackingSettings::default(),
            unsubscribe_link: false,
            default_country_code: default_country_code(),
            compliance: ComplianceFlags::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_email_settings() -> ChannelSettings {
    ChannelSettings::with_provider("smtp")
}

fn default_sms_settings() -> ChannelSettings {
    ChannelSettings::with_provider("http")
}

fn default_messaging_app_settings() -> ChannelSettings {
    ChannelSettings::with_provider("http")
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_minutes() -> u32 {
    10
}

fn default_country_code() -> String {
    "55".to_string()
}

impl DeliveryConfig {
    /// Settings for one channel
    pub fn channel(&self, channel: Channel) -> &ChannelSettings {
        match channel {
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
            Channel::MessagingApp => &self.messaging_app,
        }
    }

    /// Retry delay as a chrono duration
    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.retry_delay_minutes))
    }

    /// Validate bounds before the settings are published
    pub fn validate(&self) -> crate::Result<()> {
        if self.retry_attempts > MAX_RETRY_ATTEMPTS {
            return Err(crate::Error::Validation(format!(
                "retry_attempts must be at most {}",
                MAX_RETRY_ATTEMPTS
            )));
        }
        if self.retry_delay_minutes == 0 || self.retry_delay_minutes > MAX_RETRY_DELAY_MINUTES {
            return Err(crate::Error::Validation(format!(
                "retry_delay_minutes must be between 1 and {}",
                MAX_RETRY_DELAY_MINUTES
            )));
        }
        if self.default_country_code.is_empty()
            || !self.default_country_code.chars().all(|c| c.is_ascii_digit())
        {
            return Err(crate::Error::Validation(
                "default_country_code must contain digits only".to_string(),
            ));
        }
        if !self.sender.email.contains('@') {
            return Err(crate::Error::Validation(
                "sender email must be a valid address".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_channel_roundtrip() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert_eq!("WhatsApp".parse::<Channel>().unwrap(), Channel::MessagingApp);
        assert!("fax".parse::<Channel>().is_err());
    }

    #[test]
    fn test_default_delivery_config_is_valid() {
        let config = DeliveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_delay(), chrono::Duration::minutes(10));
    }

    #[test]
    fn test_delivery_config_bounds() {
        let mut config = DeliveryConfig::default();
        config.retry_attempts = MAX_RETRY_ATTEMPTS + 1;
        assert!(config.validate().is_err());

        let mut config = DeliveryConfig::default();
        config.retry_delay_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = DeliveryConfig::default();
        config.default_country_code = "+55".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_delivery_config_uses_defaults() {
        let config: DeliveryConfig =
            serde_json::from_str(r#"{"retry_attempts": 5, "sms": {"enabled": false}}"#).unwrap();
        assert_eq!(config.retry_attempts, 5);
        assert!(!config.sms.enabled);
        assert_eq!(config.retry_delay_minutes, 10);
        assert_eq!(config.email.provider, "smtp");
    }
}
