//! Channel adapters
//!
//! Each channel (email, SMS, messaging app) sits behind one
//! [`ChannelAdapter`] capability. An adapter makes exactly one provider call
//! per `send` and classifies the result as accepted, rejected or transient.
//! The [`AdapterRegistry`] also owns the per-channel concurrency limits.

pub mod email;
pub mod http;

use async_trait::async_trait;
use clinicomm_common::config::ProvidersConfig;
use clinicomm_common::types::{MessageId, SenderIdentity};
use clinicomm_common::{Channel, Error, Result};
use clinicomm_storage::models::Attachment;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;

pub use email::SmtpAdapter;
pub use http::HttpProviderAdapter;

/// Message as handed to a provider
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: MessageId,
    pub channel: Channel,
    pub recipient_name: String,
    /// Normalized address
    pub address: String,
    pub subject: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub sender: SenderIdentity,
    pub reply_to: Option<String>,
    pub unsubscribe_url: Option<String>,
}

/// Result of one provider call
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Provider took the message
    Accepted {
        provider_message_id: Option<String>,
        response: serde_json::Value,
    },
    /// Provider refused the message; retrying will not help
    Rejected { reason: String },
    /// Timeout, throttling or server-side failure
    TransientError { reason: String },
}

/// Verdict of a channel configuration test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelCheck {
    pub channel: Channel,
    pub success: bool,
    pub message: String,
}

impl ChannelCheck {
    pub fn ok(channel: Channel, message: impl Into<String>) -> Self {
        Self {
            channel,
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(channel: Channel, message: impl Into<String>) -> Self {
        Self {
            channel,
            success: false,
            message: message.into(),
        }
    }
}

/// Uniform send capability implemented by every channel
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel served by this adapter
    fn channel(&self) -> Channel;

    /// Submit one message to the provider
    async fn send(&self, message: &OutboundMessage) -> SendOutcome;

    /// Check that the provider is configured and reachable
    async fn check(&self) -> ChannelCheck;
}

/// Malformed recipient address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {channel} address '{address}'")]
pub struct AddressError {
    pub channel: Channel,
    pub address: String,
}

impl From<AddressError> for Error {
    fn from(err: AddressError) -> Self {
        Error::InvalidAddress(err.to_string())
    }
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9\-]+(\.[a-z0-9\-]+)*\.[a-z]{2,}$")
            .expect("email pattern")
    })
}

/// Normalize a recipient address for a channel.
///
/// Emails are trimmed and lower-cased. Phone numbers are reduced to digits
/// with the country calling code; numbers written without `+` or `00` and
/// short enough to be national get `default_country_code` prepended.
pub fn normalize_address(
    channel: Channel,
    raw: &str,
    default_country_code: &str,
) -> std::result::Result<String, AddressError> {
    let invalid = || AddressError {
        channel,
        address: raw.to_string(),
    };

    match channel {
        Channel::Email => {
            let address = raw.trim().to_lowercase();
            if email_pattern().is_match(&address) {
                Ok(address)
            } else {
                Err(invalid())
            }
        }
        Channel::Sms | Channel::MessagingApp => {
            normalize_phone(raw, default_country_code).ok_or_else(invalid)
        }
    }
}

/// Normalize an address whose channel is not known (opt-out lists)
pub fn normalize_any(
    raw: &str,
    default_country_code: &str,
) -> std::result::Result<String, AddressError> {
    if raw.contains('@') {
        normalize_address(Channel::Email, raw, default_country_code)
    } else {
        normalize_address(Channel::Sms, raw, default_country_code)
    }
}

fn normalize_phone(raw: &str, default_country_code: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed
        .chars()
        .any(|c| !(c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')' | '.' | '+')))
    {
        return None;
    }

    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    let international = trimmed.starts_with('+');

    let number = if international {
        digits
    } else if let Some(rest) = digits.strip_prefix("00") {
        rest.to_string()
    } else {
        let national = digits.trim_start_matches('0');
        if national.len() <= 11 {
            format!("{}{}", default_country_code, national)
        } else {
            national.to_string()
        }
    };

    if (10..=15).contains(&number.len()) {
        Some(number)
    } else {
        None
    }
}

/// Adapters and their concurrency limits, keyed by channel
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    permits: HashMap<Channel, Arc<Semaphore>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the SMTP and HTTP adapters from provider configuration
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(
            Arc::new(SmtpAdapter::new(config.email.clone())),
            config.email.max_concurrency,
        );
        registry.register(
            Arc::new(HttpProviderAdapter::new(Channel::Sms, config.sms.clone())?),
            config.sms.max_concurrency,
        );
        registry.register(
            Arc::new(HttpProviderAdapter::new(
                Channel::MessagingApp,
                config.messaging_app.clone(),
            )?),
            config.messaging_app.max_concurrency,
        );
        Ok(registry)
    }

    /// Register (or replace) the adapter for its channel
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>, max_concurrency: usize) {
        let channel = adapter.channel();
        self.permits
            .insert(channel, Arc::new(Semaphore::new(max_concurrency.max(1))));
        self.adapters.insert(channel, adapter);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    /// Semaphore bounding concurrent sends on a channel
    pub fn permits(&self, channel: Channel) -> Option<Arc<Semaphore>> {
        self.permits.get(&channel).cloned()
    }

    /// Run every adapter's configuration check, one verdict per channel
    pub async fn check_all(&self) -> Vec<ChannelCheck> {
        let mut verdicts = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let verdict = match self.get(channel) {
                Some(adapter) => adapter.check().await,
                None => ChannelCheck::failed(channel, "No adapter registered"),
            };
            verdicts.push(verdict);
        }
        verdicts
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted adapter for scheduler and settings tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct ScriptedAdapter {
        channel: Channel,
        script: Mutex<VecDeque<SendOutcome>>,
        calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        pub fn new(channel: Channel, script: Vec<SendOutcome>) -> Arc<Self> {
            Arc::new(Self {
                channel,
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub fn accepted(id: &str) -> SendOutcome {
        SendOutcome::Accepted {
            provider_message_id: Some(id.to_string()),
            response: serde_json::json!({ "id": id }),
        }
    }

    pub fn transient() -> SendOutcome {
        SendOutcome::TransientError {
            reason: "503 Service Unavailable".to_string(),
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedAdapter {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(&self, _message: &OutboundMessage) -> SendOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| accepted("default"))
        }

        async fn check(&self) -> ChannelCheck {
            ChannelCheck::ok(self.channel, "scripted")
        }
    }
}
