//! SMS and messaging-app channels - JSON submission over HTTP

use super::{ChannelAdapter, ChannelCheck, OutboundMessage, SendOutcome};
use async_trait::async_trait;
use clinicomm_common::config::HttpProviderConfig;
use clinicomm_common::{Channel, Error, Result};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Request body posted to the provider
#[derive(Debug, Serialize)]
struct ProviderRequest<'a> {
    channel: Channel,
    to: &'a str,
    from: Option<&'a str>,
    body: &'a str,
    reference: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    media: Vec<ProviderMedia<'a>>,
}

#[derive(Debug, Serialize)]
struct ProviderMedia<'a> {
    filename: &'a str,
    content_type: &'a str,
    content_base64: &'a str,
}

/// Adapter for providers that take a JSON POST per message
pub struct HttpProviderAdapter {
    channel: Channel,
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProviderAdapter {
    pub fn new(channel: Channel, config: HttpProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            channel,
            config,
            client,
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let request = self.client.request(method, &self.config.endpoint);
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

/// Whether an HTTP status should be retried
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || matches!(status.as_u16(), 408 | 425 | 429)
}

/// Provider message id from the usual response fields
fn provider_message_id(body: &Value) -> Option<String> {
    ["id", "message_id", "sid"].iter().find_map(|key| match body.get(*key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[async_trait]
impl ChannelAdapter for HttpProviderAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        if self.config.endpoint.is_empty() {
            return SendOutcome::Rejected {
                reason: format!("No provider endpoint configured for {}", self.channel),
            };
        }

        let from = match self.channel {
            Channel::Sms => message.sender.sms_sender_id.as_deref(),
            _ => None,
        };
        let payload = ProviderRequest {
            channel: self.channel,
            to: &message.address,
            from,
            body: &message.content,
            reference: message.id.to_string(),
            media: message
                .attachments
                .iter()
                .map(|a| ProviderMedia {
                    filename: &a.filename,
                    content_type: &a.content_type,
                    content_base64: &a.content_base64,
                })
                .collect(),
        };

        let response = match self.request(reqwest::Method::POST).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(channel = %self.channel, message_id = %message.id, error = %e, "Provider request failed");
                return SendOutcome::TransientError {
                    reason: e.to_string(),
                };
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            debug!(channel = %self.channel, message_id = %message.id, "Provider accepted message");
            SendOutcome::Accepted {
                provider_message_id: provider_message_id(&body),
                response: body,
            }
        } else if is_transient_status(status) {
            SendOutcome::TransientError {
                reason: format!("Provider returned {}: {}", status, body),
            }
        } else {
            SendOutcome::Rejected {
                reason: format!("Provider returned {}: {}", status, body),
            }
        }
    }

    async fn check(&self) -> ChannelCheck {
        if self.config.endpoint.is_empty() {
            return ChannelCheck::failed(self.channel, "No provider endpoint configured");
        }

        match self.request(reqwest::Method::HEAD).send().await {
            Ok(response)
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                ChannelCheck::failed(self.channel, "Provider rejected the API key")
            }
            Ok(response) if response.status().is_server_error() => ChannelCheck::failed(
                self.channel,
                format!("Provider returned {}", response.status()),
            ),
            Ok(_) => ChannelCheck::ok(self.channel, "Provider reachable"),
            Err(e) => ChannelCheck::failed(self.channel, e.to_string()),
        }
    }
}
