//! Webhook Notifier - Signed lifecycle notifications
//!
//! Every active registration subscribed to an event receives a JSON POST
//! signed with HMAC-SHA256 (`X-Webhook-Signature: sha256=<hex>`). Delivery
//! runs outside the dispatch path and never feeds back into message state.

use crate::delivery::lifecycle::WebhookEvent;
use chrono::{DateTime, Utc};
use clinicomm_common::config::WebhookConfig;
use clinicomm_common::types::{MessageId, WebhookId};
use clinicomm_common::{Channel, Error, Result};
use clinicomm_storage::models::{
    DeliveryStatus, FailureReason, Message, TriggerType, WebhookRegistration,
};
use clinicomm_storage::repository::{CreateWebhook, WebhookRepository};
use hmac::{Hmac, Mac};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Event names accepted in a registration
pub const SUBSCRIBABLE_EVENTS: &[&str] = &[
    "*",
    "message.sent",
    "message.delivered",
    "message.failed",
    "message.bounced",
];

/// Registration request
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterWebhook {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Message fields exposed to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct MessageSnapshot {
    pub id: MessageId,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub recipient_name: String,
    pub recipient_address: String,
    pub scheduled_for: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    pub error_message: Option<String>,
    pub bounce_reason: Option<String>,
    pub retry_count: i32,
    pub tracking_id: Option<String>,
    pub trigger_type: Option<TriggerType>,
    pub trigger_entity_id: Option<String>,
}

impl From<&Message> for MessageSnapshot {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            channel: m.channel,
            status: m.status,
            recipient_name: m.recipient_name.clone(),
            recipient_address: m.recipient_address.clone(),
            scheduled_for: m.scheduled_for,
            sent_at: m.sent_at,
            delivered_at: m.delivered_at,
            read_at: m.read_at,
            failed_at: m.failed_at,
            failure_reason: m.failure_reason,
            error_message: m.error_message.clone(),
            bounce_reason: m.bounce_reason.clone(),
            retry_count: m.retry_count,
            tracking_id: m.tracking_id.clone(),
            trigger_type: m.trigger_type,
            trigger_entity_id: m.trigger_entity_id.clone(),
        }
    }
}

/// Body posted to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub occurred_at: DateTime<Utc>,
    pub message: MessageSnapshot,
}

/// Result of posting to one registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAttempt {
    Delivered,
    Failed(String),
    /// Circuit open, not attempted
    Skipped,
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Webhook notifier
pub struct WebhookNotifier {
    repo: WebhookRepository,
    client: reqwest::Client,
    config: WebhookConfig,
    circuits: Mutex<HashMap<WebhookId, CircuitState>>,
}

impl WebhookNotifier {
    pub fn new(repo: WebhookRepository, config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build webhook client: {}", e)))?;

        Ok(Self {
            repo,
            client,
            config,
            circuits: Mutex::new(HashMap::new()),
        })
    }

    /// Validate and store a registration. A secret is generated when none
    /// is supplied; an empty event list subscribes to everything.
    pub async fn register(&self, input: RegisterWebhook) -> Result<WebhookRegistration> {
        validate_webhook_url(&input.url, self.config.allow_private_targets)?;

        if let Some(unknown) = input
            .events
            .iter()
            .find(|e| !SUBSCRIBABLE_EVENTS.contains(&e.as_str()))
        {
            return Err(Error::Validation(format!("Unknown webhook event: {}", unknown)));
        }

        let secret = match input.secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => hex::encode(Uuid::new_v4().as_bytes()),
        };

        let registration = self
            .repo
            .create(CreateWebhook {
                url: input.url,
                secret,
                events: input.events,
            })
            .await
            .map_err(db_error)?;

        info!(webhook_id = %registration.id, url = %registration.url, "Webhook registered");
        Ok(registration)
    }

    pub async fn list(&self) -> Result<Vec<WebhookRegistration>> {
        self.repo.list().await.map_err(db_error)
    }

    pub async fn delete(&self, id: WebhookId) -> Result<()> {
        if !self.repo.delete(id).await.map_err(db_error)? {
            return Err(Error::NotFound(format!("Webhook {} not found", id)));
        }
        self.circuits.lock().await.remove(&id);
        Ok(())
    }

    pub async fn set_active(&self, id: WebhookId, active: bool) -> Result<()> {
        if !self.repo.set_active(id, active).await.map_err(db_error)? {
            return Err(Error::NotFound(format!("Webhook {} not found", id)));
        }
        if active {
            self.circuits.lock().await.remove(&id);
        }
        Ok(())
    }

    /// Fire-and-forget notification
    pub fn notify(self: &Arc<Self>, event: WebhookEvent, message: &Message) {
        let notifier = Arc::clone(self);
        let payload = WebhookPayload {
            event,
            occurred_at: Utc::now(),
            message: MessageSnapshot::from(message),
        };

        tokio::spawn(async move {
            notifier.deliver(&payload).await;
        });
    }

    /// Post a payload to every subscribed registration
    pub async fn deliver(&self, payload: &WebhookPayload) -> Vec<(WebhookId, DeliveryAttempt)> {
        let registrations = match self.repo.list_active().await {
            Ok(registrations) => registrations,
            Err(e) => {
                warn!(error = %e, "Failed to load webhook registrations");
                return Vec::new();
            }
        };

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize webhook payload");
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        for registration in registrations
            .iter()
            .filter(|r| r.subscribes_to(payload.event.as_str()))
        {
            let attempt = if self.circuit_open(registration.id).await {
                debug!(webhook_id = %registration.id, "Circuit open, skipping webhook");
                DeliveryAttempt::Skipped
            } else {
                let attempt = self.post(registration, payload.event, &body).await;
                self.record(registration.id, &attempt).await;
                attempt
            };
            results.push((registration.id, attempt));
        }

        results
    }

    async fn post(
        &self,
        registration: &WebhookRegistration,
        event: WebhookEvent,
        body: &[u8],
    ) -> DeliveryAttempt {
        if let Err(e) = validate_webhook_url(&registration.url, self.config.allow_private_targets)
        {
            return DeliveryAttempt::Failed(e.to_string());
        }

        let signature = match sign(&registration.secret, body) {
            Ok(signature) => signature,
            Err(e) => return DeliveryAttempt::Failed(e.to_string()),
        };

        let response = self
            .client
            .post(&registration.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event", event.as_str())
            .header("X-Webhook-Signature", signature)
            .body(body.to_vec())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => DeliveryAttempt::Delivered,
            Ok(response) => {
                warn!(webhook_id = %registration.id, status = %response.status(), "Webhook rejected notification");
                DeliveryAttempt::Failed(format!("Receiver returned {}", response.status()))
            }
            Err(e) => {
                warn!(webhook_id = %registration.id, error = %e, "Webhook delivery failed");
                DeliveryAttempt::Failed(e.to_string())
            }
        }
    }

    async fn circuit_open(&self, id: WebhookId) -> bool {
        let mut circuits = self.circuits.lock().await;
        match circuits.get_mut(&id) {
            Some(state) => match state.open_until {
                Some(until) if Instant::now() < until => true,
                Some(_) => {
                    // Half-open: allow one probe
                    state.open_until = None;
                    false
                }
                None => false,
            },
            None => false,
        }
    }

    async fn record(&self, id: WebhookId, attempt: &DeliveryAttempt) {
        let mut circuits = self.circuits.lock().await;
        let state = circuits.entry(id).or_default();
        match attempt {
            DeliveryAttempt::Delivered => {
                state.consecutive_failures = 0;
                state.open_until = None;
            }
            DeliveryAttempt::Failed(_) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.circuit_threshold.max(1) {
                    warn!(webhook_id = %id, failures = state.consecutive_failures, "Webhook circuit opened");
                    state.open_until =
                        Some(Instant::now() + Duration::from_secs(self.config.circuit_reset_secs));
                }
            }
            DeliveryAttempt::Skipped => {}
        }
    }
}

/// `sha256=<hex>` signature of a body
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Webhook(format!("Invalid HMAC key: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Validate a webhook target (http/https, public host unless allowed)
pub fn validate_webhook_url(url: &str, allow_private: bool) -> Result<()> {
    let parsed =
        Url::parse(url).map_err(|e| Error::Validation(format!("Invalid webhook URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(Error::Validation(format!(
                "Webhook URL scheme '{}' is not allowed",
                scheme
            )))
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Validation("Webhook URL has no host".to_string()))?;

    if allow_private {
        return Ok(());
    }

    let lower = host.to_lowercase();
    if lower == "localhost" || lower.ends_with(".local") || lower.ends_with(".internal") {
        return Err(Error::Validation(format!(
            "Webhook URL host '{}' is not allowed",
            host
        )));
    }

    let literal = lower.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(Error::Validation(format!(
                "Webhook URL IP '{}' is in a private range",
                ip
            )));
        }
    }

    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn db_error(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}
