//! Provider callbacks
//!
//! Delivery receipts, bounces, read receipts and engagement events arrive
//! from providers keyed by the id the provider assigned at acceptance.

use super::lifecycle::{self, DeliveryEvent, RetryPolicy};
use crate::compliance::ComplianceGate;
use crate::webhooks::WebhookNotifier;
use chrono::Utc;
use clinicomm_common::{Channel, DeliveryConfig, Error, Result};
use clinicomm_storage::models::Message;
use clinicomm_storage::repository::MessageRepository;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Save attempts before a concurrently modified message is given up on
const MAX_SAVE_ATTEMPTS: usize = 3;

/// Callback event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    Delivered,
    Bounced,
    Read,
    Opened,
    Clicked,
    Unsubscribed,
}

/// Provider callback body
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCallback {
    pub tracking_id: String,
    pub event: CallbackKind,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ProviderCallback {
    fn delivery_event(&self) -> DeliveryEvent {
        match self.event {
            CallbackKind::Delivered => DeliveryEvent::Delivered,
            CallbackKind::Bounced => DeliveryEvent::Bounced {
                reason: self.reason.clone(),
            },
            CallbackKind::Read => DeliveryEvent::ReadReceipt,
            CallbackKind::Opened => DeliveryEvent::Opened,
            CallbackKind::Clicked => DeliveryEvent::Clicked,
            CallbackKind::Unsubscribed => DeliveryEvent::Unsubscribed,
        }
    }
}

/// Applies provider callbacks to stored messages
pub struct DeliveryTracker {
    messages: MessageRepository,
    compliance: ComplianceGate,
    settings: watch::Receiver<Arc<DeliveryConfig>>,
    webhooks: Option<Arc<WebhookNotifier>>,
}

impl DeliveryTracker {
    pub fn new(
        messages: MessageRepository,
        compliance: ComplianceGate,
        settings: watch::Receiver<Arc<DeliveryConfig>>,
    ) -> Self {
        Self {
            messages,
            compliance,
            settings,
            webhooks: None,
        }
    }

    pub fn with_webhooks(mut self, webhooks: Arc<WebhookNotifier>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    /// Apply one callback. Unknown tracking ids are `NotFound`; events that
    /// do not fit the current status are `InvalidTransition`.
    pub async fn record(&self, channel: Channel, callback: &ProviderCallback) -> Result<Message> {
        let config = self.settings.borrow().clone();
        let policy = RetryPolicy::from_config(&config);

        for _ in 0..MAX_SAVE_ATTEMPTS {
            let stored = self
                .messages
                .find_by_tracking_id(channel, &callback.tracking_id)
                .await
                .map_err(db_error)?
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "No {} message with tracking id {}",
                        channel, callback.tracking_id
                    ))
                })?;

            let expected = stored.status;
            let mut message = stored;
            let transition =
                lifecycle::apply(&mut message, callback.delivery_event(), &policy, Utc::now())?;

            if !self
                .messages
                .save_if_status(&message, expected)
                .await
                .map_err(db_error)?
            {
                debug!(message_id = %message.id, "Callback raced another update, retrying");
                continue;
            }

            info!(
                message_id = %message.id,
                event = ?callback.event,
                status = %message.status,
                "Provider callback applied"
            );

            if callback.event == CallbackKind::Unsubscribed {
                self.compliance
                    .opt_out(
                        &message.recipient_address,
                        callback.reason.as_deref(),
                        "unsubscribe_callback",
                        &config.default_country_code,
                    )
                    .await?;
            }

            if let (Some(event), Some(webhooks)) = (transition.notify, &self.webhooks) {
                webhooks.notify(event, &message);
            }

            return Ok(message);
        }

        warn!(tracking_id = %callback.tracking_id, "Callback dropped after repeated conflicts");
        Err(Error::Internal(format!(
            "Message with tracking id {} kept changing",
            callback.tracking_id
        )))
    }
}

fn db_error(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::ComplianceDecision;
    use clinicomm_storage::models::DeliveryStatus;
    use clinicomm_storage::repository::DbComplianceRepository;
    use clinicomm_storage::DatabasePool;
    use pretty_assertions::assert_eq;

    struct Harness {
        tracker: DeliveryTracker,
        messages: MessageRepository,
        gate: ComplianceGate,
        _settings: watch::Sender<Arc<DeliveryConfig>>,
    }

    async fn harness() -> Harness {
        let db = DatabasePool::in_memory().await.unwrap();
        let messages = MessageRepository::new(db.pool().clone());
        let gate = ComplianceGate::new(Arc::new(DbComplianceRepository::new(db)));
        let (sender, receiver) = watch::channel(Arc::new(DeliveryConfig::default()));

        Harness {
            tracker: DeliveryTracker::new(messages.clone(), gate.clone(), receiver),
            messages,
            gate,
            _settings: sender,
        }
    }

    async fn sent(messages: &MessageRepository, channel: Channel, address: &str) -> Message {
        let mut message = Message::draft(channel, "Ana", address, None, "Olá Ana", Utc::now());
        message.status = DeliveryStatus::Sent;
        message.sent_at = Some(Utc::now());
        message.tracking_id = Some(format!("trk-{}", message.id));
        assert!(messages.insert(&message).await.unwrap());
        message
    }

    fn callback(message: &Message, event: CallbackKind) -> ProviderCallback {
        ProviderCallback {
            tracking_id: message.tracking_id.clone().unwrap(),
            event,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_delivered_then_read_email() {
        let h = harness().await;
        let message = sent(&h.messages, Channel::Email, "ana@example.com").await;

        let delivered = h
            .tracker
            .record(Channel::Email, &callback(&message, CallbackKind::Delivered))
            .await
            .unwrap();
        assert_eq!(delivered.status, DeliveryStatus::Delivered);
        assert!(delivered.delivered_at.is_some());

        let read = h
            .tracker
            .record(Channel::Email, &callback(&message, CallbackKind::Read))
            .await
            .unwrap();
        assert_eq!(read.status, DeliveryStatus::Read);
        assert!(read.read_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_tracking_id_is_not_found() {
        let h = harness().await;
        let unknown = ProviderCallback {
            tracking_id: "missing".to_string(),
            event: CallbackKind::Delivered,
            reason: None,
        };

        assert!(matches!(
            h.tracker.record(Channel::Sms, &unknown).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bounce_after_terminal_is_rejected() {
        let h = harness().await;
        let message = sent(&h.messages, Channel::Sms, "5511999990000").await;

        h.tracker
            .record(Channel::Sms, &callback(&message, CallbackKind::Delivered))
            .await
            .unwrap();

        // Delivered is terminal for SMS
        assert!(matches!(
            h.tracker
                .record(Channel::Sms, &callback(&message, CallbackKind::Bounced))
                .await,
            Err(Error::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_callback_records_opt_out() {
        let h = harness().await;
        let message = sent(&h.messages, Channel::Email, "ana@example.com").await;

        let updated = h
            .tracker
            .record(Channel::Email, &callback(&message, CallbackKind::Unsubscribed))
            .await
            .unwrap();
        assert_eq!(updated.unsubscribes, 1);

        let decision = h.gate.check(Channel::Email, "ana@example.com").await.unwrap();
        match decision {
            ComplianceDecision::Suppress(entry) => assert_eq!(entry.source, "unsubscribe_callback"),
            ComplianceDecision::Allow => panic!("expected opt-out"),
        }
    }
}
