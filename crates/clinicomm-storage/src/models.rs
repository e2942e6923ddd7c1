//! Database models for ClinicComm

use chrono::{DateTime, Utc};
use clinicomm_common::types::{ClinicianId, MessageId, TemplateId, WebhookId};
use clinicomm_common::{Channel, DeliveryConfig};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

// ============================================================================
// Message lifecycle
// ============================================================================

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Draft,
    Scheduled,
    /// Claimed by a dispatch task; the provider call is binding from here on
    Sending,
    Sent,
    Delivered,
    Read,
    FailedRetryable,
    FailedTerminal,
    Bounced,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Draft => "draft",
            DeliveryStatus::Scheduled => "scheduled",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::FailedRetryable => "failed_retryable",
            DeliveryStatus::FailedTerminal => "failed_terminal",
            DeliveryStatus::Bounced => "bounced",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the status can never change again on the given channel.
    ///
    /// `delivered` is final except on email, where a read receipt may follow.
    pub fn is_terminal(&self, channel: Channel) -> bool {
        match self {
            DeliveryStatus::Read
            | DeliveryStatus::Bounced
            | DeliveryStatus::Cancelled
            | DeliveryStatus::FailedTerminal => true,
            DeliveryStatus::Delivered => !channel.tracks_read_status(),
            _ => false,
        }
    }

    /// Whether the message still waits in the scheduler
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Scheduled | DeliveryStatus::FailedRetryable | DeliveryStatus::Sending
        )
    }

    /// Whether the provider accepted the message at some point
    pub fn was_sent(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent
                | DeliveryStatus::Delivered
                | DeliveryStatus::Read
                | DeliveryStatus::Bounced
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(DeliveryStatus::Draft),
            "scheduled" => Ok(DeliveryStatus::Scheduled),
            "sending" => Ok(DeliveryStatus::Sending),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed_retryable" => Ok(DeliveryStatus::FailedRetryable),
            "failed_terminal" => Ok(DeliveryStatus::FailedTerminal),
            "bounced" => Ok(DeliveryStatus::Bounced),
            "cancelled" => Ok(DeliveryStatus::Cancelled),
            _ => Err(format!("Invalid delivery status: {}", s)),
        }
    }
}

/// Reason code recorded with a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidAddress,
    ProviderRejected,
    RetriesExhausted,
    OptedOut,
    ChannelDisabled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InvalidAddress => "invalid_address",
            FailureReason::ProviderRejected => "provider_rejected",
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::OptedOut => "opted_out",
            FailureReason::ChannelDisabled => "channel_disabled",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Triggers and templates
// ============================================================================

/// Domain event that can schedule messages automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    AppointmentCreated,
    AppointmentReminder,
    AppointmentCancelled,
    AppointmentRescheduled,
    PaymentDue,
    PaymentReceived,
    FollowUp,
}

impl TriggerType {
    /// Template category used for this event
    pub fn category(&self) -> EventCategory {
        match self {
            TriggerType::AppointmentCreated => EventCategory::Confirmation,
            TriggerType::AppointmentReminder => EventCategory::Reminder,
            TriggerType::AppointmentCancelled => EventCategory::Cancellation,
            TriggerType::AppointmentRescheduled => EventCategory::Rescheduling,
            TriggerType::PaymentDue => EventCategory::Billing,
            TriggerType::PaymentReceived => EventCategory::PaymentConfirmation,
            TriggerType::FollowUp => EventCategory::FollowUp,
        }
    }
}

/// Template event category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Confirmation,
    Reminder,
    Cancellation,
    Rescheduling,
    Billing,
    PaymentConfirmation,
    FollowUp,
    General,
}

/// File attached to an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Base64 encoded body
    pub content_base64: String,
}

/// Message model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: Channel,
    pub recipient_name: String,
    pub recipient_address: String,
    pub subject: Option<String>,
    pub content: String,
    pub attachments: Json<Vec<Attachment>>,
    pub status: DeliveryStatus,
    pub scheduled_for: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub bounce_reason: Option<String>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub provider_response: Option<Json<serde_json::Value>>,
    pub tracking_id: Option<String>,
    pub opens: i32,
    pub clicks: i32,
    pub unsubscribes: i32,
    pub template_id: Option<TemplateId>,
    pub trigger_type: Option<TriggerType>,
    pub trigger_entity_id: Option<String>,
    pub trigger_hours_before: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Create a draft message with no lifecycle data yet
    pub fn draft(
        channel: Channel,
        recipient_name: impl Into<String>,
        recipient_address: impl Into<String>,
        subject: Option<String>,
        content: impl Into<String>,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7(),
            channel,
            recipient_name: recipient_name.into(),
            recipient_address: recipient_address.into(),
            subject: if channel.supports_subject() { subject } else { None },
            content: content.into(),
            attachments: Json(Vec::new()),
            status: DeliveryStatus::Draft,
            scheduled_for,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            error_message: None,
            failure_reason: None,
            bounce_reason: None,
            retry_count: 0,
            next_retry_at: None,
            provider_response: None,
            tracking_id: None,
            opens: 0,
            clicks: 0,
            unsubscribes: 0,
            template_id: None,
            trigger_type: None,
            trigger_entity_id: None,
            trigger_hours_before: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Time at which the scheduler should fire this message
    pub fn due_at(&self) -> DateTime<Utc> {
        match self.status {
            DeliveryStatus::FailedRetryable => self.next_retry_at.unwrap_or(self.scheduled_for),
            _ => self.scheduled_for,
        }
    }

    /// Whether the message reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal(self.channel)
    }
}

/// Template model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub channel: Channel,
    pub category: EventCategory,
    pub subject: Option<String>,
    pub content: String,
    pub variables: Json<Vec<String>>,
    pub active: bool,
    pub is_default: bool,
    pub owner_id: Option<ClinicianId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Compliance, webhooks and settings
// ============================================================================

/// Opt-out entry keyed by normalized address
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ComplianceEntry {
    pub address: String,
    pub reason: Option<String>,
    pub source: String,
    pub opted_out_at: DateTime<Utc>,
}

/// Webhook registration
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub id: WebhookId,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub events: Json<Vec<String>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookRegistration {
    /// Whether the registration subscribes to an event name
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event || e == "*")
    }
}

/// Stored delivery settings row
#[derive(Debug, Clone, FromRow)]
pub struct StoredDeliveryConfig {
    pub settings: Json<DeliveryConfig>,
    pub updated_at: DateTime<Utc>,
}
