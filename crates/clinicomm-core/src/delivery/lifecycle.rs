//! Delivery State Machine
//!
//! Pure transition logic over [`Message`]. No I/O and no clocks: callers pass
//! `now`, persist the mutated message, act on the returned [`Directive`] and
//! emit the returned webhook event.
//!
//! ```text
//! draft -> scheduled -> sending -> sent -> delivered -> read (email)
//!                 |          |        \-> bounced
//!                 |          |-> failed_retryable -> sending ...
//!                 |          \-> failed_terminal
//!                 \-> cancelled
//! ```
//!
//! A read receipt that arrives while the message is still `sent` implies
//! delivery: `delivered_at` is stamped and the status becomes `read`.

use chrono::{DateTime, Duration, Utc};
use clinicomm_common::{Channel, DeliveryConfig};
use clinicomm_storage::models::{DeliveryStatus, FailureReason, Message};
use serde::Serialize;
use serde_json::Value;
use sqlx::types::Json;

/// Input driving a transition
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    /// Accepted for scheduling
    Schedule,
    /// Claimed by a dispatch task
    Claim,
    Accepted {
        provider_message_id: Option<String>,
        response: Value,
    },
    Rejected {
        reason: String,
    },
    TransientError {
        reason: String,
    },
    InvalidAddress {
        reason: String,
    },
    /// Recipient is on the opt-out list
    Suppressed,
    ChannelDisabled,
    Delivered,
    Bounced {
        reason: Option<String>,
    },
    ReadReceipt,
    Opened,
    Clicked,
    Unsubscribed,
    Cancel,
}

impl DeliveryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryEvent::Schedule => "schedule",
            DeliveryEvent::Claim => "claim",
            DeliveryEvent::Accepted { .. } => "accepted",
            DeliveryEvent::Rejected { .. } => "rejected",
            DeliveryEvent::TransientError { .. } => "transient_error",
            DeliveryEvent::InvalidAddress { .. } => "invalid_address",
            DeliveryEvent::Suppressed => "suppressed",
            DeliveryEvent::ChannelDisabled => "channel_disabled",
            DeliveryEvent::Delivered => "delivered",
            DeliveryEvent::Bounced { .. } => "bounced",
            DeliveryEvent::ReadReceipt => "read",
            DeliveryEvent::Opened => "opened",
            DeliveryEvent::Clicked => "clicked",
            DeliveryEvent::Unsubscribed => "unsubscribed",
            DeliveryEvent::Cancel => "cancel",
        }
    }
}

/// Instruction for the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Put the message back in the pending set, due at `at`
    Requeue { at: DateTime<Utc> },
}

/// Event published to webhook subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WebhookEvent {
    #[serde(rename = "message.sent")]
    Sent,
    #[serde(rename = "message.delivered")]
    Delivered,
    #[serde(rename = "message.failed")]
    Failed,
    #[serde(rename = "message.bounced")]
    Bounced,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::Sent => "message.sent",
            WebhookEvent::Delivered => "message.delivered",
            WebhookEvent::Failed => "message.failed",
            WebhookEvent::Bounced => "message.bounced",
        }
    }
}

impl std::fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry budget taken from the delivery settings snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total provider attempts before giving up
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts,
            delay: config.retry_delay(),
        }
    }
}

/// Outcome of applying an event
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub previous: DeliveryStatus,
    pub status: DeliveryStatus,
    pub directive: Option<Directive>,
    pub notify: Option<WebhookEvent>,
}

impl Transition {
    /// Whether the status changed
    pub fn changed(&self) -> bool {
        self.previous != self.status
    }
}

/// Event not allowed in the current status
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot apply '{event}' to a message in status '{status}'")]
pub struct TransitionError {
    pub status: DeliveryStatus,
    pub event: &'static str,
}

impl From<TransitionError> for clinicomm_common::Error {
    fn from(err: TransitionError) -> Self {
        clinicomm_common::Error::InvalidTransition(err.to_string())
    }
}

/// Apply `event` to `message`, mutating it in place
pub fn apply(
    message: &mut Message,
    event: DeliveryEvent,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    use DeliveryStatus::*;

    let previous = message.status;
    let invalid = TransitionError {
        status: previous,
        event: event.name(),
    };
    let mut directive = None;
    let mut notify = None;

    match event {
        DeliveryEvent::Schedule => {
            if previous != Draft {
                return Err(invalid);
            }
            if message.scheduled_for < now {
                message.scheduled_for = now;
            }
            message.status = Scheduled;
        }

        DeliveryEvent::Claim => {
            if !matches!(previous, Scheduled | FailedRetryable) {
                return Err(invalid);
            }
            message.status = Sending;
            message.next_retry_at = None;
        }

        DeliveryEvent::Accepted {
            provider_message_id,
            response,
        } => {
            if previous != Sending {
                return Err(invalid);
            }
            message.status = Sent;
            message.sent_at = Some(now);
            message.tracking_id = provider_message_id;
            message.provider_response = Some(Json(response));
            message.failure_reason = None;
            notify = Some(WebhookEvent::Sent);
        }

        DeliveryEvent::Rejected { reason } => {
            if previous != Sending {
                return Err(invalid);
            }
            fail_terminal(message, FailureReason::ProviderRejected, reason, now);
            notify = Some(WebhookEvent::Failed);
        }

        DeliveryEvent::TransientError { reason } => {
            if previous != Sending {
                return Err(invalid);
            }
            let attempts = u32::try_from(message.retry_count).unwrap_or(0) + 1;
            if attempts < policy.max_attempts {
                let at = now + policy.delay;
                message.status = FailedRetryable;
                message.retry_count = attempts as i32;
                message.next_retry_at = Some(at);
                message.error_message = Some(reason);
                directive = Some(Directive::Requeue { at });
            } else {
                message.retry_count = attempts.min(policy.max_attempts) as i32;
                fail_terminal(message, FailureReason::RetriesExhausted, reason, now);
                notify = Some(WebhookEvent::Failed);
            }
        }

        DeliveryEvent::InvalidAddress { reason } => {
            if !matches!(previous, Draft | Scheduled | Sending) {
                return Err(invalid);
            }
            fail_terminal(message, FailureReason::InvalidAddress, reason, now);
            notify = Some(WebhookEvent::Failed);
        }

        DeliveryEvent::Suppressed => {
            if !matches!(previous, Draft | Scheduled | Sending) {
                return Err(invalid);
            }
            fail_terminal(
                message,
                FailureReason::OptedOut,
                "Recipient opted out".to_string(),
                now,
            );
            notify = Some(WebhookEvent::Failed);
        }

        DeliveryEvent::ChannelDisabled => {
            if !matches!(previous, Draft | Scheduled | Sending) {
                return Err(invalid);
            }
            let reason = format!("Channel {} is disabled", message.channel);
            fail_terminal(message, FailureReason::ChannelDisabled, reason, now);
            notify = Some(WebhookEvent::Failed);
        }

        DeliveryEvent::Delivered => {
            if previous != Sent {
                return Err(invalid);
            }
            message.status = Delivered;
            message.delivered_at = Some(now);
            notify = Some(WebhookEvent::Delivered);
        }

        DeliveryEvent::Bounced { reason } => {
            let bounceable = previous == Sent || (previous == Delivered && !message.is_terminal());
            if !bounceable {
                return Err(invalid);
            }
            message.status = Bounced;
            message.bounce_reason = reason;
            message.failed_at = Some(now);
            notify = Some(WebhookEvent::Bounced);
        }

        DeliveryEvent::ReadReceipt => {
            notify = read_receipt(message, now).map_err(|_| invalid)?;
        }

        DeliveryEvent::Opened => {
            if !matches!(previous, Sent | Delivered | Read) {
                return Err(invalid);
            }
            message.opens += 1;
            if message.channel == Channel::Email && matches!(previous, Sent | Delivered) {
                notify = read_receipt(message, now).map_err(|_| invalid)?;
            }
        }

        DeliveryEvent::Clicked => {
            if !previous.was_sent() {
                return Err(invalid);
            }
            message.clicks += 1;
        }

        DeliveryEvent::Unsubscribed => {
            if !previous.was_sent() {
                return Err(invalid);
            }
            message.unsubscribes += 1;
        }

        DeliveryEvent::Cancel => {
            if !matches!(previous, Draft | Scheduled | FailedRetryable) {
                return Err(invalid);
            }
            message.status = Cancelled;
            message.next_retry_at = None;
        }
    }

    message.updated_at = now;

    Ok(Transition {
        previous,
        status: message.status,
        directive,
        notify,
    })
}

fn fail_terminal(message: &mut Message, reason: FailureReason, error: String, now: DateTime<Utc>) {
    message.status = DeliveryStatus::FailedTerminal;
    message.failure_reason = Some(reason);
    message.error_message = Some(error);
    message.failed_at = Some(now);
    message.next_retry_at = None;
}

/// Read receipt handling per channel. Email moves to `read`. The messaging
/// app records `read_at` and treats a receipt on `sent` as delivery. SMS has
/// no read state.
fn read_receipt(message: &mut Message, now: DateTime<Utc>) -> Result<Option<WebhookEvent>, ()> {
    use DeliveryStatus::*;

    match message.channel {
        Channel::Email => match message.status {
            Sent => {
                message.delivered_at.get_or_insert(now);
                message.read_at = Some(now);
                message.status = Read;
                Ok(Some(WebhookEvent::Delivered))
            }
            Delivered => {
                message.read_at = Some(now);
                message.status = Read;
                Ok(None)
            }
            _ => Err(()),
        },
        Channel::MessagingApp => match message.status {
            Sent => {
                message.delivered_at.get_or_insert(now);
                message.read_at = Some(now);
                message.status = Delivered;
                Ok(Some(WebhookEvent::Delivered))
            }
            Delivered | Read => {
                message.read_at.get_or_insert(now);
                Ok(None)
            }
            _ => Err(()),
        },
        Channel::Sms => {
            if message.status.was_sent() {
                Ok(None)
            } else {
                Err(())
            }
        }
    }
}
