//! Automation Trigger Engine
//!
//! Turns a domain event (appointment created, payment due, ...) into one
//! scheduled message per offset and channel. Each combination is
//! idempotent: firing the same event again returns the existing message.

use crate::delivery::{ScheduleOutcome, Scheduler};
use crate::templates::{render_template, TemplateCatalog};
use chrono::{DateTime, Duration, Utc};
use clinicomm_common::types::{ClinicianId, MessageId, TemplateId, VariableMap};
use clinicomm_common::{Channel, Error, Result};
use clinicomm_storage::models::{DeliveryStatus, Message, TriggerType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Events whose timestamp is this far in the past still fire now
const PAST_GRACE_MINUTES: i64 = 5;

/// Domain event reported by a collaborator
#[derive(Debug, Clone, Deserialize)]
pub struct DomainEvent {
    pub event_type: TriggerType,
    pub entity_id: String,
    /// Appointment start, payment due date, ...
    pub occurs_at: DateTime<Utc>,
}

/// Patient contact data
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerRecipient {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl TriggerRecipient {
    fn address(&self, channel: Channel) -> Option<&str> {
        let address = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms | Channel::MessagingApp => self.phone.as_deref(),
        };
        address.filter(|a| !a.trim().is_empty())
    }
}

/// Trigger request
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    #[serde(flatten)]
    pub event: DomainEvent,
    pub recipient: TriggerRecipient,
    #[serde(default)]
    pub variables: VariableMap,
    /// Hours before `occurs_at`; negative values fire after it. Empty means `[0]`.
    #[serde(default)]
    pub hours_before: Vec<i32>,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    #[serde(default)]
    pub owner_id: Option<ClinicianId>,
}

/// One offset and channel combination that produced a message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggeredMessage {
    pub message_id: MessageId,
    pub channel: Channel,
    pub hours_before: i32,
    pub scheduled_for: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl TriggeredMessage {
    fn from_message(message: &Message, hours_before: i32) -> Self {
        Self {
            message_id: message.id,
            channel: message.channel,
            hours_before,
            scheduled_for: message.scheduled_for,
            status: message.status,
        }
    }
}

/// Why a combination produced no message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "code", content = "detail")]
pub enum SkipReason {
    InPast,
    MissingAddress,
    NoTemplate(String),
    RenderError(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedTrigger {
    pub channel: Channel,
    pub hours_before: i32,
    pub reason: SkipReason,
}

/// Outcome of one trigger request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerReport {
    pub scheduled: Vec<TriggeredMessage>,
    pub duplicates: Vec<TriggeredMessage>,
    /// Stored as failed at scheduling (opted out, invalid address, channel off)
    pub failed: Vec<TriggeredMessage>,
    pub skipped: Vec<SkippedTrigger>,
}

/// Trigger engine
pub struct TriggerEngine {
    catalog: TemplateCatalog,
    scheduler: Arc<Scheduler>,
}

impl TriggerEngine {
    pub fn new(catalog: TemplateCatalog, scheduler: Arc<Scheduler>) -> Self {
        Self { catalog, scheduler }
    }

    /// Fire a domain event at `now`
    pub async fn fire(&self, request: TriggerRequest, now: DateTime<Utc>) -> Result<TriggerReport> {
        if request.event.entity_id.trim().is_empty() {
            return Err(Error::Validation("entity_id is required".to_string()));
        }
        if request.channels.is_empty() {
            return Err(Error::Validation("At least one channel is required".to_string()));
        }

        let explicit = match request.template_id {
            Some(id) => Some(self.catalog.get(id).await?),
            None => None,
        };
        let variables = merged_variables(&request);
        let category = request.event.event_type.category();
        let offsets = if request.hours_before.is_empty() {
            vec![0]
        } else {
            request.hours_before.clone()
        };

        let mut report = TriggerReport::default();

        for &hours_before in &offsets {
            for &channel in &request.channels {
                let skip = |reason| SkippedTrigger {
                    channel,
                    hours_before,
                    reason,
                };

                let due = request.event.occurs_at - Duration::hours(i64::from(hours_before));
                if due < now - Duration::minutes(PAST_GRACE_MINUTES) {
                    report.skipped.push(skip(SkipReason::InPast));
                    continue;
                }

                let Some(address) = request.recipient.address(channel) else {
                    report.skipped.push(skip(SkipReason::MissingAddress));
                    continue;
                };

                let template_id = explicit
                    .as_ref()
                    .filter(|t| t.channel == channel)
                    .map(|t| t.id);
                let template = match self
                    .catalog
                    .resolve(template_id, request.owner_id, channel, category)
                    .await
                {
                    Ok(template) => template,
                    Err(Error::NotFound(detail)) | Err(Error::Validation(detail)) => {
                        report.skipped.push(skip(SkipReason::NoTemplate(detail)));
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let rendered = match render_template(&template, &variables) {
                    Ok(rendered) => rendered,
                    Err(crate::templates::RenderError::MissingVariables(names)) => {
                        report.skipped.push(skip(SkipReason::RenderError(names)));
                        continue;
                    }
                };

                let mut message = Message::draft(
                    channel,
                    request.recipient.name.clone(),
                    address,
                    rendered.subject,
                    rendered.content,
                    due.max(now),
                );
                message.template_id = Some(template.id);
                message.trigger_type = Some(request.event.event_type);
                message.trigger_entity_id = Some(request.event.entity_id.clone());
                message.trigger_hours_before = Some(hours_before);

                match self.scheduler.schedule(message).await? {
                    ScheduleOutcome::Scheduled(m) => {
                        report.scheduled.push(TriggeredMessage::from_message(&m, hours_before))
                    }
                    ScheduleOutcome::Duplicate(m) => {
                        report.duplicates.push(TriggeredMessage::from_message(&m, hours_before))
                    }
                    ScheduleOutcome::Failed(m) => {
                        report.failed.push(TriggeredMessage::from_message(&m, hours_before))
                    }
                }
            }
        }

        for skipped in &report.skipped {
            debug!(
                entity_id = %request.event.entity_id,
                channel = %skipped.channel,
                hours_before = skipped.hours_before,
                reason = ?skipped.reason,
                "Trigger combination skipped"
            );
        }
        info!(
            event_type = ?request.event.event_type,
            entity_id = %request.event.entity_id,
            scheduled = report.scheduled.len(),
            duplicates = report.duplicates.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Trigger processed"
        );

        Ok(report)
    }
}

/// Caller variables, with patient contact fields filled in when absent
fn merged_variables(request: &TriggerRequest) -> VariableMap {
    let mut variables = request.variables.clone();
    let recipient = &request.recipient;

    variables
        .entry("patientName".to_string())
        .or_insert_with(|| recipient.name.clone());
    if let Some(email) = &recipient.email {
        variables
            .entry("patientEmail".to_string())
            .or_insert_with(|| email.clone());
    }
    if let Some(phone) = &recipient.phone {
        variables
            .entry("patientPhone".to_string())
            .or_insert_with(|| phone.clone());
    }

    variables
}
