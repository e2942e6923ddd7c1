//! Message delivery
//!
//! - `lifecycle`: pure state machine over stored messages
//! - `scheduler`: pending set, dispatch tasks and the timing loop
//! - `tracking`: provider callbacks (receipts, bounces, engagement)

pub mod lifecycle;
pub mod scheduler;
pub mod tracking;

pub use lifecycle::{
    apply, DeliveryEvent, Directive, RetryPolicy, Transition, TransitionError, WebhookEvent,
};
pub use scheduler::{ScheduleOutcome, Scheduler};
pub use tracking::{CallbackKind, DeliveryTracker, ProviderCallback};

use crate::templates::{render, render_template, TemplateCatalog};
use chrono::{DateTime, Utc};
use clinicomm_common::types::{TemplateId, VariableMap};
use clinicomm_common::{Channel, Error, Result};
use clinicomm_storage::models::{Attachment, Message};
use serde::Deserialize;
use sqlx::types::Json;

/// Recipient of a direct message
#[derive(Debug, Clone, Deserialize)]
pub struct Recipient {
    pub name: String,
    pub address: String,
}

/// Direct schedule request.
///
/// Either `template_id` or `content` must be given. Raw content may use
/// placeholders too; they are filled from `variables`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRequest {
    pub channel: Channel,
    pub recipient: Recipient,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    #[serde(default)]
    pub variables: VariableMap,
    /// Defaults to now
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Build a draft from a direct request. Nothing is stored.
pub async fn compose(request: MessageRequest, catalog: &TemplateCatalog) -> Result<Message> {
    if request.recipient.address.trim().is_empty() {
        return Err(Error::Validation("Recipient address is required".to_string()));
    }
    if request.channel == Channel::Sms && !request.attachments.is_empty() {
        return Err(Error::Validation("SMS messages cannot carry attachments".to_string()));
    }

    let (subject, content, template_id) = match (request.template_id, request.content) {
        (Some(id), _) => {
            let template = catalog.get(id).await?;
            if template.channel != request.channel {
                return Err(Error::Validation(format!(
                    "Template {} is for channel {}, not {}",
                    id, template.channel, request.channel
                )));
            }
            if !template.active {
                return Err(Error::Validation(format!("Template {} is inactive", id)));
            }
            let rendered = render_template(&template, &request.variables)?;
            (rendered.subject, rendered.content, Some(id))
        }
        (None, Some(content)) if !content.trim().is_empty() => {
            let subject = request
                .subject
                .as_deref()
                .map(|s| render(s, &request.variables))
                .transpose()?;
            (subject, render(&content, &request.variables)?, None)
        }
        _ => {
            return Err(Error::Validation(
                "Either template_id or content is required".to_string(),
            ))
        }
    };

    if request.channel == Channel::Email && subject.as_deref().map_or(true, str::is_empty) {
        return Err(Error::Validation("Email messages need a subject".to_string()));
    }

    let mut message = Message::draft(
        request.channel,
        request.recipient.name,
        request.recipient.address,
        subject,
        content,
        request.scheduled_for.unwrap_or_else(Utc::now),
    );
    message.template_id = template_id;
    message.attachments = Json(request.attachments);

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::CreateTemplate;
    use clinicomm_storage::models::EventCategory;
    use clinicomm_storage::repository::TemplateRepository;
    use clinicomm_storage::DatabasePool;
    use pretty_assertions::assert_eq;

    async fn catalog() -> TemplateCatalog {
        let db = DatabasePool::in_memory().await.unwrap();
        TemplateCatalog::new(TemplateRepository::new(db.pool().clone()))
    }

    fn request(channel: Channel) -> MessageRequest {
        MessageRequest {
            channel,
            recipient: Recipient {
                name: "Carlos".to_string(),
                address: "carlos@example.com".to_string(),
            },
            subject: None,
            content: None,
            template_id: None,
            variables: VariableMap::new(),
            scheduled_for: None,
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_compose_from_template() {
        let catalog = catalog().await;
        let template = catalog
            .create(CreateTemplate {
                name: "Lembrete".to_string(),
                channel: Channel::Email,
                category: EventCategory::Reminder,
                subject: Some("Consulta em {{appointmentDate}}".to_string()),
                content: "Olá {{patientName}}".to_string(),
                owner_id: None,
                active: true,
            })
            .await
            .unwrap();

        let mut req = request(Channel::Email);
        req.template_id = Some(template.id);
        req.variables.insert("patientName".into(), "Carlos".into());
        req.variables.insert("appointmentDate".into(), "10/03/2025".into());

        let message = compose(req, &catalog).await.unwrap();
        assert_eq!(message.subject.as_deref(), Some("Consulta em 10/03/2025"));
        assert_eq!(message.content, "Olá Carlos");
        assert_eq!(message.template_id, Some(template.id));
    }

    #[tokio::test]
    async fn test_compose_reports_missing_variables() {
        let catalog = catalog().await;
        let mut req = request(Channel::Sms);
        req.content = Some("Olá {{patientName}}, pague em {{paymentLink}}".to_string());

        match compose(req, &catalog).await {
            Err(Error::Render(names)) => assert_eq!(names, vec!["patientName", "paymentLink"]),
            other => panic!("expected render error, got {:?}", other.map(|m| m.id)),
        }
    }

    #[tokio::test]
    async fn test_compose_requires_body_and_subject() {
        let catalog = catalog().await;
        assert!(matches!(
            compose(request(Channel::Sms), &catalog).await,
            Err(Error::Validation(_))
        ));

        let mut email = request(Channel::Email);
        email.content = Some("Olá".to_string());
        assert!(matches!(compose(email, &catalog).await, Err(Error::Validation(_))));
    }
}
