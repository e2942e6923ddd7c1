//! Template Catalog - CRUD, duplication and default resolution

use super::renderer::{is_known_variable, placeholders};
use chrono::Utc;
use clinicomm_common::types::{ClinicianId, TemplateId};
use clinicomm_common::{Channel, Error, Result};
use clinicomm_storage::models::{EventCategory, Template};
use clinicomm_storage::repository::{TemplateFilter, TemplateRepository};
use serde::Deserialize;
use sqlx::types::Json;
use std::collections::BTreeSet;
use tracing::info;
use uuid::Uuid;

/// Input for creating a template
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTemplate {
    pub name: String,
    pub channel: Channel,
    pub category: EventCategory,
    #[serde(default)]
    pub subject: Option<String>,
    pub content: String,
    #[serde(default)]
    pub owner_id: Option<ClinicianId>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Partial template update
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTemplate {
    pub name: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub active: Option<bool>,
}

/// Template catalog
#[derive(Clone)]
pub struct TemplateCatalog {
    repo: TemplateRepository,
}

impl TemplateCatalog {
    pub fn new(repo: TemplateRepository) -> Self {
        Self { repo }
    }

    /// Validate and store a new template
    pub async fn create(&self, input: CreateTemplate) -> Result<Template> {
        let variables = validate(
            &input.name,
            input.channel,
            input.subject.as_deref(),
            &input.content,
        )?;

        let now = Utc::now();
        let template = Template {
            id: Uuid::now_v7(),
            name: input.name.trim().to_string(),
            channel: input.channel,
            category: input.category,
            subject: input.subject,
            content: input.content,
            variables: Json(variables),
            active: input.active,
            is_default: false,
            owner_id: input.owner_id,
            created_at: now,
            updated_at: now,
        };

        self.repo.create(&template).await.map_err(db_error)?;
        info!(template_id = %template.id, channel = %template.channel, "Template created");

        Ok(template)
    }

    pub async fn get(&self, id: TemplateId) -> Result<Template> {
        self.repo
            .get(id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| Error::NotFound(format!("Template {} not found", id)))
    }

    pub async fn list(&self, filter: &TemplateFilter) -> Result<Vec<Template>> {
        self.repo.list(filter).await.map_err(db_error)
    }

    /// Apply a partial update. Messages already rendered keep their content.
    pub async fn update(&self, id: TemplateId, input: UpdateTemplate) -> Result<Template> {
        let mut template = self.get(id).await?;

        if let Some(name) = input.name {
            template.name = name.trim().to_string();
        }
        if let Some(subject) = input.subject {
            template.subject = Some(subject);
        }
        if let Some(content) = input.content {
            template.content = content;
        }
        if let Some(active) = input.active {
            template.active = active;
        }

        let variables = validate(
            &template.name,
            template.channel,
            template.subject.as_deref(),
            &template.content,
        )?;
        template.variables = Json(variables);
        template.updated_at = Utc::now();

        if !self.repo.update(&template).await.map_err(db_error)? {
            return Err(Error::NotFound(format!("Template {} not found", id)));
        }

        Ok(template)
    }

    pub async fn delete(&self, id: TemplateId) -> Result<()> {
        if !self.repo.delete(id).await.map_err(db_error)? {
            return Err(Error::NotFound(format!("Template {} not found", id)));
        }
        info!(template_id = %id, "Template deleted");
        Ok(())
    }

    /// Copy a template under a new name. The copy is never a default.
    pub async fn duplicate(&self, id: TemplateId) -> Result<Template> {
        let source = self.get(id).await?;
        let now = Utc::now();

        let copy = Template {
            id: Uuid::now_v7(),
            name: format!("{} (copy)", source.name),
            is_default: false,
            created_at: now,
            updated_at: now,
            ..source
        };

        self.repo.create(&copy).await.map_err(db_error)?;
        Ok(copy)
    }

    /// Make a template the default for its owner, channel and category
    pub async fn set_default(&self, id: TemplateId) -> Result<Template> {
        let mut template = self.get(id).await?;
        if !template.active {
            return Err(Error::Validation(
                "An inactive template cannot be the default".to_string(),
            ));
        }

        self.repo.set_default(&template).await.map_err(db_error)?;
        template.is_default = true;
        Ok(template)
    }

    /// Pick the template for a send: the explicit id, else the owner's
    /// default for the category, else the shared default.
    pub async fn resolve(
        &self,
        template_id: Option<TemplateId>,
        owner_id: Option<ClinicianId>,
        channel: Channel,
        category: EventCategory,
    ) -> Result<Template> {
        if let Some(id) = template_id {
            let template = self.get(id).await?;
            if template.channel != channel {
                return Err(Error::Validation(format!(
                    "Template {} is for channel {}, not {}",
                    id, template.channel, channel
                )));
            }
            if !template.active {
                return Err(Error::Validation(format!("Template {} is inactive", id)));
            }
            return Ok(template);
        }

        if owner_id.is_some() {
            if let Some(template) = self
                .repo
                .find_default(owner_id, channel, category)
                .await
                .map_err(db_error)?
            {
                return Ok(template);
            }
        }

        self.repo
            .find_default(None, channel, category)
            .await
            .map_err(db_error)?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "No default {} template for {:?}",
                    channel, category
                ))
            })
    }
}

/// Check a template definition and return its declared variables
fn validate(
    name: &str,
    channel: Channel,
    subject: Option<&str>,
    content: &str,
) -> Result<Vec<String>> {
    if name.trim().is_empty() {
        return Err(Error::Validation("Template name is required".to_string()));
    }
    if content.trim().is_empty() {
        return Err(Error::Validation("Template content is required".to_string()));
    }
    if subject.is_some() && !channel.supports_subject() {
        return Err(Error::Validation(format!(
            "Channel {} does not support a subject",
            channel
        )));
    }

    let mut names: BTreeSet<String> = placeholders(content);
    if let Some(subject) = subject {
        names.extend(placeholders(subject));
    }

    let unknown: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| !is_known_variable(name))
        .collect();
    if !unknown.is_empty() {
        return Err(Error::Validation(format!(
            "Unknown template variables: {}",
            unknown.join(", ")
        )));
    }

    Ok(names.into_iter().collect())
}

fn db_error(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinicomm_storage::DatabasePool;
    use pretty_assertions::assert_eq;

    async fn catalog() -> TemplateCatalog {
        let db = DatabasePool::in_memory().await.unwrap();
        TemplateCatalog::new(TemplateRepository::new(db.pool().clone()))
    }

    fn reminder(owner_id: Option<Uuid>) -> CreateTemplate {
        CreateTemplate {
            name: "Lembrete 24h".to_string(),
            channel: Channel::Email,
            category: EventCategory::Reminder,
            subject: Some("Consulta {{appointmentDate}}".to_string()),
            content: "Olá {{patientName}}, sua consulta é em {{appointmentDate}}".to_string(),
            owner_id,
            active: true,
        }
    }

    #[tokio::test]
    async fn test_create_derives_variables() {
        let catalog = catalog().await;
        let template = catalog.create(reminder(None)).await.unwrap();

        assert_eq!(
            template.variables.0,
            vec!["appointmentDate".to_string(), "patientName".to_string()]
        );
        assert!(!template.is_default);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_variable() {
        let catalog = catalog().await;
        let mut input = reminder(None);
        input.content = "Olá {{nome}}".to_string();

        let err = catalog.create(input).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_create_rejects_subject_on_sms() {
        let catalog = catalog().await;
        let mut input = reminder(None);
        input.channel = Channel::Sms;

        assert!(matches!(
            catalog.create(input).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_is_never_default() {
        let catalog = catalog().await;
        let original = catalog.create(reminder(None)).await.unwrap();
        catalog.set_default(original.id).await.unwrap();

        let copy = catalog.duplicate(original.id).await.unwrap();
        assert_eq!(copy.name, "Lembrete 24h (copy)");
        assert!(!copy.is_default);
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.content, original.content);
    }

    #[tokio::test]
    async fn test_resolve_prefers_owner_default() {
        let catalog = catalog().await;
        let owner = Uuid::new_v4();

        let shared = catalog.create(reminder(None)).await.unwrap();
        catalog.set_default(shared.id).await.unwrap();

        let resolved = catalog
            .resolve(None, Some(owner), Channel::Email, EventCategory::Reminder)
            .await
            .unwrap();
        assert_eq!(resolved.id, shared.id);

        let own = catalog.create(reminder(Some(owner))).await.unwrap();
        catalog.set_default(own.id).await.unwrap();

        let resolved = catalog
            .resolve(None, Some(owner), Channel::Email, EventCategory::Reminder)
            .await
            .unwrap();
        assert_eq!(resolved.id, own.id);
    }

    #[tokio::test]
    async fn test_resolve_explicit_id_checks_channel() {
        let catalog = catalog().await;
        let template = catalog.create(reminder(None)).await.unwrap();

        let err = catalog
            .resolve(Some(template.id), None, Channel::Sms, EventCategory::Reminder)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_revalidates() {
        let catalog = catalog().await;
        let template = catalog.create(reminder(None)).await.unwrap();

        let updated = catalog
            .update(
                template.id,
                UpdateTemplate {
                    content: Some("{{clinicianName}} aguarda {{patientName}}".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            updated.variables.0,
            vec![
                "appointmentDate".to_string(),
                "clinicianName".to_string(),
                "patientName".to_string()
            ]
        );

        let err = catalog
            .update(
                template.id,
                UpdateTemplate {
                    content: Some("   ".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
