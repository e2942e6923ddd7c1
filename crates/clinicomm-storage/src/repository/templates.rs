//! Template repository

use chrono::Utc;
use clinicomm_common::types::{ClinicianId, TemplateId};
use clinicomm_common::Channel;
use sqlx::SqlitePool;

use crate::models::{EventCategory, Template};

/// Filter for listing templates
#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    pub owner_id: Option<ClinicianId>,
    pub channel: Option<Channel>,
    pub category: Option<EventCategory>,
    pub active_only: bool,
}

/// Template repository
#[derive(Clone)]
pub struct TemplateRepository {
    pool: SqlitePool,
}

impl TemplateRepository {
    /// Create a new template repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a template
    pub async fn create(&self, template: &Template) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO templates (
                id, name, channel, category, subject, content, variables,
                active, is_default, owner_id, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(template.channel)
        .bind(template.category)
        .bind(&template.subject)
        .bind(&template.content)
        .bind(&template.variables)
        .bind(template.active)
        .bind(template.is_default)
        .bind(template.owner_id)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a template by ID
    pub async fn get(&self, id: TemplateId) -> Result<Option<Template>, sqlx::Error> {
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List templates with optional filters
    pub async fn list(&self, filter: &TemplateFilter) -> Result<Vec<Template>, sqlx::Error> {
        sqlx::query_as::<_, Template>(
            r#"
            SELECT * FROM templates
            WHERE (?1 IS NULL OR owner_id = ?1)
              AND (?2 IS NULL OR channel = ?2)
              AND (?3 IS NULL OR category = ?3)
              AND (?4 = 0 OR active = 1)
            ORDER BY name ASC
            "#,
        )
        .bind(filter.owner_id)
        .bind(filter.channel)
        .bind(filter.category)
        .bind(filter.active_only)
        .fetch_all(&self.pool)
        .await
    }

    /// Update every editable field of a template
    pub async fn update(&self, template: &Template) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE templates SET
                name = ?,
                subject = ?,
                content = ?,
                variables = ?,
                active = ?,
                is_default = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.content)
        .bind(&template.variables)
        .bind(template.active)
        .bind(template.is_default)
        .bind(Utc::now())
        .bind(template.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a template
    pub async fn delete(&self, id: TemplateId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM templates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Make `id` the only default for its owner, channel and category
    pub async fn set_default(&self, template: &Template) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE templates SET is_default = 0, updated_at = ?
            WHERE channel = ? AND category = ? AND owner_id IS ? AND id <> ?
            "#,
        )
        .bind(now)
        .bind(template.channel)
        .bind(template.category)
        .bind(template.owner_id)
        .bind(template.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE templates SET is_default = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(template.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// Find the active default template for an owner (or the shared
    /// default when `owner_id` is `None`)
    pub async fn find_default(
        &self,
        owner_id: Option<ClinicianId>,
        channel: Channel,
        category: EventCategory,
    ) -> Result<Option<Template>, sqlx::Error> {
        sqlx::query_as::<_, Template>(
            r#"
            SELECT * FROM templates
            WHERE channel = ? AND category = ? AND owner_id IS ?
              AND is_default = 1 AND active = 1
            LIMIT 1
            "#,
        )
        .bind(channel)
        .bind(category)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
    }
}
