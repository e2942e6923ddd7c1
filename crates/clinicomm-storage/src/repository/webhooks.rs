//! Webhook registration repository

use chrono::Utc;
use clinicomm_common::types::WebhookId;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::WebhookRegistration;

/// Create webhook input
#[derive(Debug, Clone)]
pub struct CreateWebhook {
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
}

/// Webhook repository
#[derive(Clone)]
pub struct WebhookRepository {
    pool: SqlitePool,
}

impl WebhookRepository {
    /// Create a new webhook repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a webhook
    pub async fn create(&self, input: CreateWebhook) -> Result<WebhookRegistration, sqlx::Error> {
        let now = Utc::now();
        let events = if input.events.is_empty() {
            vec!["*".to_string()]
        } else {
            input.events
        };

        sqlx::query_as::<_, WebhookRegistration>(
            r#"
            INSERT INTO webhooks (id, url, secret, events, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.url)
        .bind(&input.secret)
        .bind(Json(events))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    /// Get a webhook by ID
    pub async fn get(&self, id: WebhookId) -> Result<Option<WebhookRegistration>, sqlx::Error> {
        sqlx::query_as::<_, WebhookRegistration>("SELECT * FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List all webhooks
    pub async fn list(&self) -> Result<Vec<WebhookRegistration>, sqlx::Error> {
        sqlx::query_as::<_, WebhookRegistration>("SELECT * FROM webhooks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
    }

    /// List active webhooks
    pub async fn list_active(&self) -> Result<Vec<WebhookRegistration>, sqlx::Error> {
        sqlx::query_as::<_, WebhookRegistration>(
            "SELECT * FROM webhooks WHERE active = 1 ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Enable or disable a webhook
    pub async fn set_active(&self, id: WebhookId, active: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE webhooks SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a webhook
    pub async fn delete(&self, id: WebhookId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
