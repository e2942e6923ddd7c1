//! Delivery settings repository (single row)

use chrono::Utc;
use clinicomm_common::DeliveryConfig;
use sqlx::types::Json;
use sqlx::SqlitePool;

use crate::models::StoredDeliveryConfig;

/// Delivery settings repository
#[derive(Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    /// Create a new settings repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load the stored delivery settings, if any
    pub async fn load(&self) -> Result<Option<StoredDeliveryConfig>, sqlx::Error> {
        sqlx::query_as::<_, StoredDeliveryConfig>(
            "SELECT settings, updated_at FROM delivery_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
    }

    /// Replace the stored delivery settings
    pub async fn store(&self, config: &DeliveryConfig) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO delivery_config (id, settings, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                settings = excluded.settings,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Json(config))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabasePool;

    #[tokio::test]
    async fn test_store_replaces_previous_settings() {
        let db = DatabasePool::in_memory().await.unwrap();
        let repo = SettingsRepository::new(db.pool().clone());
        assert!(repo.load().await.unwrap().is_none());

        let mut config = DeliveryConfig::default();
        repo.store(&config).await.unwrap();

        config.retry_attempts = 7;
        repo.store(&config).await.unwrap();

        let stored = repo.load().await.unwrap().unwrap();
        assert_eq!(stored.settings.retry_attempts, 7);
    }
}
