//! Message repository

use chrono::{DateTime, Utc};
use clinicomm_common::types::MessageId;
use clinicomm_common::Channel;
use sqlx::SqlitePool;

use crate::models::{DeliveryStatus, Message, TriggerType};

/// Filter for listing messages
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub status: Option<DeliveryStatus>,
    pub channel: Option<Channel>,
    pub trigger_entity_id: Option<String>,
}

/// Message repository
#[derive(Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    /// Create a new message repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a message.
    ///
    /// Returns `false` when the row was ignored because a live message
    /// already exists for the same trigger combination.
    pub async fn insert(&self, message: &Message) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages (
                id, channel, recipient_name, recipient_address, subject, content,
                attachments, status, scheduled_for, sent_at, delivered_at, read_at,
                failed_at, error_message, failure_reason, bounce_reason, retry_count,
                next_retry_at, provider_response, tracking_id, opens, clicks,
                unsubscribes, template_id, trigger_type, trigger_entity_id,
                trigger_hours_before, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id)
        .bind(message.channel)
        .bind(&message.recipient_name)
        .bind(&message.recipient_address)
        .bind(&message.subject)
        .bind(&message.content)
        .bind(&message.attachments)
        .bind(message.status)
        .bind(message.scheduled_for)
        .bind(message.sent_at)
        .bind(message.delivered_at)
        .bind(message.read_at)
        .bind(message.failed_at)
        .bind(&message.error_message)
        .bind(message.failure_reason)
        .bind(&message.bounce_reason)
        .bind(message.retry_count)
        .bind(message.next_retry_at)
        .bind(&message.provider_response)
        .bind(&message.tracking_id)
        .bind(message.opens)
        .bind(message.clicks)
        .bind(message.unsubscribes)
        .bind(message.template_id)
        .bind(message.trigger_type)
        .bind(&message.trigger_entity_id)
        .bind(message.trigger_hours_before)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a message by ID
    pub async fn get(&self, id: MessageId) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Find a message by the provider's tracking ID
    pub async fn find_by_tracking_id(
        &self,
        channel: Channel,
        tracking_id: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE channel = ? AND tracking_id = ? LIMIT 1",
        )
        .bind(channel)
        .bind(tracking_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Find the live (not cancelled) message for a trigger combination
    pub async fn find_by_trigger(
        &self,
        trigger_type: TriggerType,
        entity_id: &str,
        hours_before: i32,
        channel: Channel,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE trigger_type = ?
              AND trigger_entity_id = ?
              AND trigger_hours_before = ?
              AND channel = ?
              AND status <> 'cancelled'
            LIMIT 1
            "#,
        )
        .bind(trigger_type)
        .bind(entity_id)
        .bind(hours_before)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await
    }

    /// List messages that still belong to the scheduler
    pub async fn list_pending(&self) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE status IN ('scheduled', 'failed_retryable', 'sending')
            ORDER BY scheduled_for ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Return messages left in flight by a previous process to `scheduled`
    pub async fn reset_in_flight(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'scheduled', updated_at = ? WHERE status = 'sending'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Claim a due message for dispatch.
    ///
    /// Only one caller can win the claim; a concurrent cancel or a second
    /// dispatcher gets `None`.
    pub async fn claim(&self, id: MessageId) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = 'sending',
                next_retry_at = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('scheduled', 'failed_retryable')
            RETURNING *
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Return a claimed message to `scheduled` so it can be claimed again
    pub async fn release(&self, id: MessageId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'scheduled', updated_at = ? WHERE id = ? AND status = 'sending'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancel a message that has not been claimed yet
    pub async fn cancel(&self, id: MessageId) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = 'cancelled',
                next_retry_at = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('draft', 'scheduled', 'failed_retryable')
            RETURNING *
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Persist the mutable lifecycle fields if the stored status still
    /// equals `expected`. Returns `false` when another writer got there first.
    pub async fn save_if_status(
        &self,
        message: &Message,
        expected: DeliveryStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET
                status = ?,
                sent_at = ?,
                delivered_at = ?,
                read_at = ?,
                failed_at = ?,
                error_message = ?,
                failure_reason = ?,
                bounce_reason = ?,
                retry_count = ?,
                next_retry_at = ?,
                provider_response = ?,
                tracking_id = ?,
                opens = ?,
                clicks = ?,
                unsubscribes = ?,
                recipient_address = ?,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(message.status)
        .bind(message.sent_at)
        .bind(message.delivered_at)
        .bind(message.read_at)
        .bind(message.failed_at)
        .bind(&message.error_message)
        .bind(message.failure_reason)
        .bind(&message.bounce_reason)
        .bind(message.retry_count)
        .bind(message.next_retry_at)
        .bind(&message.provider_response)
        .bind(&message.tracking_id)
        .bind(message.opens)
        .bind(message.clicks)
        .bind(message.unsubscribes)
        .bind(&message.recipient_address)
        .bind(message.updated_at)
        .bind(message.id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// List messages scheduled within `[start, end)`
    pub async fn list_scheduled_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE scheduled_for >= ? AND scheduled_for < ?
            ORDER BY scheduled_for ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
    }

    /// List messages with optional filters
    pub async fn list(
        &self,
        filter: &MessageFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR channel = ?2)
              AND (?3 IS NULL OR trigger_entity_id = ?3)
            ORDER BY scheduled_for DESC
            LIMIT ?4 OFFSET ?5
            "#,
        )
        .bind(filter.status)
        .bind(filter.channel)
        .bind(&filter.trigger_entity_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    /// Count messages by status
    pub async fn count_by_status(&self, status: DeliveryStatus) -> Result<i64, sqlx::Error> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE status = ?")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}
