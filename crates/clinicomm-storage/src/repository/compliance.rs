//! Opt-out (compliance) repository

use crate::db::DatabasePool;
use crate::models::ComplianceEntry;
use async_trait::async_trait;
use chrono::Utc;
use clinicomm_common::{Error, Result};

/// Opt-out store consulted before every send
#[async_trait]
pub trait ComplianceRepository: Send + Sync {
    async fn opt_out(&self, address: &str, reason: Option<&str>, source: &str)
        -> Result<ComplianceEntry>;
    async fn opt_in(&self, address: &str) -> Result<bool>;
    async fn get(&self, address: &str) -> Result<Option<ComplianceEntry>>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ComplianceEntry>>;
}

/// Database compliance repository
#[derive(Clone)]
pub struct DbComplianceRepository {
    pool: DatabasePool,
}

impl DbComplianceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ComplianceRepository for DbComplianceRepository {
    async fn opt_out(
        &self,
        address: &str,
        reason: Option<&str>,
        source: &str,
    ) -> Result<ComplianceEntry> {
        sqlx::query_as::<_, ComplianceEntry>(
            r#"
            INSERT INTO compliance_entries (address, reason, source, opted_out_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (address) DO UPDATE SET
                reason = COALESCE(excluded.reason, compliance_entries.reason),
                source = excluded.source
            RETURNING *
            "#,
        )
        .bind(address)
        .bind(reason)
        .bind(source)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn opt_in(&self, address: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM compliance_entries WHERE address = ?")
            .bind(address)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, address: &str) -> Result<Option<ComplianceEntry>> {
        sqlx::query_as::<_, ComplianceEntry>(
            "SELECT * FROM compliance_entries WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ComplianceEntry>> {
        sqlx::query_as::<_, ComplianceEntry>(
            "SELECT * FROM compliance_entries ORDER BY opted_out_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
