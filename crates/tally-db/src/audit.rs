//! # Audit Recorder
//!
//! Write-once trail of every committed ledger mutation.
//!
//! ## Delivery Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Engine operation                                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  BEGIN ── lock ── validate ── write ── COMMIT                           │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                              emit(AuditRecord) ──► AuditRecorder        │
//! │                                          │                              │
//! │                      Err ──► error!(target: "tally::audit") and continue │
//! │                                                                         │
//! │  The financial transaction is already durable; a failed audit write    │
//! │  never rolls it back and never reaches the caller.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The default [`SqliteAuditRecorder`] writes to the `audit_log` table,
//! which rejects UPDATE and DELETE.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tally_core::{AuditAction, AuditEntity, AuditRecord};
use tracing::{debug, error};

use crate::error::DbResult;

// =============================================================================
// Recorder Trait
// =============================================================================

/// Destination for audit records.
///
/// Implementations must be cheap to call after every commit; the engines
/// await `record` but ignore its failure beyond logging it.
#[async_trait]
pub trait AuditRecorder: Send + Sync + std::fmt::Debug {
    async fn record(&self, record: &AuditRecord) -> DbResult<()>;
}

/// Hands a record to the recorder, logging (never propagating) failures.
pub(crate) async fn emit(recorder: &dyn AuditRecorder, record: AuditRecord) {
    match recorder.record(&record).await {
        Ok(()) => debug!(
            entity = record.entity_type.as_str(),
            entity_id = %record.entity_id,
            action = record.action.as_str(),
            "Audit recorded"
        ),
        Err(e) => error!(
            target: "tally::audit",
            entity = record.entity_type.as_str(),
            entity_id = %record.entity_id,
            action = record.action.as_str(),
            actor = %record.actor_id,
            error = %e,
            "Failed to record audit entry"
        ),
    }
}

// =============================================================================
// SQLite Recorder
// =============================================================================

/// Writes audit records to the `audit_log` table of the ledger database.
#[derive(Debug, Clone)]
pub struct SqliteAuditRecorder {
    pool: SqlitePool,
}

impl SqliteAuditRecorder {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteAuditRecorder { pool }
    }
}

#[async_trait]
impl AuditRecorder for SqliteAuditRecorder {
    async fn record(&self, record: &AuditRecord) -> DbResult<()> {
        let previous = record
            .previous_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let new = record
            .new_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, entity_type, entity_id, action,
                previous_snapshot, new_snapshot,
                actor_id, timestamp, description
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&record.id)
        .bind(record.entity_type)
        .bind(&record.entity_id)
        .bind(record.action)
        .bind(previous)
        .bind(new)
        .bind(&record.actor_id)
        .bind(record.timestamp)
        .bind(&record.description)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Audit Log Reads
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: String,
    entity_type: AuditEntity,
    entity_id: String,
    action: AuditAction,
    previous_snapshot: Option<String>,
    new_snapshot: Option<String>,
    actor_id: String,
    timestamp: DateTime<Utc>,
    description: Option<String>,
}

impl AuditRow {
    fn into_record(self) -> DbResult<AuditRecord> {
        Ok(AuditRecord {
            id: self.id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            action: self.action,
            previous_snapshot: self
                .previous_snapshot
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            new_snapshot: self
                .new_snapshot
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            actor_id: self.actor_id,
            timestamp: self.timestamp,
            description: self.description,
        })
    }
}

/// Read side of the audit log.
#[derive(Debug, Clone)]
pub struct AuditLogRepository {
    pool: SqlitePool,
}

impl AuditLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        AuditLogRepository { pool }
    }

    /// Every record for one aggregate, oldest first.
    pub async fn for_entity(&self, entity: AuditEntity, entity_id: &str) -> DbResult<Vec<AuditRecord>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, entity_type, entity_id, action, previous_snapshot, new_snapshot,
                   actor_id, timestamp, description
            FROM audit_log
            WHERE entity_type = ?1 AND entity_id = ?2
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(entity)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRow::into_record).collect()
    }

    /// Most recent records across all aggregates.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<AuditRecord>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, entity_type, entity_id, action, previous_snapshot, new_snapshot,
                   actor_id, timestamp, description
            FROM audit_log
            ORDER BY rowid DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRow::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_recorder_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let recorder = SqliteAuditRecorder::new(db.pool().clone());

        let record = AuditRecord::new(
            AuditEntity::CustomerAccount,
            "cust-1",
            AuditAction::StatusChange,
            Some(&json!({"status": "active"})),
            Some(&json!({"status": "suspended"})),
            "admin",
        )
        .with_description("manual suspension");

        recorder.record(&record).await.unwrap();

        let stored = db
            .audit_log()
            .for_entity(AuditEntity::CustomerAccount, "cust-1")
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].action, AuditAction::StatusChange);
        assert_eq!(stored[0].new_snapshot, Some(json!({"status": "suspended"})));
        assert_eq!(stored[0].description.as_deref(), Some("manual suspension"));
    }

    #[tokio::test]
    async fn test_audit_log_is_append_only() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let record = AuditRecord::new::<serde_json::Value>(
            AuditEntity::CashSession,
            "s-1",
            AuditAction::SessionOpened,
            None,
            None,
            "cashier",
        );
        SqliteAuditRecorder::new(db.pool().clone())
            .record(&record)
            .await
            .unwrap();

        let update = sqlx::query("UPDATE audit_log SET actor_id = 'someone else'")
            .execute(db.pool())
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM audit_log").execute(db.pool()).await;
        assert!(delete.is_err());
    }
}
