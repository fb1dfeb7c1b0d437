//! # Transactions and Locks
//!
//! Shared plumbing for the engines: one write transaction per mutation,
//! the aggregate row lock taken by its first statement, and the integrity
//! hold placed when a ledger and its cache disagree.
//!
//! ## Write Transaction Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BEGIN                                                                  │
//! │   │                                                                     │
//! │   ▼                                                                     │
//! │  UPDATE <aggregate> SET <counter> = <counter> WHERE <key> = ? RETURNING │
//! │   │   ▲ first statement is a write: takes SQLite's write lock,          │
//! │   │   │ waits up to busy_timeout, then Busy → ConcurrencyConflict       │
//! │   ▼                                                                     │
//! │  rules (tally-core) on the row just returned = latest committed state   │
//! │   │                                                                     │
//! │   ▼                                                                     │
//! │  INSERT movement; UPDATE cached balance / expected cash                 │
//! │   │                                                                     │
//! │   ▼                                                                     │
//! │  COMMIT           (dropping the Transaction instead rolls back)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::{Sqlite, SqlitePool, Transaction};
use tally_core::{AuditAction, AuditEntity, AuditRecord, LedgerError};
use tracing::{error, warn};

use crate::audit::{self, AuditRecorder};
use crate::error::DbResult;

/// A write transaction on the ledger database.
pub(crate) type Tx = Transaction<'static, Sqlite>;

pub(crate) async fn begin(pool: &SqlitePool) -> DbResult<Tx> {
    Ok(pool.begin().await?)
}

pub(crate) async fn commit(tx: Tx) -> DbResult<()> {
    tx.commit().await?;
    Ok(())
}

/// The two kinds of aggregate that own a movement ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Aggregate {
    Account,
    Session,
}

impl Aggregate {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Aggregate::Account => "customer account",
            Aggregate::Session => "cash session",
        }
    }

    pub(crate) fn audit_entity(&self) -> AuditEntity {
        match self {
            Aggregate::Account => AuditEntity::CustomerAccount,
            Aggregate::Session => AuditEntity::CashSession,
        }
    }

    fn set_hold_sql(&self) -> &'static str {
        match self {
            Aggregate::Account => {
                "UPDATE customer_accounts SET integrity_hold = ?2 WHERE customer_id = ?1"
            }
            Aggregate::Session => "UPDATE cash_sessions SET integrity_hold = ?2 WHERE id = ?1",
        }
    }
}

/// Sets or clears the hold flag in its own short transaction.
pub(crate) async fn set_hold(pool: &SqlitePool, aggregate: Aggregate, id: &str, hold: bool) -> DbResult<()> {
    sqlx::query(aggregate.set_hold_sql())
        .bind(id)
        .bind(hold)
        .execute(pool)
        .await?;
    Ok(())
}

/// Abandons `tx`, puts the aggregate on hold and builds the error to return.
///
/// The hold is written after the rollback so it survives even though the
/// mutation that detected the drift does not.
pub(crate) async fn integrity_fault(
    tx: Tx,
    pool: &SqlitePool,
    recorder: &dyn AuditRecorder,
    aggregate: Aggregate,
    id: &str,
    actor_id: &str,
    detail: String,
) -> LedgerError {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed after integrity fault");
    }

    error!(
        entity = aggregate.label(),
        id = %id,
        detail = %detail,
        "Ledger integrity fault, placing aggregate on hold"
    );

    match set_hold(pool, aggregate, id, true).await {
        Ok(()) => {
            audit::emit(
                recorder,
                AuditRecord::new::<serde_json::Value>(
                    aggregate.audit_entity(),
                    id,
                    AuditAction::HoldPlaced,
                    None,
                    None,
                    actor_id,
                )
                .with_description(detail.clone()),
            )
            .await;
        }
        Err(e) => error!(
            entity = aggregate.label(),
            id = %id,
            error = %e,
            "Failed to place integrity hold"
        ),
    }

    LedgerError::IntegrityFault {
        entity: aggregate.label(),
        id: id.to_string(),
        detail,
    }
}

/// Error for a write attempted against an aggregate already on hold.
pub(crate) fn on_hold(aggregate: Aggregate, id: &str) -> LedgerError {
    LedgerError::IntegrityFault {
        entity: aggregate.label(),
        id: id.to_string(),
        detail: "aggregate is on integrity hold pending reconciliation".to_string(),
    }
}
