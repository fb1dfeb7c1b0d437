//! # Cash Register Session Engine
//!
//! Open, operate and close drawer sessions, one open session per register.
//!
//! ## Session Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  open_session(register, initial_amount)                                │
//! │    lock cash_registers row ── open session exists? ──► SessionAlreadyOpen │
//! │    suggested = previous closed session's counted cash                   │
//! │    expected_cash_running = initial_amount                               │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  record_movement(...)  × N                                              │
//! │    cash methods move expected cash; every method updates its totals     │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  close_session(actual)                                                  │
//! │    expected = initial + Σ cash movements (recomputed under the lock)    │
//! │    discrepancy = actual − expected                                      │
//! │    state = closed  (final: a trigger rejects any later change)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tally_core::session::{self as cash_rules, Reconciliation};
use tally_core::validation::{validate_id, validate_page, validate_text};
use tally_core::{
    AuditAction, AuditEntity, AuditRecord, CashMovement, CashSession, CloseSession, CurrentSession,
    LedgerError, LedgerResult, MethodTotal, Money, NewCashMovement, OpenSession, Page, PageRequest,
    PaymentMethodKind, SessionFilter, SessionState, SessionStats, MAX_DESCRIPTION_LEN,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditRecorder};
use crate::error::{DbError, DbResult};
use crate::repository::ledger::{self, LedgerRepository};
use crate::repository::rows::{SessionRow, SESSION_COLUMNS};
use crate::tx::{self, Aggregate};

#[derive(Debug, sqlx::FromRow)]
struct KeyedSessionRow {
    page_key: i64,
    #[sqlx(flatten)]
    session: SessionRow,
}

#[derive(Debug, sqlx::FromRow)]
struct MethodTotalRow {
    session_id: String,
    payment_method_id: String,
    kind: PaymentMethodKind,
    total_in: i64,
    total_out: i64,
    counted_amount: Option<i64>,
    difference: Option<i64>,
}

impl From<MethodTotalRow> for MethodTotal {
    fn from(row: MethodTotalRow) -> Self {
        MethodTotal {
            session_id: row.session_id,
            payment_method_id: row.payment_method_id,
            kind: row.kind,
            total_in: Money::from_cents(row.total_in),
            total_out: Money::from_cents(row.total_out),
            counted_amount: row.counted_amount.map(Money::from_cents),
            difference: row.difference.map(Money::from_cents),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionStatsRow {
    closed_sessions: i64,
    sessions_with_discrepancy: i64,
    total_expected: i64,
    total_actual: i64,
    net_discrepancy: i64,
    absolute_discrepancy: i64,
}

/// Repository for cash register session operations.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
    audit: Arc<dyn AuditRecorder>,
}

impl SessionRepository {
    /// Creates a new SessionRepository.
    pub fn new(pool: SqlitePool, audit: Arc<dyn AuditRecorder>) -> Self {
        SessionRepository { pool, audit }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Opens a session on a register.
    ///
    /// The suggested initial amount is what the previous session counted at
    /// close. Opening with a different amount is allowed; without an
    /// `adjustment_reason` it is only logged.
    ///
    /// ## Errors
    /// - `SessionAlreadyOpen` if the register already has an open session
    /// - `InvalidAmount` for a negative initial amount
    pub async fn open_session(&self, req: &OpenSession) -> LedgerResult<CashSession> {
        req.validate()?;
        let now = Utc::now();

        let mut tx = tx::begin(&self.pool).await?;

        let last_sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cash_registers (register_id, last_sequence, created_at)
            VALUES (?1, 0, ?2)
            ON CONFLICT(register_id) DO UPDATE SET last_sequence = last_sequence
            RETURNING last_sequence
            "#,
        )
        .bind(&req.register_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let open: Option<String> =
            sqlx::query_scalar("SELECT id FROM cash_sessions WHERE register_id = ?1 AND state = 'open'")
                .bind(&req.register_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(DbError::from)?;
        if let Some(session_id) = open {
            return Err(LedgerError::SessionAlreadyOpen {
                register_id: req.register_id.clone(),
                session_id,
            });
        }

        let suggested = previous_counted_cash(&mut *tx, &req.register_id).await?;
        if req.initial_amount != suggested && req.adjustment_reason.is_none() {
            warn!(
                register_id = %req.register_id,
                initial = %req.initial_amount,
                suggested = %suggested,
                "Session opened with an unexplained initial amount"
            );
        }

        let sequence = last_sequence + 1;
        let sql = format!(
            r#"
            INSERT INTO cash_sessions (
                id, register_id, sequence, state, opened_at, initial_amount,
                suggested_initial_amount, adjustment_reason, opening_notes,
                expected_cash_running, movement_count, opened_by
            ) VALUES (?1, ?2, ?3, 'open', ?4, ?5, ?6, ?7, ?8, ?5, 0, ?9)
            RETURNING {SESSION_COLUMNS}
            "#
        );
        let row: SessionRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(&req.register_id)
            .bind(sequence)
            .bind(now)
            .bind(req.initial_amount.cents())
            .bind(suggested.cents())
            .bind(&req.adjustment_reason)
            .bind(&req.opening_notes)
            .bind(&req.actor_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::from)?;

        sqlx::query("UPDATE cash_registers SET last_sequence = ?2 WHERE register_id = ?1")
            .bind(&req.register_id)
            .bind(sequence)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;

        tx::commit(tx).await?;

        let session = CashSession::from(row);
        info!(
            session_id = %session.id,
            register_id = %session.register_id,
            sequence = session.sequence,
            initial = %session.initial_amount,
            "Cash session opened"
        );

        audit::emit(
            &*self.audit,
            AuditRecord::new(
                AuditEntity::CashSession,
                &session.id,
                AuditAction::SessionOpened,
                None,
                Some(&session),
                &req.actor_id,
            ),
        )
        .await;

        Ok(session)
    }

    /// Records a drawer movement on an open session.
    ///
    /// Positive amounts are money in, negative are money out. Only methods
    /// of kind `cash` change the expected drawer amount.
    pub async fn record_movement(&self, req: &NewCashMovement) -> LedgerResult<CashMovement> {
        req.validate()?;

        let appended = ledger::append_cash_entry(&self.pool, &*self.audit, req).await?;
        ledger::audit_cash_append(&*self.audit, &appended).await;

        Ok(appended.movement)
    }

    /// Closes a session against the counted drawer.
    ///
    /// Expected cash is re-summed from the movements and must match the
    /// running cache; otherwise the session goes on hold and nothing closes.
    ///
    /// ## Errors
    /// - `SessionNotOpen` if already closed (a second close changes nothing)
    /// - `InvalidAmount` for a negative count
    /// - `EntityNotFound` for a counted method that does not exist
    /// - `IntegrityFault` on drift
    pub async fn close_session(&self, req: &CloseSession) -> LedgerResult<CashSession> {
        req.validate()?;
        let now = Utc::now();

        let mut tx = tx::begin(&self.pool).await?;
        let Some(row) = ledger::lock_session(&mut tx, &req.session_id).await? else {
            return Err(LedgerError::not_found("cash session", &req.session_id));
        };

        if row.state != SessionState::Open {
            return Err(LedgerError::SessionNotOpen {
                session_id: req.session_id.clone(),
            });
        }
        if row.integrity_hold {
            return Err(tx::on_hold(Aggregate::Session, &req.session_id));
        }

        let drift = match ledger::session_drift(&mut tx, &row).await? {
            Some(detail) => Some(detail),
            None => {
                let recomputed = ledger::session_expected(&mut *tx, &req.session_id, None).await?;
                (recomputed.cents() != row.expected_cash_running).then(|| {
                    format!(
                        "cached expected cash {} but movements sum to {}",
                        Money::from_cents(row.expected_cash_running),
                        recomputed
                    )
                })
            }
        };
        if let Some(detail) = drift {
            return Err(tx::integrity_fault(
                tx,
                &self.pool,
                &*self.audit,
                Aggregate::Session,
                &req.session_id,
                &req.actor_id,
                detail,
            )
            .await);
        }

        for method_id in req.counted_by_method.keys() {
            let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM payment_methods WHERE id = ?1")
                .bind(method_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(DbError::from)?;
            if known.is_none() {
                return Err(LedgerError::not_found("payment method", method_id));
            }
        }

        let before = CashSession::from(row);
        let reconciliation = Reconciliation::new(before.expected_cash_running, req.actual_cash_amount)?;

        let sql = format!(
            r#"
            UPDATE cash_sessions
            SET state = 'closed', closed_at = ?2, actual_cash_amount = ?3,
                expected_cash_amount = ?4, discrepancy = ?5, closing_notes = ?6, closed_by = ?7
            WHERE id = ?1
            RETURNING {SESSION_COLUMNS}
            "#
        );
        let closed: SessionRow = sqlx::query_as(&sql)
            .bind(&req.session_id)
            .bind(now)
            .bind(reconciliation.actual.cents())
            .bind(reconciliation.expected.cents())
            .bind(reconciliation.discrepancy.cents())
            .bind(&req.closing_notes)
            .bind(&req.actor_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::from)?;

        let totals: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT payment_method_id, total_in, total_out FROM cash_session_totals WHERE session_id = ?1",
        )
        .bind(&req.session_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(DbError::from)?;

        for (method_id, total_in, total_out) in &totals {
            let net = Money::from_cents(*total_in)
                .checked_sub(Money::from_cents(*total_out))
                .ok_or_else(|| LedgerError::invalid_amount("method net overflows"))?;
            let (counted, difference) =
                cash_rules::method_count(net, req.counted_by_method.get(method_id).copied())?;
            sqlx::query(
                "UPDATE cash_session_totals SET counted_amount = ?3, difference = ?4 \
                 WHERE session_id = ?1 AND payment_method_id = ?2",
            )
            .bind(&req.session_id)
            .bind(method_id)
            .bind(counted.cents())
            .bind(difference.cents())
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        }

        // Counted methods that saw no movement still get a row.
        for (method_id, counted) in &req.counted_by_method {
            if totals.iter().any(|(id, _, _)| id == method_id) {
                continue;
            }
            sqlx::query(
                "INSERT INTO cash_session_totals \
                 (session_id, payment_method_id, total_in, total_out, counted_amount, difference) \
                 VALUES (?1, ?2, 0, 0, ?3, ?3)",
            )
            .bind(&req.session_id)
            .bind(method_id)
            .bind(counted.cents())
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        }

        tx::commit(tx).await?;

        let after = CashSession::from(closed);
        if reconciliation.is_balanced() {
            info!(session_id = %after.id, expected = %reconciliation.expected, "Cash session closed balanced");
        } else {
            warn!(
                session_id = %after.id,
                expected = %reconciliation.expected,
                actual = %reconciliation.actual,
                discrepancy = %reconciliation.discrepancy,
                "Cash session closed with discrepancy"
            );
        }

        audit::emit(
            &*self.audit,
            AuditRecord::new(
                AuditEntity::CashSession,
                &after.id,
                AuditAction::SessionClosed,
                Some(&before),
                Some(&after),
                &req.actor_id,
            )
            .with_description(format!("discrepancy {}", reconciliation.discrepancy)),
        )
        .await;

        Ok(after)
    }

    /// Lifts an integrity hold after the session ledger verifies clean.
    pub async fn release_hold(&self, session_id: &str, reason: &str, actor_id: &str) -> LedgerResult<CashSession> {
        validate_text("reason", reason, MAX_DESCRIPTION_LEN)?;
        validate_id("actor_id", actor_id)?;

        let ledger = LedgerRepository::new(self.pool.clone(), self.audit.clone());
        let verification = ledger.verify_session(session_id, actor_id).await?;
        if verification.on_hold {
            tx::set_hold(&self.pool, Aggregate::Session, session_id, false).await?;
            info!(session_id = %session_id, actor = %actor_id, "Integrity hold released");

            audit::emit(
                &*self.audit,
                AuditRecord::new::<serde_json::Value>(
                    AuditEntity::CashSession,
                    session_id,
                    AuditAction::HoldReleased,
                    None,
                    None,
                    actor_id,
                )
                .with_description(reason.trim()),
            )
            .await;
        }

        self.get_session(session_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("cash session", session_id))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Gets a session by ID.
    pub async fn get_session(&self, session_id: &str) -> DbResult<Option<CashSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM cash_sessions WHERE id = ?1");
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(CashSession::from))
    }

    /// The open session of a register, flagged when it was opened on an
    /// earlier day and never closed.
    pub async fn current_session(&self, register_id: &str) -> DbResult<Option<CurrentSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM cash_sessions WHERE register_id = ?1 AND state = 'open'"
        );
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(register_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let session = CashSession::from(row);
            let is_from_previous_day = cash_rules::is_from_previous_day(session.opened_at, Utc::now());
            if is_from_previous_day {
                debug!(session_id = %session.id, "Open session carried over from a previous day");
            }
            CurrentSession {
                session,
                is_from_previous_day,
            }
        }))
    }

    /// What the next session on this register should start with.
    pub async fn suggested_initial_amount(&self, register_id: &str) -> DbResult<Money> {
        previous_counted_cash(&self.pool, register_id).await
    }

    /// Closed sessions, most recently opened first.
    pub async fn list_closed(&self, filter: &SessionFilter, page: &PageRequest) -> LedgerResult<Page<CashSession>> {
        validate_page(page)?;
        let before = ledger::resume_key(page, i64::MAX)?;

        let sql = format!(
            r#"
            SELECT rowid AS page_key, {SESSION_COLUMNS}
            FROM cash_sessions
            WHERE state = 'closed'
              AND rowid < ?1
              AND (?2 IS NULL OR register_id = ?2)
              AND (?3 IS NULL OR opened_at >= ?3)
              AND (?4 IS NULL OR opened_at <= ?4)
            ORDER BY rowid DESC
            LIMIT ?5
            "#
        );
        let rows: Vec<KeyedSessionRow> = sqlx::query_as(&sql)
            .bind(before)
            .bind(&filter.register_id)
            .bind(filter.range.from)
            .bind(filter.range.to)
            .bind(page.limit as i64 + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let keyed: Vec<(i64, CashSession)> = rows
            .into_iter()
            .map(|r| (r.page_key, CashSession::from(r.session)))
            .collect();
        let page = ledger::into_page(keyed, page.limit, |(key, _)| *key);

        Ok(Page {
            items: page.items.into_iter().map(|(_, session)| session).collect(),
            next: page.next,
        })
    }

    /// Per payment method totals of a session.
    pub async fn method_totals(&self, session_id: &str) -> LedgerResult<Vec<MethodTotal>> {
        if self.get_session(session_id).await?.is_none() {
            return Err(LedgerError::not_found("cash session", session_id));
        }

        let rows: Vec<MethodTotalRow> = sqlx::query_as(
            r#"
            SELECT t.session_id, t.payment_method_id, p.kind, t.total_in, t.total_out,
                   t.counted_amount, t.difference
            FROM cash_session_totals t
            JOIN payment_methods p ON p.id = t.payment_method_id
            WHERE t.session_id = ?1
            ORDER BY p.code
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows.into_iter().map(MethodTotal::from).collect())
    }

    /// Reconciliation totals over closed sessions.
    pub async fn stats(&self, filter: &SessionFilter) -> DbResult<SessionStats> {
        let row: SessionStatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS closed_sessions,
                COALESCE(SUM(discrepancy <> 0), 0) AS sessions_with_discrepancy,
                COALESCE(SUM(expected_cash_amount), 0) AS total_expected,
                COALESCE(SUM(actual_cash_amount), 0) AS total_actual,
                COALESCE(SUM(discrepancy), 0) AS net_discrepancy,
                COALESCE(SUM(ABS(discrepancy)), 0) AS absolute_discrepancy
            FROM cash_sessions
            WHERE state = 'closed'
              AND (?1 IS NULL OR register_id = ?1)
              AND (?2 IS NULL OR opened_at >= ?2)
              AND (?3 IS NULL OR opened_at <= ?3)
            "#,
        )
        .bind(&filter.register_id)
        .bind(filter.range.from)
        .bind(filter.range.to)
        .fetch_one(&self.pool)
        .await?;

        Ok(SessionStats {
            closed_sessions: row.closed_sessions,
            sessions_with_discrepancy: row.sessions_with_discrepancy,
            total_expected: Money::from_cents(row.total_expected),
            total_actual: Money::from_cents(row.total_actual),
            net_discrepancy: Money::from_cents(row.net_discrepancy),
            absolute_discrepancy: Money::from_cents(row.absolute_discrepancy),
        })
    }
}

async fn previous_counted_cash<'c, E>(executor: E, register_id: &str) -> DbResult<Money>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let counted: Option<Option<i64>> = sqlx::query_scalar(
        "SELECT actual_cash_amount FROM cash_sessions \
         WHERE register_id = ?1 AND state = 'closed' \
         ORDER BY sequence DESC LIMIT 1",
    )
    .bind(register_id)
    .fetch_optional(executor)
    .await?;

    Ok(counted.flatten().map(Money::from_cents).unwrap_or_default())
}

// =============================================================================
// Tests
// =============================================================================
