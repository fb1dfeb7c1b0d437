//! # Movement Ledger
//!
//! Append-only movement history for customer accounts and cash sessions.
//! Balances and expected cash are caches over this history; the ledger is
//! the only code that writes a movement row.
//!
//! ## Append Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BEGIN                                                                  │
//! │    lock aggregate row (UPDATE … RETURNING)                              │
//! │    integrity_hold?            ──► IntegrityFault                        │
//! │    cache ≠ last snapshot?     ──► rollback, hold, IntegrityFault        │
//! │    tally-core rules           ──► domain error (nothing written)        │
//! │    INSERT movement (sequence = movement_count + 1)                      │
//! │    UPDATE cached balance / expected cash                                │
//! │  COMMIT                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The per-write drift check compares the cache with the running snapshot of
//! the latest movement, which is O(1). The full re-summation runs in
//! [`LedgerRepository::verify_account`], [`LedgerRepository::verify_session`]
//! and at session close.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tally_core::account::{self as rules, AccountEntry, AccountState};
use tally_core::session as cash_rules;
use tally_core::validation::{validate_id, validate_optional_text, validate_page, validate_text};
use tally_core::{
    AccountMovement, AuditAction, AuditRecord, CashMovement, CashSession, CustomerAccount,
    DateRange, LedgerError, LedgerResult, Money, MovementType, NewCashMovement, Page, PageRequest,
    PageToken, SessionState, MAX_DESCRIPTION_LEN, MAX_NOTES_LEN,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::audit::{self, AuditRecorder};
use crate::error::{DbError, DbResult};
use crate::repository::payment_method;
use crate::repository::rows::{
    AccountRow, CashMovementRow, MovementRow, SessionRow, ACCOUNT_COLUMNS, CASH_MOVEMENT_COLUMNS,
    MOVEMENT_COLUMNS, SESSION_COLUMNS,
};
use crate::tx::{self, Aggregate, Tx};

// =============================================================================
// Requests and Results
// =============================================================================

/// A movement to append to an existing customer account.
#[derive(Debug, Clone)]
pub struct NewAccountMovement {
    pub customer_id: String,
    pub entry: AccountEntry,
    pub description: String,
    /// Required context for payments, ignored by the rules otherwise.
    pub payment_method_id: Option<String>,
    pub notes: Option<String>,
    pub actor_id: String,
}

impl NewAccountMovement {
    pub fn validate(&self) -> LedgerResult<()> {
        validate_id("customer_id", &self.customer_id)?;
        self.entry.validate()?;
        validate_text("description", &self.description, MAX_DESCRIPTION_LEN)?;
        if let Some(method_id) = &self.payment_method_id {
            validate_id("payment_method_id", method_id)?;
        }
        validate_optional_text("notes", self.notes.as_deref(), MAX_NOTES_LEN)?;
        validate_id("actor_id", &self.actor_id)?;
        Ok(())
    }
}

/// Who posts an account movement and why; the entry itself is resolved
/// under the lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryMeta<'a> {
    pub customer_id: &'a str,
    pub description: &'a str,
    pub payment_method_id: Option<&'a str>,
    pub notes: Option<&'a str>,
    pub actor_id: &'a str,
}

impl<'a> From<&'a NewAccountMovement> for EntryMeta<'a> {
    fn from(req: &'a NewAccountMovement) -> Self {
        EntryMeta {
            customer_id: &req.customer_id,
            description: &req.description,
            payment_method_id: req.payment_method_id.as_deref(),
            notes: req.notes.as_deref(),
            actor_id: &req.actor_id,
        }
    }
}

/// Committed account append with the account as it was and as it is now.
#[derive(Debug, Clone)]
pub(crate) struct AccountAppend {
    pub before: CustomerAccount,
    pub movement: AccountMovement,
    pub after: CustomerAccount,
}

/// Committed cash append with the session before and after.
#[derive(Debug, Clone)]
pub(crate) struct CashAppend {
    pub before: CashSession,
    pub movement: CashMovement,
    pub after: CashSession,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub entity: &'static str,
    pub id: String,
    /// Balance or expected cash as cached on the aggregate.
    pub cached: Money,
    /// The same value recomputed from the movements.
    pub recomputed: Money,
    pub movement_count: i64,
    pub on_hold: bool,
}

/// An aggregate that failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    pub entity: &'static str,
    pub id: String,
    pub detail: String,
}

/// Result of verifying every aggregate in the database.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub accounts_checked: usize,
    pub sessions_checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the movement ledgers of accounts and sessions.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
    audit: Arc<dyn AuditRecorder>,
}

impl LedgerRepository {
    /// Creates a new LedgerRepository.
    pub fn new(pool: SqlitePool, audit: Arc<dyn AuditRecorder>) -> Self {
        LedgerRepository { pool, audit }
    }

    // -------------------------------------------------------------------------
    // Append
    // -------------------------------------------------------------------------

    /// Appends a movement to an existing account.
    ///
    /// ## Errors
    /// - `InvalidAmount` for a non-positive charge/payment/interest or a zero adjustment
    /// - `EntityNotFound` for an unknown account or payment method
    /// - `AccountSuspended` / `AccountClosed` when the status forbids it
    /// - `CreditLimitExceeded` for a charge past the limit
    /// - `IntegrityFault` when the account is (or just got) put on hold
    pub async fn append_account(&self, req: &NewAccountMovement) -> LedgerResult<AccountMovement> {
        req.validate()?;

        let entry = req.entry;
        let appended =
            append_account_entry(&self.pool, &*self.audit, EntryMeta::from(req), false, |_| Ok(entry)).await?;

        let action = match appended.movement.movement_type {
            MovementType::Charge => AuditAction::Charge,
            MovementType::Payment => AuditAction::Payment,
            MovementType::Adjustment => AuditAction::Adjustment,
            MovementType::Interest => AuditAction::Surcharge,
        };
        audit_account_append(&*self.audit, &appended, action).await;

        Ok(appended.movement)
    }

    /// Appends a movement to an open session.
    ///
    /// A closed session surfaces as `InvalidState` here; the session engine
    /// reports the more specific `SessionNotOpen`.
    pub async fn append_cash(&self, req: &NewCashMovement) -> LedgerResult<CashMovement> {
        req.validate()?;

        let appended = append_cash_entry(&self.pool, &*self.audit, req)
            .await
            .map_err(|e| match e {
                LedgerError::SessionNotOpen { session_id } => {
                    LedgerError::InvalidState(format!("cash session {session_id} is closed"))
                }
                other => other,
            })?;

        audit_cash_append(&*self.audit, &appended).await;
        Ok(appended.movement)
    }

    // -------------------------------------------------------------------------
    // Listing
    // -------------------------------------------------------------------------

    /// Lists account movements newest first.
    ///
    /// Keyset pagination on `sequence`: the token carries the last sequence
    /// returned, so pages stay stable while new movements are appended.
    pub async fn list_account_movements(
        &self,
        customer_id: &str,
        page: &PageRequest,
        range: DateRange,
    ) -> LedgerResult<Page<AccountMovement>> {
        validate_page(page)?;
        self.require_account(customer_id).await?;

        let before = resume_key(page, i64::MAX)?;
        let sql = format!(
            r#"
            SELECT {MOVEMENT_COLUMNS}
            FROM account_movements
            WHERE customer_id = ?1
              AND sequence < ?2
              AND (?3 IS NULL OR created_at >= ?3)
              AND (?4 IS NULL OR created_at <= ?4)
            ORDER BY sequence DESC
            LIMIT ?5
            "#
        );

        let rows: Vec<MovementRow> = sqlx::query_as(&sql)
            .bind(customer_id)
            .bind(before)
            .bind(range.from)
            .bind(range.to)
            .bind(page.limit as i64 + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let items = rows.into_iter().map(AccountMovement::from).collect();
        Ok(into_page(items, page.limit, |m: &AccountMovement| m.sequence))
    }

    /// Lists session movements newest first, paginated like
    /// [`list_account_movements`](Self::list_account_movements).
    pub async fn list_cash_movements(
        &self,
        session_id: &str,
        page: &PageRequest,
        range: DateRange,
    ) -> LedgerResult<Page<CashMovement>> {
        validate_page(page)?;
        self.require_session(session_id).await?;

        let before = resume_key(page, i64::MAX)?;
        let sql = format!(
            r#"
            SELECT {CASH_MOVEMENT_COLUMNS}
            FROM cash_movements
            WHERE session_id = ?1
              AND sequence < ?2
              AND (?3 IS NULL OR created_at >= ?3)
              AND (?4 IS NULL OR created_at <= ?4)
            ORDER BY sequence DESC
            LIMIT ?5
            "#
        );

        let rows: Vec<CashMovementRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .bind(before)
            .bind(range.from)
            .bind(range.to)
            .bind(page.limit as i64 + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let items = rows.into_iter().map(CashMovement::from).collect();
        Ok(into_page(items, page.limit, |m: &CashMovement| m.sequence))
    }

    /// Lazily walks every page of an account's movements.
    pub fn account_pages(&self, customer_id: &str, range: DateRange, limit: u32) -> MovementPages<AccountMovement> {
        MovementPages::new(self.clone(), customer_id, range, limit)
    }

    /// Lazily walks every page of a session's movements.
    pub fn cash_pages(&self, session_id: &str, range: DateRange, limit: u32) -> MovementPages<CashMovement> {
        MovementPages::new(self.clone(), session_id, range, limit)
    }

    // -------------------------------------------------------------------------
    // Sums
    // -------------------------------------------------------------------------

    /// Signed sum of an account's movements, optionally up to `as_of`.
    pub async fn sum_for_account(&self, customer_id: &str, as_of: Option<DateTime<Utc>>) -> LedgerResult<Money> {
        self.require_account(customer_id).await?;
        Ok(account_sum(&self.pool, customer_id, as_of).await?)
    }

    /// Initial amount plus every cash-kind movement, optionally up to `as_of`.
    pub async fn sum_for_session(&self, session_id: &str, as_of: Option<DateTime<Utc>>) -> LedgerResult<Money> {
        self.require_session(session_id).await?;
        Ok(session_expected(&self.pool, session_id, as_of).await?)
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Re-sums an account's ledger and compares it with the cached balance.
    ///
    /// A mismatch places the account on hold and returns `IntegrityFault`.
    /// Nothing is corrected automatically.
    pub async fn verify_account(&self, customer_id: &str, actor_id: &str) -> LedgerResult<Verification> {
        let mut tx = tx::begin(&self.pool).await?;

        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM customer_accounts WHERE customer_id = ?1");
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(customer_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::from)?;
        let Some(row) = row else {
            return Err(LedgerError::not_found("customer account", customer_id));
        };

        let recomputed = account_sum(&mut *tx, customer_id, None).await?;
        let drift = account_drift(&mut tx, &row).await?;
        tx.rollback().await.map_err(DbError::from)?;

        let detail = match drift {
            Some(detail) => Some(detail),
            None if recomputed.cents() != row.balance => Some(format!(
                "cached balance {} but movements sum to {}",
                Money::from_cents(row.balance),
                recomputed
            )),
            None => None,
        };

        if let Some(detail) = detail {
            return Err(self.flag(Aggregate::Account, customer_id, actor_id, detail).await);
        }

        debug!(customer_id = %customer_id, balance = row.balance, "Account ledger verified");

        Ok(Verification {
            entity: Aggregate::Account.label(),
            id: customer_id.to_string(),
            cached: Money::from_cents(row.balance),
            recomputed,
            movement_count: row.movement_count,
            on_hold: row.integrity_hold,
        })
    }

    /// Re-sums a session's ledger and compares it with the cached expected
    /// cash and, once closed, with the stored reconciliation.
    pub async fn verify_session(&self, session_id: &str, actor_id: &str) -> LedgerResult<Verification> {
        let mut tx = tx::begin(&self.pool).await?;

        let sql = format!("SELECT {SESSION_COLUMNS} FROM cash_sessions WHERE id = ?1");
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::from)?;
        let Some(row) = row else {
            return Err(LedgerError::not_found("cash session", session_id));
        };

        let recomputed = session_expected(&mut *tx, session_id, None).await?;
        let drift = session_drift(&mut tx, &row).await?;
        tx.rollback().await.map_err(DbError::from)?;

        let session = CashSession::from(row);
        let detail = drift.or_else(|| reconciliation_drift(&session, recomputed));

        if let Some(detail) = detail {
            return Err(self.flag(Aggregate::Session, session_id, actor_id, detail).await);
        }

        debug!(session_id = %session_id, expected = %recomputed, "Session ledger verified");

        Ok(Verification {
            entity: Aggregate::Session.label(),
            id: session.id,
            cached: session.expected_cash_running,
            recomputed,
            movement_count: session.movement_count,
            on_hold: session.integrity_hold,
        })
    }

    /// Verifies every account and session, collecting the failures.
    ///
    /// Storage errors abort the run; integrity faults are collected (and
    /// each offending aggregate placed on hold).
    pub async fn verify_all(&self, actor_id: &str) -> LedgerResult<VerifyReport> {
        let mut report = VerifyReport::default();

        let customer_ids: Vec<String> =
            sqlx::query_scalar("SELECT customer_id FROM customer_accounts ORDER BY customer_id")
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::from)?;

        for customer_id in customer_ids {
            report.accounts_checked += 1;
            collect(&mut report, self.verify_account(&customer_id, actor_id).await)?;
        }

        let session_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM cash_sessions ORDER BY rowid")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        for session_id in session_ids {
            report.sessions_checked += 1;
            collect(&mut report, self.verify_session(&session_id, actor_id).await)?;
        }

        info!(
            accounts = report.accounts_checked,
            sessions = report.sessions_checked,
            issues = report.issues.len(),
            "Ledger verification finished"
        );

        Ok(report)
    }

    async fn flag(&self, aggregate: Aggregate, id: &str, actor_id: &str, detail: String) -> LedgerError {
        error!(entity = aggregate.label(), id = %id, detail = %detail, "Ledger verification failed");

        match tx::set_hold(&self.pool, aggregate, id, true).await {
            Ok(()) => {
                audit::emit(
                    &*self.audit,
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
                .await
            }
            Err(e) => error!(id = %id, error = %e, "Failed to place integrity hold"),
        }

        LedgerError::IntegrityFault {
            entity: aggregate.label(),
            id: id.to_string(),
            detail,
        }
    }

    async fn require_account(&self, customer_id: &str) -> LedgerResult<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM customer_accounts WHERE customer_id = ?1")
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;

        exists
            .map(|_| ())
            .ok_or_else(|| LedgerError::not_found("customer account", customer_id))
    }

    async fn require_session(&self, session_id: &str) -> LedgerResult<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM cash_sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;

        exists
            .map(|_| ())
            .ok_or_else(|| LedgerError::not_found("cash session", session_id))
    }
}

fn collect(report: &mut VerifyReport, result: LedgerResult<Verification>) -> LedgerResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(LedgerError::IntegrityFault { entity, id, detail }) => {
            report.issues.push(IntegrityIssue { entity, id, detail });
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// Paging
// =============================================================================

/// Key to resume after, or `start` for the first page.
pub(crate) fn resume_key(page: &PageRequest, start: i64) -> LedgerResult<i64> {
    match &page.after {
        Some(token) => token.key(),
        None => Ok(start),
    }
}

/// Trims a `limit + 1` fetch to `limit` and issues the next token if the
/// extra row was there.
pub(crate) fn into_page<T>(mut items: Vec<T>, limit: u32, key: impl Fn(&T) -> i64) -> Page<T> {
    let limit = limit as usize;
    let next = if items.len() > limit {
        items.truncate(limit);
        items.last().map(|last| PageToken::from_key(key(last)))
    } else {
        None
    };
    Page { items, next }
}

/// Lazy page walker over one aggregate's movements, newest first.
///
/// Holds only the last token, so it can be dropped and recreated from
/// [`MovementPages::token`] at any point.
#[derive(Debug)]
pub struct MovementPages<T> {
    ledger: LedgerRepository,
    owner_id: String,
    range: DateRange,
    limit: u32,
    next: Option<PageToken>,
    exhausted: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T> MovementPages<T> {
    fn new(ledger: LedgerRepository, owner_id: &str, range: DateRange, limit: u32) -> Self {
        MovementPages {
            ledger,
            owner_id: owner_id.to_string(),
            range,
            limit,
            next: None,
            exhausted: false,
            _item: PhantomData,
        }
    }

    /// Token to resume from, if a page has been read and more remain.
    pub fn token(&self) -> Option<&PageToken> {
        self.next.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn request(&self) -> PageRequest {
        PageRequest {
            limit: self.limit,
            after: self.next.clone(),
        }
    }

    fn advance(&mut self, page: Page<T>) -> Option<Vec<T>> {
        self.next = page.next;
        self.exhausted = self.next.is_none();
        if page.items.is_empty() {
            None
        } else {
            Some(page.items)
        }
    }
}

impl MovementPages<AccountMovement> {
    /// Fetches the next page, `None` once every movement has been returned.
    pub async fn next_page(&mut self) -> LedgerResult<Option<Vec<AccountMovement>>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .ledger
            .list_account_movements(&self.owner_id, &self.request(), self.range)
            .await?;
        Ok(self.advance(page))
    }
}

impl MovementPages<CashMovement> {
    /// Fetches the next page, `None` once every movement has been returned.
    pub async fn next_page(&mut self) -> LedgerResult<Option<Vec<CashMovement>>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .ledger
            .list_cash_movements(&self.owner_id, &self.request(), self.range)
            .await?;
        Ok(self.advance(page))
    }
}

// =============================================================================
// Shared Write Path
// =============================================================================

/// Locks an existing account for the rest of the transaction.
pub(crate) async fn lock_account(tx: &mut Tx, customer_id: &str) -> DbResult<Option<AccountRow>> {
    let sql = format!(
        "UPDATE customer_accounts SET movement_count = movement_count \
         WHERE customer_id = ?1 RETURNING {ACCOUNT_COLUMNS}"
    );
    Ok(sqlx::query_as(&sql)
        .bind(customer_id)
        .fetch_optional(&mut **tx)
        .await?)
}

/// Locks an account, creating an empty active one on first use.
pub(crate) async fn lock_or_open_account(tx: &mut Tx, customer_id: &str, now: DateTime<Utc>) -> DbResult<AccountRow> {
    let sql = format!(
        r#"
        INSERT INTO customer_accounts (customer_id, balance, status, movement_count, created_at, updated_at)
        VALUES (?1, 0, 'active', 0, ?2, ?2)
        ON CONFLICT(customer_id) DO UPDATE SET movement_count = movement_count
        RETURNING {ACCOUNT_COLUMNS}
        "#
    );
    Ok(sqlx::query_as(&sql)
        .bind(customer_id)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?)
}

/// Locks a session for the rest of the transaction.
pub(crate) async fn lock_session(tx: &mut Tx, session_id: &str) -> DbResult<Option<SessionRow>> {
    let sql = format!(
        "UPDATE cash_sessions SET movement_count = movement_count \
         WHERE id = ?1 RETURNING {SESSION_COLUMNS}"
    );
    Ok(sqlx::query_as(&sql)
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await?)
}

/// Compares the cached balance with the latest movement's snapshot.
pub(crate) async fn account_drift(tx: &mut Tx, row: &AccountRow) -> DbResult<Option<String>> {
    let last: Option<(i64, i64)> = sqlx::query_as(
        "SELECT sequence, resulting_balance FROM account_movements \
         WHERE customer_id = ?1 ORDER BY sequence DESC LIMIT 1",
    )
    .bind(&row.customer_id)
    .fetch_optional(&mut **tx)
    .await?;

    let (sequence, resulting) = last.unwrap_or((0, 0));
    if sequence == row.movement_count && resulting == row.balance {
        return Ok(None);
    }

    Ok(Some(format!(
        "cached balance {} at movement {} but ledger ends at {} after movement {}",
        Money::from_cents(row.balance),
        row.movement_count,
        Money::from_cents(resulting),
        sequence
    )))
}

/// Compares the cached expected cash with the latest movement's snapshot.
pub(crate) async fn session_drift(tx: &mut Tx, row: &SessionRow) -> DbResult<Option<String>> {
    let last: Option<(i64, i64)> = sqlx::query_as(
        "SELECT sequence, expected_cash_after FROM cash_movements \
         WHERE session_id = ?1 ORDER BY sequence DESC LIMIT 1",
    )
    .bind(&row.id)
    .fetch_optional(&mut **tx)
    .await?;

    let (sequence, expected) = last.unwrap_or((0, row.initial_amount));
    if sequence == row.movement_count && expected == row.expected_cash_running {
        return Ok(None);
    }

    Ok(Some(format!(
        "cached expected cash {} at movement {} but ledger ends at {} after movement {}",
        Money::from_cents(row.expected_cash_running),
        row.movement_count,
        Money::from_cents(expected),
        sequence
    )))
}

fn reconciliation_drift(session: &CashSession, recomputed: Money) -> Option<String> {
    if session.expected_cash_running != recomputed {
        return Some(format!(
            "cached expected cash {} but movements sum to {}",
            session.expected_cash_running, recomputed
        ));
    }

    if session.state == SessionState::Closed {
        let expected = session.expected_cash_amount.unwrap_or_default();
        let actual = session.actual_cash_amount.unwrap_or_default();
        let discrepancy = session.discrepancy.unwrap_or_default();
        if expected != recomputed || discrepancy != actual - expected {
            return Some(format!(
                "closed with expected {expected} and discrepancy {discrepancy}, \
                 but movements give expected {recomputed}"
            ));
        }
    }

    None
}

/// Account movements in `range`, oldest first.
pub(crate) async fn account_movements_in<'c, E>(
    executor: E,
    customer_id: &str,
    range: DateRange,
) -> DbResult<Vec<AccountMovement>>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let sql = format!(
        r#"
        SELECT {MOVEMENT_COLUMNS}
        FROM account_movements
        WHERE customer_id = ?1
          AND (?2 IS NULL OR created_at >= ?2)
          AND (?3 IS NULL OR created_at <= ?3)
        ORDER BY sequence ASC
        "#
    );

    let rows: Vec<MovementRow> = sqlx::query_as(&sql)
        .bind(customer_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(executor)
        .await?;

    Ok(rows.into_iter().map(AccountMovement::from).collect())
}

/// Signed sum of movements strictly before `at`.
pub(crate) async fn account_sum_before<'c, E>(executor: E, customer_id: &str, at: DateTime<Utc>) -> DbResult<Money>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let cents: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(signed_effect), 0) FROM account_movements \
         WHERE customer_id = ?1 AND created_at < ?2",
    )
    .bind(customer_id)
    .bind(at)
    .fetch_one(executor)
    .await?;

    Ok(Money::from_cents(cents))
}

pub(crate) async fn account_sum<'c, E>(executor: E, customer_id: &str, as_of: Option<DateTime<Utc>>) -> DbResult<Money>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let cents: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(signed_effect), 0) FROM account_movements \
         WHERE customer_id = ?1 AND (?2 IS NULL OR created_at <= ?2)",
    )
    .bind(customer_id)
    .bind(as_of)
    .fetch_one(executor)
    .await?;

    Ok(Money::from_cents(cents))
}

/// `initial_amount + Σ amount` over cash-kind movements of a session.
pub(crate) async fn session_expected<'c, E>(
    executor: E,
    session_id: &str,
    as_of: Option<DateTime<Utc>>,
) -> DbResult<Money>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let cents: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT s.initial_amount + COALESCE((
            SELECT SUM(m.amount)
            FROM cash_movements m
            JOIN payment_methods p ON p.id = m.payment_method_id
            WHERE m.session_id = s.id
              AND p.kind = 'cash'
              AND (?2 IS NULL OR m.created_at <= ?2)
        ), 0)
        FROM cash_sessions s
        WHERE s.id = ?1
        "#,
    )
    .bind(session_id)
    .bind(as_of)
    .fetch_optional(executor)
    .await?;

    cents
        .map(Money::from_cents)
        .ok_or_else(|| DbError::not_found("cash session", session_id))
}

/// Appends one account movement in its own transaction.
///
/// `resolve` turns the locked account into the entry to post, so amounts
/// derived from the balance (surcharges) see the latest committed state.
/// With `create_missing`, an unknown customer gets an empty active account
/// first; otherwise it is `EntityNotFound`.
pub(crate) async fn append_account_entry<F>(
    pool: &SqlitePool,
    recorder: &dyn AuditRecorder,
    meta: EntryMeta<'_>,
    create_missing: bool,
    resolve: F,
) -> LedgerResult<AccountAppend>
where
    F: FnOnce(&CustomerAccount) -> LedgerResult<AccountEntry>,
{
    let now = Utc::now();
    let mut tx = tx::begin(pool).await?;

    let row = if create_missing {
        Some(lock_or_open_account(&mut tx, meta.customer_id, now).await?)
    } else {
        lock_account(&mut tx, meta.customer_id).await?
    };
    let Some(row) = row else {
        return Err(LedgerError::not_found("customer account", meta.customer_id));
    };

    if row.integrity_hold {
        return Err(tx::on_hold(Aggregate::Account, meta.customer_id));
    }
    if let Some(detail) = account_drift(&mut tx, &row).await? {
        return Err(
            tx::integrity_fault(tx, pool, recorder, Aggregate::Account, meta.customer_id, meta.actor_id, detail)
                .await,
        );
    }
    if let Some(method_id) = meta.payment_method_id {
        payment_method::require_active(&mut *tx, method_id).await?;
    }

    let before = CustomerAccount::from(row);
    let entry = resolve(&before)?;
    let posting = rules::post(
        AccountState {
            customer_id: &before.customer_id,
            balance: before.balance,
            status: before.status,
            credit_limit: before.credit_limit,
        },
        &entry,
    )?;

    let movement = AccountMovement {
        id: Uuid::new_v4().to_string(),
        customer_id: before.customer_id.clone(),
        sequence: before.movement_count + 1,
        movement_type: entry.movement_type(),
        amount: entry.magnitude()?,
        signed_effect: posting.signed_effect,
        balance_before: posting.balance_before,
        resulting_balance: posting.resulting_balance,
        description: meta.description.trim().to_string(),
        payment_method_id: meta.payment_method_id.map(str::to_string),
        notes: meta.notes.map(str::to_string),
        actor_id: meta.actor_id.to_string(),
        created_at: now,
    };

    insert_account_movement(&mut tx, &movement).await?;

    let last_charge_at = match movement.movement_type {
        MovementType::Charge => Some(now),
        _ => before.last_charge_at,
    };
    let last_payment_at = match movement.movement_type {
        MovementType::Payment => Some(now),
        _ => before.last_payment_at,
    };
    let days_overdue = if movement.resulting_balance.is_positive() {
        before.days_overdue
    } else {
        0
    };

    let sql = format!(
        r#"
        UPDATE customer_accounts
        SET balance = ?2, movement_count = ?3, last_charge_at = ?4,
            last_payment_at = ?5, days_overdue = ?6, updated_at = ?7
        WHERE customer_id = ?1
        RETURNING {ACCOUNT_COLUMNS}
        "#
    );
    let after: AccountRow = sqlx::query_as(&sql)
        .bind(&movement.customer_id)
        .bind(movement.resulting_balance.cents())
        .bind(movement.sequence)
        .bind(last_charge_at)
        .bind(last_payment_at)
        .bind(days_overdue)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;

    tx::commit(tx).await?;

    debug!(
        customer_id = %movement.customer_id,
        sequence = movement.sequence,
        movement_type = movement.movement_type.as_str(),
        effect = movement.signed_effect.cents(),
        balance = movement.resulting_balance.cents(),
        "Account movement appended"
    );

    Ok(AccountAppend {
        before,
        movement,
        after: CustomerAccount::from(after),
    })
}

async fn insert_account_movement(conn: &mut SqliteConnection, m: &AccountMovement) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO account_movements (
            id, customer_id, sequence, movement_type, amount, signed_effect,
            balance_before, resulting_balance, description, payment_method_id,
            notes, actor_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
    )
    .bind(&m.id)
    .bind(&m.customer_id)
    .bind(m.sequence)
    .bind(m.movement_type)
    .bind(m.amount.cents())
    .bind(m.signed_effect.cents())
    .bind(m.balance_before.cents())
    .bind(m.resulting_balance.cents())
    .bind(&m.description)
    .bind(&m.payment_method_id)
    .bind(&m.notes)
    .bind(&m.actor_id)
    .bind(m.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Appends one cash movement to an open session in its own transaction.
pub(crate) async fn append_cash_entry(
    pool: &SqlitePool,
    recorder: &dyn AuditRecorder,
    req: &NewCashMovement,
) -> LedgerResult<CashAppend> {
    let now = Utc::now();
    let mut tx = tx::begin(pool).await?;

    let Some(row) = lock_session(&mut tx, &req.session_id).await? else {
        return Err(LedgerError::not_found("cash session", &req.session_id));
    };

    if row.integrity_hold {
        return Err(tx::on_hold(Aggregate::Session, &req.session_id));
    }
    if row.state != SessionState::Open {
        return Err(LedgerError::SessionNotOpen {
            session_id: req.session_id.clone(),
        });
    }
    if let Some(detail) = session_drift(&mut tx, &row).await? {
        return Err(
            tx::integrity_fault(tx, pool, recorder, Aggregate::Session, &req.session_id, &req.actor_id, detail)
                .await,
        );
    }

    let method = payment_method::require_active(&mut *tx, &req.payment_method_id).await?;
    let before = CashSession::from(row);
    let expected_after = cash_rules::apply_cash_movement(before.expected_cash_running, req.amount, method.kind)?;

    let movement = CashMovement {
        id: Uuid::new_v4().to_string(),
        session_id: before.id.clone(),
        sequence: before.movement_count + 1,
        payment_method_id: method.id.clone(),
        amount: req.amount,
        description: req.description.trim().to_string(),
        notes: req.notes.clone(),
        actor_id: req.actor_id.clone(),
        expected_cash_after: expected_after,
        created_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO cash_movements (
            id, session_id, sequence, payment_method_id, amount, description,
            notes, actor_id, expected_cash_after, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&movement.id)
    .bind(&movement.session_id)
    .bind(movement.sequence)
    .bind(&movement.payment_method_id)
    .bind(movement.amount.cents())
    .bind(&movement.description)
    .bind(&movement.notes)
    .bind(&movement.actor_id)
    .bind(movement.expected_cash_after.cents())
    .bind(movement.created_at)
    .execute(&mut *tx)
    .await
    .map_err(DbError::from)?;

    let (cash_in, cash_out) = cash_rules::split_in_out(movement.amount)?;
    sqlx::query(
        r#"
        INSERT INTO cash_session_totals (session_id, payment_method_id, total_in, total_out)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(session_id, payment_method_id) DO UPDATE SET
            total_in = total_in + excluded.total_in,
            total_out = total_out + excluded.total_out
        "#,
    )
    .bind(&movement.session_id)
    .bind(&movement.payment_method_id)
    .bind(cash_in.cents())
    .bind(cash_out.cents())
    .execute(&mut *tx)
    .await
    .map_err(DbError::from)?;

    let sql = format!(
        "UPDATE cash_sessions SET expected_cash_running = ?2, movement_count = ?3 \
         WHERE id = ?1 RETURNING {SESSION_COLUMNS}"
    );
    let after: SessionRow = sqlx::query_as(&sql)
        .bind(&movement.session_id)
        .bind(expected_after.cents())
        .bind(movement.sequence)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;

    tx::commit(tx).await?;

    debug!(
        session_id = %movement.session_id,
        sequence = movement.sequence,
        method = %method.code,
        amount = movement.amount.cents(),
        expected = expected_after.cents(),
        "Cash movement appended"
    );

    Ok(CashAppend {
        before,
        movement,
        after: CashSession::from(after),
    })
}

pub(crate) async fn audit_account_append(recorder: &dyn AuditRecorder, appended: &AccountAppend, action: AuditAction) {
    let record = AuditRecord::new(
        tally_core::AuditEntity::CustomerAccount,
        &appended.after.customer_id,
        action,
        Some(&appended.before),
        Some(&appended.after),
        &appended.movement.actor_id,
    )
    .with_description(format!(
        "{} {} ({}): {}",
        appended.movement.movement_type,
        appended.movement.amount,
        appended.movement.id,
        appended.movement.description
    ));
    audit::emit(recorder, record).await;
}

pub(crate) async fn audit_cash_append(recorder: &dyn AuditRecorder, appended: &CashAppend) {
    let record = AuditRecord::new(
        tally_core::AuditEntity::CashSession,
        &appended.after.id,
        AuditAction::CashMovement,
        Some(&appended.before),
        Some(&appended.after),
        &appended.movement.actor_id,
    )
    .with_description(format!(
        "{} via {} ({}): {}",
        appended.movement.amount,
        appended.movement.payment_method_id,
        appended.movement.id,
        appended.movement.description
    ));
    audit::emit(recorder, record).await;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use tally_core::{ErrorKind, NewCharge, OpenSession};

    async fn db_with_account(customer_id: &str, charge_cents: i64) -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.accounts()
            .charge(&NewCharge {
                customer_id: customer_id.into(),
                amount: Money::from_cents(charge_cents),
                description: "opening sale".into(),
                notes: None,
                actor_id: "cashier".into(),
            })
            .await
            .unwrap();
        db
    }

    fn entry(customer_id: &str, entry: AccountEntry) -> NewAccountMovement {
        NewAccountMovement {
            customer_id: customer_id.into(),
            entry,
            description: "ledger entry".into(),
            payment_method_id: None,
            notes: None,
            actor_id: "cashier".into(),
        }
    }

    #[tokio::test]
    async fn test_append_updates_cached_balance() {
        let db = db_with_account("cust-1", 10_000).await;
        let ledger = db.ledger();

        let m = ledger
            .append_account(&entry("cust-1", AccountEntry::Adjustment(Money::from_cents(-2_500))))
            .await
            .unwrap();

        assert_eq!(m.sequence, 2);
        assert_eq!(m.amount, Money::from_cents(2_500));
        assert_eq!(m.signed_effect, Money::from_cents(-2_500));
        assert_eq!(m.balance_before, Money::from_cents(10_000));
        assert_eq!(m.resulting_balance, Money::from_cents(7_500));

        let account = db.accounts().get_account("cust-1").await.unwrap().unwrap();
        assert_eq!(account.balance, Money::from_cents(7_500));
        assert_eq!(ledger.sum_for_account("cust-1", None).await.unwrap(), account.balance);
    }

    #[tokio::test]
    async fn test_append_rejects_bad_input_without_writing() {
        let db = db_with_account("cust-1", 10_000).await;
        let ledger = db.ledger();

        let zero = ledger
            .append_account(&entry("cust-1", AccountEntry::Charge(Money::zero())))
            .await
            .unwrap_err();
        assert_eq!(zero.kind(), ErrorKind::InvalidAmount);

        let missing = ledger
            .append_account(&entry("nobody", AccountEntry::Charge(Money::from_cents(100))))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::EntityNotFound);

        let mut payment = entry("cust-1", AccountEntry::Payment(Money::from_cents(100)));
        payment.payment_method_id = Some("barter".into());
        let unknown_method = ledger.append_account(&payment).await.unwrap_err();
        assert_eq!(unknown_method.kind(), ErrorKind::EntityNotFound);

        let account = db.accounts().get_account("cust-1").await.unwrap().unwrap();
        assert_eq!(account.movement_count, 1);
        assert_eq!(account.balance, Money::from_cents(10_000));
    }

    #[tokio::test]
    async fn test_listing_is_newest_first_and_paginated() {
        let db = db_with_account("cust-1", 100).await;
        let ledger = db.ledger();
        for cents in 2..=5 {
            ledger
                .append_account(&entry("cust-1", AccountEntry::Charge(Money::from_cents(cents * 100))))
                .await
                .unwrap();
        }

        let first = ledger
            .list_account_movements("cust-1", &PageRequest::first(2), DateRange::all())
            .await
            .unwrap();
        assert_eq!(first.items.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![5, 4]);
        let token = first.next.clone().unwrap();

        // A movement appended mid-walk does not shift the remaining pages.
        ledger
            .append_account(&entry("cust-1", AccountEntry::Charge(Money::from_cents(600))))
            .await
            .unwrap();

        let second = ledger
            .list_account_movements("cust-1", &PageRequest::after(2, token), DateRange::all())
            .await
            .unwrap();
        assert_eq!(second.items.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![3, 2]);

        let third = ledger
            .list_account_movements("cust-1", &PageRequest::after(2, second.next.unwrap()), DateRange::all())
            .await
            .unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.is_last());
    }

    #[tokio::test]
    async fn test_list_rejects_foreign_token() {
        let db = db_with_account("cust-1", 100).await;
        let page = PageRequest::after(10, PageToken::from("offset=20".to_string()));
        let err = db
            .ledger()
            .list_account_movements("cust-1", &page, DateRange::all())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_movement_pages_walk_everything_once() {
        let db = db_with_account("cust-1", 100).await;
        let ledger = db.ledger();
        for _ in 0..6 {
            ledger
                .append_account(&entry("cust-1", AccountEntry::Charge(Money::from_cents(100))))
                .await
                .unwrap();
        }

        let mut pages = ledger.account_pages("cust-1", DateRange::all(), 3);
        let mut seen = Vec::new();
        while let Some(items) = pages.next_page().await.unwrap() {
            seen.extend(items.into_iter().map(|m| m.sequence));
        }

        assert_eq!(seen, vec![7, 6, 5, 4, 3, 2, 1]);
        assert!(pages.is_exhausted());
        assert!(pages.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sum_as_of_excludes_later_movements() {
        let db = db_with_account("cust-1", 1_000).await;
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        db.ledger()
            .append_account(&entry("cust-1", AccountEntry::Charge(Money::from_cents(500))))
            .await
            .unwrap();

        let ledger = db.ledger();
        assert_eq!(ledger.sum_for_account("cust-1", Some(cutoff)).await.unwrap(), Money::from_cents(1_000));
        assert_eq!(ledger.sum_for_account("cust-1", None).await.unwrap(), Money::from_cents(1_500));
    }

    #[tokio::test]
    async fn test_verify_detects_drift_and_places_hold() {
        let db = db_with_account("cust-1", 10_000).await;

        let ok = db.ledger().verify_account("cust-1", "auditor").await.unwrap();
        assert_eq!(ok.cached, ok.recomputed);
        assert!(!ok.on_hold);

        sqlx::query("UPDATE customer_accounts SET balance = 9000 WHERE customer_id = 'cust-1'")
            .execute(db.pool())
            .await
            .unwrap();

        let err = db.ledger().verify_account("cust-1", "auditor").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityFault);

        let account = db.accounts().get_account("cust-1").await.unwrap().unwrap();
        assert!(account.integrity_hold);
        assert_eq!(account.balance, Money::from_cents(9_000), "never auto-healed");

        let blocked = db
            .ledger()
            .append_account(&entry("cust-1", AccountEntry::Charge(Money::from_cents(100))))
            .await
            .unwrap_err();
        assert_eq!(blocked.kind(), ErrorKind::IntegrityFault);
    }

    #[tokio::test]
    async fn test_append_detects_drift_before_writing() {
        let db = db_with_account("cust-1", 10_000).await;
        sqlx::query("UPDATE customer_accounts SET balance = 12000 WHERE customer_id = 'cust-1'")
            .execute(db.pool())
            .await
            .unwrap();

        let err = db
            .ledger()
            .append_account(&entry("cust-1", AccountEntry::Charge(Money::from_cents(100))))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityFault);

        let account = db.accounts().get_account("cust-1").await.unwrap().unwrap();
        assert!(account.integrity_hold);
        assert_eq!(account.movement_count, 1);
    }

    #[tokio::test]
    async fn test_cash_append_and_verify() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let session = db
            .sessions()
            .open_session(&OpenSession {
                register_id: "reg-1".into(),
                initial_amount: Money::from_cents(10_000),
                opening_notes: None,
                adjustment_reason: None,
                actor_id: "cashier".into(),
            })
            .await
            .unwrap();

        let ledger = db.ledger();
        let cash = ledger
            .append_cash(&NewCashMovement {
                session_id: session.id.clone(),
                payment_method_id: "cash".into(),
                amount: Money::from_cents(2_500),
                description: "sale".into(),
                notes: None,
                actor_id: "cashier".into(),
            })
            .await
            .unwrap();
        assert_eq!(cash.expected_cash_after, Money::from_cents(12_500));

        let card = ledger
            .append_cash(&NewCashMovement {
                session_id: session.id.clone(),
                payment_method_id: "credit_card".into(),
                amount: Money::from_cents(4_000),
                description: "sale".into(),
                notes: None,
                actor_id: "cashier".into(),
            })
            .await
            .unwrap();
        assert_eq!(card.expected_cash_after, Money::from_cents(12_500));

        assert_eq!(ledger.sum_for_session(&session.id, None).await.unwrap(), Money::from_cents(12_500));
        let verified = ledger.verify_session(&session.id, "auditor").await.unwrap();
        assert_eq!(verified.movement_count, 2);

        let page = ledger
            .list_cash_movements(&session.id, &PageRequest::default(), DateRange::all())
            .await
            .unwrap();
        assert_eq!(page.items[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_verify_all_collects_issues() {
        let db = db_with_account("cust-1", 100).await;
        db.accounts()
            .charge(&NewCharge {
                customer_id: "cust-2".into(),
                amount: Money::from_cents(200),
                description: "sale".into(),
                notes: None,
                actor_id: "cashier".into(),
            })
            .await
            .unwrap();

        sqlx::query("UPDATE customer_accounts SET balance = 1 WHERE customer_id = 'cust-2'")
            .execute(db.pool())
            .await
            .unwrap();

        let report = db.ledger().verify_all("auditor").await.unwrap();
        assert_eq!(report.accounts_checked, 2);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].id, "cust-2");
        assert!(!report.is_clean());
    }
}
