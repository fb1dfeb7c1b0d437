//! # Customer Account Engine
//!
//! Credit accounts ("cuenta corriente"): sales on credit, payments,
//! manual adjustments and interest surcharges, each posted through the
//! movement ledger under a row lock on the account.
//!
//! ## Balance Sign Convention
//! ```text
//!   balance > 0   customer owes the business    (customer_owes)
//!   balance < 0   business owes the customer    (business_owes)
//!   balance = 0   settled
//! ```
//!
//! ## Status Machine
//! ```text
//!            ┌──────────────┐
//!    ┌──────►│    active    │◄──────┐
//!    │       └──────┬───────┘       │
//!    │              │ set_status /  │ set_status
//!    │              ▼ refresh_overdue
//!    │       ┌──────────────┐       │
//!    │       │  suspended   │───────┘
//!    │       └──────┬───────┘
//!    │              │ balance == 0
//!    │              ▼
//!    │       ┌──────────────┐
//!    └───────│    closed    │  (terminal)
//!    balance └──────────────┘
//!    == 0
//! ```
//!
//! Every committed mutation emits one audit record after commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tally_core::account::{self as rules, AccountEntry};
use tally_core::statement::build_statement;
use tally_core::validation::{validate_id, validate_non_negative_amount, validate_page, validate_text};
use tally_core::{
    AccountFilter, AccountMovement, AccountStats, AccountStatus, AuditAction, AuditEntity, AuditRecord,
    CustomerAccount, DateRange, LedgerError, LedgerResult, Money, NewAdjustment, NewCharge, NewPayment,
    NewSurcharge, OverdueAlert, OverdueRefresh, Page, PageRequest, Statement, Surcharge,
    MAX_DESCRIPTION_LEN, SYSTEM_ACTOR,
};
use tracing::{debug, info, warn};

use crate::audit::{self, AuditRecorder};
use crate::config::AccountPolicy;
use crate::error::{DbError, DbResult};
use crate::repository::ledger::{self, AccountAppend, EntryMeta, LedgerRepository};
use crate::repository::rows::{AccountRow, ACCOUNT_COLUMNS};
use crate::tx::{self, Aggregate};

#[derive(Debug, sqlx::FromRow)]
struct KeyedAccountRow {
    page_key: i64,
    #[sqlx(flatten)]
    account: AccountRow,
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    total_accounts: i64,
    active_accounts: i64,
    suspended_accounts: i64,
    closed_accounts: i64,
    debtor_accounts: i64,
    total_receivable: i64,
    total_credit: i64,
    overdue_accounts: i64,
    accounts_on_hold: i64,
}

/// Repository for customer account operations.
#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
    audit: Arc<dyn AuditRecorder>,
    policy: AccountPolicy,
}

impl AccountRepository {
    /// Creates a new AccountRepository.
    pub fn new(pool: SqlitePool, audit: Arc<dyn AuditRecorder>, policy: AccountPolicy) -> Self {
        AccountRepository { pool, audit, policy }
    }

    fn ledger(&self) -> LedgerRepository {
        LedgerRepository::new(self.pool.clone(), self.audit.clone())
    }

    // =========================================================================
    // Movements
    // =========================================================================

    /// Records a sale on credit.
    ///
    /// Opens an empty active account on the customer's first charge.
    ///
    /// ## Errors
    /// - `CreditLimitExceeded` if a limit is set and the new balance would pass it
    /// - `AccountSuspended` / `AccountClosed`
    pub async fn charge(&self, req: &NewCharge) -> LedgerResult<AccountMovement> {
        req.validate()?;

        let meta = EntryMeta {
            customer_id: &req.customer_id,
            description: &req.description,
            payment_method_id: None,
            notes: req.notes.as_deref(),
            actor_id: &req.actor_id,
        };
        let amount = req.amount;
        let appended =
            ledger::append_account_entry(&self.pool, &*self.audit, meta, true, |_| Ok(AccountEntry::Charge(amount)))
                .await?;

        self.committed(&appended, AuditAction::Charge).await;
        Ok(appended.movement)
    }

    /// Records a customer payment.
    ///
    /// Allowed on suspended accounts. Paying more than the debt leaves the
    /// business owing the customer (negative balance).
    pub async fn record_payment(&self, req: &NewPayment) -> LedgerResult<AccountMovement> {
        req.validate()?;

        let meta = EntryMeta {
            customer_id: &req.customer_id,
            description: &req.description,
            payment_method_id: Some(&req.payment_method_id),
            notes: req.notes.as_deref(),
            actor_id: &req.actor_id,
        };
        let amount = req.amount;
        let appended =
            ledger::append_account_entry(&self.pool, &*self.audit, meta, true, |_| Ok(AccountEntry::Payment(amount)))
                .await?;

        if appended.after.balance.is_negative() {
            debug!(
                customer_id = %req.customer_id,
                balance = %appended.after.balance,
                "Payment left the customer in credit"
            );
        }

        self.committed(&appended, AuditAction::Payment).await;
        Ok(appended.movement)
    }

    /// Posts a manual correction. Positive adds debt, negative removes it.
    ///
    /// A closed account accepts only the adjustment that brings it to zero.
    pub async fn adjust_balance(&self, req: &NewAdjustment) -> LedgerResult<AccountMovement> {
        req.validate()?;

        let meta = EntryMeta {
            customer_id: &req.customer_id,
            description: &req.reason,
            payment_method_id: None,
            notes: None,
            actor_id: &req.actor_id,
        };
        let amount = req.amount;
        let appended = ledger::append_account_entry(&self.pool, &*self.audit, meta, false, |_| {
            Ok(AccountEntry::Adjustment(amount))
        })
        .await?;

        self.committed(&appended, AuditAction::Adjustment).await;
        Ok(appended.movement)
    }

    /// Adds interest on the outstanding debt.
    ///
    /// The percentage is applied to the balance read under the lock.
    /// Interest is not subject to the credit limit.
    pub async fn apply_surcharge(&self, req: &NewSurcharge) -> LedgerResult<AccountMovement> {
        req.validate()?;

        let description = req
            .description
            .clone()
            .unwrap_or_else(|| default_surcharge_description(req.surcharge));
        let meta = EntryMeta {
            customer_id: &req.customer_id,
            description: &description,
            payment_method_id: None,
            notes: None,
            actor_id: &req.actor_id,
        };
        let surcharge = req.surcharge;
        let appended = ledger::append_account_entry(&self.pool, &*self.audit, meta, false, |account| {
            rules::surcharge_amount(&account.customer_id, account.balance, surcharge).map(AccountEntry::Interest)
        })
        .await?;

        info!(
            customer_id = %req.customer_id,
            amount = %appended.movement.amount,
            balance = %appended.after.balance,
            "Surcharge applied"
        );

        self.committed(&appended, AuditAction::Surcharge).await;
        Ok(appended.movement)
    }

    async fn committed(&self, appended: &AccountAppend, action: AuditAction) {
        ledger::audit_account_append(&*self.audit, appended, action).await;
    }

    // =========================================================================
    // Account Settings
    // =========================================================================

    /// Changes the account status.
    ///
    /// Setting the current status again changes nothing and is not audited.
    ///
    /// ## Errors
    /// - `NonZeroBalance` when closing with an outstanding balance
    /// - `InvalidState` when leaving `closed`
    pub async fn set_status(&self, customer_id: &str, status: AccountStatus, actor_id: &str) -> LedgerResult<CustomerAccount> {
        validate_id("customer_id", customer_id)?;
        validate_id("actor_id", actor_id)?;

        let mut tx = tx::begin(&self.pool).await?;
        let Some(row) = ledger::lock_account(&mut tx, customer_id).await? else {
            return Err(LedgerError::not_found("customer account", customer_id));
        };
        if row.integrity_hold {
            return Err(tx::on_hold(Aggregate::Account, customer_id));
        }

        let before = CustomerAccount::from(row);
        rules::check_transition(customer_id, before.status, status, before.balance)?;
        if before.status == status {
            return Ok(before);
        }

        let after = update_account(&mut tx, customer_id, "status = ?2", status).await?;
        tx::commit(tx).await?;

        info!(
            customer_id = %customer_id,
            from = before.status.as_str(),
            to = status.as_str(),
            "Account status changed"
        );

        audit::emit(
            &*self.audit,
            AuditRecord::new(
                AuditEntity::CustomerAccount,
                customer_id,
                AuditAction::StatusChange,
                Some(&before),
                Some(&after),
                actor_id,
            ),
        )
        .await;

        Ok(after)
    }

    /// Sets or removes (`None`) the credit limit.
    ///
    /// Lowering the limit below the current balance is allowed; it only
    /// blocks further charges.
    pub async fn set_credit_limit(
        &self,
        customer_id: &str,
        limit: Option<Money>,
        actor_id: &str,
    ) -> LedgerResult<CustomerAccount> {
        validate_id("customer_id", customer_id)?;
        validate_id("actor_id", actor_id)?;
        if let Some(limit) = limit {
            validate_non_negative_amount("credit_limit", limit)?;
        }

        let mut tx = tx::begin(&self.pool).await?;
        let row = ledger::lock_or_open_account(&mut tx, customer_id, Utc::now()).await?;
        if row.integrity_hold {
            return Err(tx::on_hold(Aggregate::Account, customer_id));
        }
        if row.status == AccountStatus::Closed {
            return Err(LedgerError::AccountClosed {
                customer_id: customer_id.to_string(),
            });
        }

        let before = CustomerAccount::from(row);
        let after = update_account(&mut tx, customer_id, "credit_limit = ?2", limit.map(|l| l.cents())).await?;
        tx::commit(tx).await?;

        if let Some(limit) = limit {
            if before.balance > limit {
                warn!(
                    customer_id = %customer_id,
                    balance = %before.balance,
                    limit = %limit,
                    "Credit limit set below current balance"
                );
            }
        }

        audit::emit(
            &*self.audit,
            AuditRecord::new(
                AuditEntity::CustomerAccount,
                customer_id,
                AuditAction::CreditLimitChange,
                Some(&before),
                Some(&after),
                actor_id,
            ),
        )
        .await;

        Ok(after)
    }

    /// Lifts an integrity hold after manual reconciliation.
    ///
    /// The ledger is verified first; if it still disagrees with the cached
    /// balance the hold stays and `IntegrityFault` is returned.
    pub async fn release_hold(&self, customer_id: &str, reason: &str, actor_id: &str) -> LedgerResult<CustomerAccount> {
        validate_text("reason", reason, MAX_DESCRIPTION_LEN)?;
        validate_id("actor_id", actor_id)?;

        let verification = self.ledger().verify_account(customer_id, actor_id).await?;
        if verification.on_hold {
            tx::set_hold(&self.pool, Aggregate::Account, customer_id, false).await?;

            info!(customer_id = %customer_id, actor = %actor_id, "Integrity hold released");

            audit::emit(
                &*self.audit,
                AuditRecord::new::<serde_json::Value>(
                    AuditEntity::CustomerAccount,
                    customer_id,
                    AuditAction::HoldReleased,
                    None,
                    None,
                    actor_id,
                )
                .with_description(reason.trim()),
            )
            .await;
        }

        self.get_account(customer_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("customer account", customer_id))
    }

    // =========================================================================
    // Overdue Policy
    // =========================================================================

    /// Recomputes `days_overdue` as of `now` and applies auto-suspension.
    ///
    /// Each account is handled in its own transaction; accounts on hold are
    /// skipped. Every auto-suspension is audited as the system actor.
    pub async fn refresh_overdue(&self, now: DateTime<Utc>) -> LedgerResult<OverdueRefresh> {
        let candidates: Vec<String> = sqlx::query_scalar(
            "SELECT customer_id FROM customer_accounts \
             WHERE (balance > 0 OR days_overdue > 0) AND integrity_hold = 0 \
             ORDER BY customer_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let mut refresh = OverdueRefresh {
            updated: 0,
            suspended: Vec::new(),
        };

        for customer_id in candidates {
            let mut tx = tx::begin(&self.pool).await?;
            let Some(row) = ledger::lock_account(&mut tx, &customer_id).await? else {
                continue;
            };
            if row.integrity_hold {
                continue;
            }

            let before = CustomerAccount::from(row);
            let days = rules::days_overdue(before.balance, before.last_charge_at, now);
            let suspend = rules::should_auto_suspend(before.status, days, self.policy.suspend_after_days);
            if days == before.days_overdue && !suspend {
                continue;
            }

            let status = if suspend { AccountStatus::Suspended } else { before.status };
            let sql = format!(
                "UPDATE customer_accounts SET days_overdue = ?2, status = ?3, updated_at = ?4 \
                 WHERE customer_id = ?1 RETURNING {ACCOUNT_COLUMNS}"
            );
            let after: AccountRow = sqlx::query_as(&sql)
                .bind(&customer_id)
                .bind(days)
                .bind(status)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(DbError::from)?;
            tx::commit(tx).await?;

            refresh.updated += 1;

            if suspend {
                let after = CustomerAccount::from(after);
                warn!(
                    customer_id = %customer_id,
                    days_overdue = days,
                    balance = %after.balance,
                    "Account auto-suspended for overdue debt"
                );
                audit::emit(
                    &*self.audit,
                    AuditRecord::new(
                        AuditEntity::CustomerAccount,
                        &customer_id,
                        AuditAction::AutoSuspend,
                        Some(&before),
                        Some(&after),
                        SYSTEM_ACTOR,
                    )
                    .with_description(format!("{days} days overdue")),
                )
                .await;
                refresh.suspended.push(customer_id);
            }
        }

        info!(
            updated = refresh.updated,
            suspended = refresh.suspended.len(),
            "Overdue refresh finished"
        );

        Ok(refresh)
    }

    /// Debtors with overdue days, most overdue first.
    pub async fn overdue_alerts(&self) -> DbResult<Vec<OverdueAlert>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM customer_accounts \
             WHERE balance > 0 AND days_overdue > 0 \
             ORDER BY days_overdue DESC, balance DESC"
        );
        let rows: Vec<AccountRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| OverdueAlert {
                customer_id: row.customer_id,
                balance: Money::from_cents(row.balance),
                days_overdue: row.days_overdue,
                status: row.status,
                last_charge_at: row.last_charge_at,
            })
            .collect())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Gets an account by customer ID.
    pub async fn get_account(&self, customer_id: &str) -> LedgerResult<Option<CustomerAccount>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM customer_accounts WHERE customer_id = ?1");
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(row.map(CustomerAccount::from))
    }

    /// Builds the statement of an account over `range`.
    ///
    /// The opening balance is the signed sum of everything before
    /// `range.from`; both reads share one snapshot.
    pub async fn get_statement(&self, customer_id: &str, range: DateRange) -> LedgerResult<Statement> {
        let mut tx = tx::begin(&self.pool).await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM customer_accounts WHERE customer_id = ?1")
            .bind(customer_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::from)?;
        if exists.is_none() {
            return Err(LedgerError::not_found("customer account", customer_id));
        }

        let opening_balance = match range.from {
            Some(from) => ledger::account_sum_before(&mut *tx, customer_id, from).await?,
            None => Money::zero(),
        };
        let movements = ledger::account_movements_in(&mut *tx, customer_id, range).await?;
        tx.rollback().await.map_err(DbError::from)?;

        Ok(build_statement(customer_id, range, opening_balance, movements))
    }

    /// Lists accounts in creation order.
    pub async fn list_accounts(&self, filter: &AccountFilter, page: &PageRequest) -> LedgerResult<Page<CustomerAccount>> {
        validate_page(page)?;
        let after = ledger::resume_key(page, 0)?;

        let sql = format!(
            r#"
            SELECT rowid AS page_key, {ACCOUNT_COLUMNS}
            FROM customer_accounts
            WHERE rowid > ?1
              AND (?2 IS NULL OR status = ?2)
              AND (?3 = 0 OR balance > 0)
            ORDER BY rowid
            LIMIT ?4
            "#
        );
        let rows: Vec<KeyedAccountRow> = sqlx::query_as(&sql)
            .bind(after)
            .bind(filter.status)
            .bind(filter.debtors_only)
            .bind(page.limit as i64 + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let keyed: Vec<(i64, CustomerAccount)> = rows
            .into_iter()
            .map(|r| (r.page_key, CustomerAccount::from(r.account)))
            .collect();
        let page = ledger::into_page(keyed, page.limit, |(key, _)| *key);

        Ok(Page {
            items: page.items.into_iter().map(|(_, account)| account).collect(),
            next: page.next,
        })
    }

    /// Accounts with a positive balance, largest debt first.
    pub async fn debtors(&self) -> DbResult<Vec<CustomerAccount>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM customer_accounts WHERE balance > 0 \
             ORDER BY balance DESC, customer_id"
        );
        let rows: Vec<AccountRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(CustomerAccount::from).collect())
    }

    /// Portfolio totals across every account.
    pub async fn stats(&self) -> DbResult<AccountStats> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS total_accounts,
                COALESCE(SUM(status = 'active'), 0) AS active_accounts,
                COALESCE(SUM(status = 'suspended'), 0) AS suspended_accounts,
                COALESCE(SUM(status = 'closed'), 0) AS closed_accounts,
                COALESCE(SUM(balance > 0), 0) AS debtor_accounts,
                COALESCE(SUM(CASE WHEN balance > 0 THEN balance ELSE 0 END), 0) AS total_receivable,
                COALESCE(SUM(CASE WHEN balance < 0 THEN -balance ELSE 0 END), 0) AS total_credit,
                COALESCE(SUM(balance > 0 AND days_overdue > 0), 0) AS overdue_accounts,
                COALESCE(SUM(integrity_hold), 0) AS accounts_on_hold
            FROM customer_accounts
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(AccountStats {
            total_accounts: row.total_accounts,
            active_accounts: row.active_accounts,
            suspended_accounts: row.suspended_accounts,
            closed_accounts: row.closed_accounts,
            debtor_accounts: row.debtor_accounts,
            total_receivable: Money::from_cents(row.total_receivable),
            total_credit: Money::from_cents(row.total_credit),
            overdue_accounts: row.overdue_accounts,
            accounts_on_hold: row.accounts_on_hold,
        })
    }
}

/// Updates one column of a locked account and returns the new state.
async fn update_account<T>(tx: &mut tx::Tx, customer_id: &str, assignment: &str, value: T) -> LedgerResult<CustomerAccount>
where
    T: for<'q> sqlx::Encode<'q, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite> + Send + 'static,
{
    let sql = format!(
        "UPDATE customer_accounts SET {assignment}, updated_at = ?3 \
         WHERE customer_id = ?1 RETURNING {ACCOUNT_COLUMNS}"
    );
    let row: AccountRow = sqlx::query_as(&sql)
        .bind(customer_id)
        .bind(value)
        .bind(Utc::now())
        .fetch_one(&mut **tx)
        .await
        .map_err(DbError::from)?;
    Ok(CustomerAccount::from(row))
}

fn default_surcharge_description(surcharge: Surcharge) -> String {
    match surcharge {
        Surcharge::Percentage { bps } => format!("Interest {}.{:02}%", bps / 100, bps % 100),
        Surcharge::Fixed { amount } => format!("Interest {amount}"),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use async_trait::async_trait;
    use chrono::Duration;
    use tally_core::{CustomerPosition, ErrorKind};

    fn charge(customer_id: &str, cents: i64) -> NewCharge {
        NewCharge {
            customer_id: customer_id.into(),
            amount: Money::from_cents(cents),
            description: "sale".into(),
            notes: None,
            actor_id: "cashier".into(),
        }
    }

    fn payment(customer_id: &str, cents: i64) -> NewPayment {
        NewPayment {
            customer_id: customer_id.into(),
            amount: Money::from_cents(cents),
            payment_method_id: "cash".into(),
            description: "payment".into(),
            notes: None,
            actor_id: "cashier".into(),
        }
    }

    fn adjustment(customer_id: &str, cents: i64) -> NewAdjustment {
        NewAdjustment {
            customer_id: customer_id.into(),
            amount: Money::from_cents(cents),
            reason: "correction".into(),
            actor_id: "manager".into(),
        }
    }

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_credit_account_scenario() {
        let db = setup().await;
        let accounts = db.accounts();

        accounts.set_credit_limit("C1", Some(Money::from_cents(100_000)), "manager").await.unwrap();

        let m = accounts.charge(&charge("C1", 60_000)).await.unwrap();
        assert_eq!(m.resulting_balance, Money::from_cents(60_000));

        let err = accounts.charge(&charge("C1", 50_000)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CreditLimitExceeded);

        let m = accounts.record_payment(&payment("C1", 20_000)).await.unwrap();
        assert_eq!(m.resulting_balance, Money::from_cents(40_000));

        let m = accounts.charge(&charge("C1", 50_000)).await.unwrap();
        assert_eq!(m.resulting_balance, Money::from_cents(90_000));

        accounts.set_status("C1", AccountStatus::Suspended, "manager").await.unwrap();
        let err = accounts.charge(&charge("C1", 1_000)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(matches!(err, LedgerError::AccountSuspended { .. }));

        let m = accounts.record_payment(&payment("C1", 90_000)).await.unwrap();
        assert_eq!(m.resulting_balance, Money::zero());

        let closed = accounts.set_status("C1", AccountStatus::Closed, "manager").await.unwrap();
        assert_eq!(closed.status, AccountStatus::Closed);
    }

    #[tokio::test]
    async fn test_payment_without_debt_creates_credit() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.set_credit_limit("C1", None, "manager").await.unwrap();

        let m = accounts.record_payment(&payment("C1", 100)).await.unwrap();
        assert_eq!(m.resulting_balance, Money::from_cents(-100));

        let err = accounts.set_status("C1", AccountStatus::Closed, "manager").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonZeroBalance);

        accounts.charge(&charge("C1", 100)).await.unwrap();
        let closed = accounts.set_status("C1", AccountStatus::Closed, "manager").await.unwrap();
        assert_eq!(closed.status, AccountStatus::Closed);
        assert_eq!(closed.balance, Money::zero());
    }

    #[tokio::test]
    async fn test_credit_limit_boundary_is_inclusive() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.set_credit_limit("C1", Some(Money::from_cents(10_000)), "manager").await.unwrap();

        accounts.charge(&charge("C1", 10_000)).await.unwrap();
        let err = accounts.charge(&charge("C1", 1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::CreditLimitExceeded { .. }));

        let account = accounts.get_account("C1").await.unwrap().unwrap();
        assert_eq!(account.balance, Money::from_cents(10_000));
        assert_eq!(account.movement_count, 1);
    }

    #[tokio::test]
    async fn test_balance_equals_sum_of_movements() {
        let db = setup().await;
        let accounts = db.accounts();

        accounts.charge(&charge("C1", 12_345)).await.unwrap();
        accounts.record_payment(&payment("C1", 2_345)).await.unwrap();
        accounts.adjust_balance(&adjustment("C1", -1_000)).await.unwrap();
        accounts
            .apply_surcharge(&NewSurcharge {
                customer_id: "C1".into(),
                surcharge: Surcharge::Percentage { bps: 350 },
                description: None,
                actor_id: "manager".into(),
            })
            .await
            .unwrap();
        // Rejected operations leave no trace.
        let _ = accounts.adjust_balance(&adjustment("C1", 0)).await.unwrap_err();

        let account = accounts.get_account("C1").await.unwrap().unwrap();
        // 12345 - 2345 - 1000 = 9000, plus 3.5% = 315
        assert_eq!(account.balance, Money::from_cents(9_315));
        assert_eq!(account.movement_count, 4);
        assert_eq!(db.ledger().sum_for_account("C1", None).await.unwrap(), account.balance);
    }

    #[tokio::test]
    async fn test_surcharge_requires_debt() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.record_payment(&payment("C1", 500)).await.unwrap();

        let err = accounts
            .apply_surcharge(&NewSurcharge {
                customer_id: "C1".into(),
                surcharge: Surcharge::Fixed {
                    amount: Money::from_cents(100),
                },
                description: None,
                actor_id: "manager".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_surcharge_ignores_credit_limit() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.set_credit_limit("C1", Some(Money::from_cents(10_000)), "manager").await.unwrap();
        accounts.charge(&charge("C1", 10_000)).await.unwrap();

        let m = accounts
            .apply_surcharge(&NewSurcharge {
                customer_id: "C1".into(),
                surcharge: Surcharge::Percentage { bps: 1_000 },
                description: Some("late fee".into()),
                actor_id: "manager".into(),
            })
            .await
            .unwrap();

        assert_eq!(m.amount, Money::from_cents(1_000));
        assert_eq!(m.resulting_balance, Money::from_cents(11_000));
        assert_eq!(m.description, "late fee");
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.charge(&charge("C1", 500)).await.unwrap();

        let err = accounts.set_status("C1", AccountStatus::Closed, "manager").await.unwrap_err();
        assert!(matches!(err, LedgerError::NonZeroBalance { .. }));

        accounts.adjust_balance(&adjustment("C1", -500)).await.unwrap();
        accounts.set_status("C1", AccountStatus::Closed, "manager").await.unwrap();

        let err = accounts.set_status("C1", AccountStatus::Active, "manager").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err = accounts.record_payment(&payment("C1", 100)).await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountClosed { .. }));

        let missing = accounts.set_status("nobody", AccountStatus::Suspended, "manager").await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::EntityNotFound);
    }

    #[tokio::test]
    async fn test_repeated_status_is_not_audited() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.charge(&charge("C1", 500)).await.unwrap();

        accounts.set_status("C1", AccountStatus::Suspended, "manager").await.unwrap();
        accounts.set_status("C1", AccountStatus::Suspended, "manager").await.unwrap();

        let trail = db.audit_log().for_entity(AuditEntity::CustomerAccount, "C1").await.unwrap();
        let changes = trail.iter().filter(|r| r.action == AuditAction::StatusChange).count();
        assert_eq!(changes, 1);
    }

    #[tokio::test]
    async fn test_statement_round_trip() {
        let db = setup().await;
        let accounts = db.accounts();

        accounts.charge(&charge("C1", 10_000)).await.unwrap();
        accounts.record_payment(&payment("C1", 3_000)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let from = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        accounts.charge(&charge("C1", 2_000)).await.unwrap();
        accounts.adjust_balance(&adjustment("C1", -500)).await.unwrap();
        let to = Utc::now();

        let statement = accounts.get_statement("C1", DateRange::between(from, to)).await.unwrap();
        assert_eq!(statement.opening_balance, Money::from_cents(7_000));
        assert_eq!(statement.movements.len(), 2);
        assert_eq!(statement.total_charges, Money::from_cents(2_000));
        assert_eq!(statement.total_adjustments, Money::from_cents(-500));
        assert_eq!(statement.closing_balance, Money::from_cents(8_500));
        assert_eq!(statement.position, CustomerPosition::CustomerOwes);

        let effects: Money = statement.movements.iter().map(|m| m.signed_effect).sum();
        assert_eq!(statement.opening_balance + effects, statement.closing_balance);
        assert_eq!(
            db.ledger().sum_for_account("C1", Some(to)).await.unwrap(),
            statement.closing_balance
        );
    }

    #[tokio::test]
    async fn test_payment_can_leave_customer_in_credit() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.charge(&charge("C1", 1_000)).await.unwrap();
        accounts.record_payment(&payment("C1", 1_500)).await.unwrap();

        let statement = accounts.get_statement("C1", DateRange::all()).await.unwrap();
        assert_eq!(statement.closing_balance, Money::from_cents(-500));
        assert_eq!(statement.position, CustomerPosition::BusinessOwes);

        let stats = accounts.stats().await.unwrap();
        assert_eq!(stats.total_credit, Money::from_cents(500));
        assert_eq!(stats.debtor_accounts, 0);
    }

    #[tokio::test]
    async fn test_unknown_payment_method_is_rejected() {
        let db = setup().await;
        let mut req = payment("C1", 100);
        req.payment_method_id = "barter".into();

        let err = db.accounts().record_payment(&req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EntityNotFound);
    }

    #[tokio::test]
    async fn test_list_accounts_filters_and_pages() {
        let db = setup().await;
        let accounts = db.accounts();
        for (i, cents) in [500, 0, 700, 900].iter().enumerate() {
            let id = format!("C{i}");
            if *cents > 0 {
                accounts.charge(&charge(&id, *cents)).await.unwrap();
            } else {
                accounts.set_credit_limit(&id, None, "manager").await.unwrap();
            }
        }

        let filter = AccountFilter {
            status: None,
            debtors_only: true,
        };
        let first = accounts.list_accounts(&filter, &PageRequest::first(2)).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let second = accounts
            .list_accounts(&filter, &PageRequest::after(2, first.next.unwrap()))
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.is_last());

        let all = accounts.list_accounts(&AccountFilter::default(), &PageRequest::default()).await.unwrap();
        assert_eq!(all.items.len(), 4);

        let debtors = accounts.debtors().await.unwrap();
        assert_eq!(debtors[0].customer_id, "C3");
        assert_eq!(debtors.len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_overdue_suspends_old_debt() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.charge(&charge("C1", 5_000)).await.unwrap();
        accounts.charge(&charge("C2", 5_000)).await.unwrap();
        accounts.record_payment(&payment("C2", 5_000)).await.unwrap();

        let later = Utc::now() + Duration::days(45);
        let refresh = accounts.refresh_overdue(later).await.unwrap();
        assert_eq!(refresh.suspended, vec!["C1".to_string()]);

        let c1 = accounts.get_account("C1").await.unwrap().unwrap();
        assert_eq!(c1.status, AccountStatus::Suspended);
        assert!(c1.days_overdue >= 44);

        let c2 = accounts.get_account("C2").await.unwrap().unwrap();
        assert_eq!(c2.status, AccountStatus::Active);
        assert_eq!(c2.days_overdue, 0);

        let alerts = accounts.overdue_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].customer_id, "C1");

        let trail = db.audit_log().for_entity(AuditEntity::CustomerAccount, "C1").await.unwrap();
        let auto = trail.iter().find(|r| r.action == AuditAction::AutoSuspend).unwrap();
        assert_eq!(auto.actor_id, SYSTEM_ACTOR);
    }

    #[tokio::test]
    async fn test_refresh_overdue_respects_disabled_policy() {
        let db = Database::new(DbConfig::in_memory().account_policy(AccountPolicy { suspend_after_days: 0 }))
            .await
            .unwrap();
        db.accounts().charge(&charge("C1", 5_000)).await.unwrap();

        let refresh = db.accounts().refresh_overdue(Utc::now() + Duration::days(400)).await.unwrap();
        assert!(refresh.suspended.is_empty());
        assert_eq!(refresh.updated, 1);
    }

    #[tokio::test]
    async fn test_release_hold_requires_consistent_ledger() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.charge(&charge("C1", 5_000)).await.unwrap();

        sqlx::query("UPDATE customer_accounts SET balance = 4000 WHERE customer_id = 'C1'")
            .execute(db.pool())
            .await
            .unwrap();
        assert!(db.ledger().verify_account("C1", "auditor").await.is_err());

        let err = accounts.release_hold("C1", "looked fine", "manager").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityFault);

        sqlx::query("UPDATE customer_accounts SET balance = 5000 WHERE customer_id = 'C1'")
            .execute(db.pool())
            .await
            .unwrap();
        let released = accounts.release_hold("C1", "restored from paper ledger", "manager").await.unwrap();
        assert!(!released.integrity_hold);

        accounts.charge(&charge("C1", 100)).await.unwrap();
    }

    #[derive(Debug)]
    struct FailingRecorder;

    #[async_trait]
    impl AuditRecorder for FailingRecorder {
        async fn record(&self, _record: &AuditRecord) -> DbResult<()> {
            Err(DbError::Internal("audit sink offline".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_audit_does_not_undo_commit() {
        let db = setup().await.with_audit_recorder(Arc::new(FailingRecorder));

        let m = db.accounts().charge(&charge("C1", 2_500)).await.unwrap();
        assert_eq!(m.resulting_balance, Money::from_cents(2_500));

        let account = db.accounts().get_account("C1").await.unwrap().unwrap();
        assert_eq!(account.balance, Money::from_cents(2_500));
    }

    #[tokio::test]
    async fn test_extreme_adjustment_rejected_without_writing() {
        let db = setup().await;
        let accounts = db.accounts();
        accounts.charge(&charge("C1", 1_000)).await.unwrap();

        for cents in [i64::MIN, i64::MAX, -(tally_core::MAX_AMOUNT_CENTS + 1)] {
            let err = accounts.adjust_balance(&adjustment("C1", cents)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidAmount);
        }

        let account = accounts.get_account("C1").await.unwrap().unwrap();
        assert_eq!(account.balance, Money::from_cents(1_000));
        assert_eq!(account.movement_count, 1);
        db.ledger().verify_account("C1", "auditor").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_charges_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let config = DbConfig::new(dir.path().join("ledger.db")).max_connections(8);
        let db = Database::new(config).await.unwrap();

        let accounts = db.accounts();
        accounts.set_credit_limit("C1", None, "manager").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let accounts = db.accounts();
            handles.push(tokio::spawn(async move { accounts.charge(&charge("C1", 250)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let account = accounts.get_account("C1").await.unwrap().unwrap();
        assert_eq!(account.balance, Money::from_cents(16 * 250));
        assert_eq!(account.movement_count, 16);

        let page = db
            .ledger()
            .list_account_movements("C1", &PageRequest::first(100), DateRange::all())
            .await
            .unwrap();
        let mut sequences: Vec<i64> = page.items.iter().map(|m| m.sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=16).collect::<Vec<_>>());
        db.ledger().verify_account("C1", "auditor").await.unwrap();
    }
}
