//! Row types shared by the repositories.
//!
//! Money columns are INTEGER cents in SQLite and become [`Money`] here.

use chrono::{DateTime, Utc};
use tally_core::{
    AccountMovement, AccountStatus, CashMovement, CashSession, CustomerAccount, Money,
    MovementType, PaymentMethod, PaymentMethodKind, SessionState,
};

pub(crate) const ACCOUNT_COLUMNS: &str = "customer_id, balance, status, credit_limit, days_overdue, \
     last_charge_at, last_payment_at, movement_count, integrity_hold, created_at, updated_at";

pub(crate) const MOVEMENT_COLUMNS: &str = "id, customer_id, sequence, movement_type, amount, \
     signed_effect, balance_before, resulting_balance, description, payment_method_id, notes, \
     actor_id, created_at";

pub(crate) const SESSION_COLUMNS: &str = "id, register_id, sequence, state, opened_at, closed_at, \
     initial_amount, suggested_initial_amount, adjustment_reason, opening_notes, \
     expected_cash_running, movement_count, actual_cash_amount, expected_cash_amount, \
     discrepancy, closing_notes, opened_by, closed_by, integrity_hold";

pub(crate) const CASH_MOVEMENT_COLUMNS: &str = "id, session_id, sequence, payment_method_id, \
     amount, description, notes, actor_id, expected_cash_after, created_at";

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct AccountRow {
    pub customer_id: String,
    pub balance: i64,
    pub status: AccountStatus,
    pub credit_limit: Option<i64>,
    pub days_overdue: i64,
    pub last_charge_at: Option<DateTime<Utc>>,
    pub last_payment_at: Option<DateTime<Utc>>,
    pub movement_count: i64,
    pub integrity_hold: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AccountRow> for CustomerAccount {
    fn from(row: AccountRow) -> Self {
        CustomerAccount {
            customer_id: row.customer_id,
            balance: Money::from_cents(row.balance),
            status: row.status,
            credit_limit: row.credit_limit.map(Money::from_cents),
            days_overdue: row.days_overdue,
            last_charge_at: row.last_charge_at,
            last_payment_at: row.last_payment_at,
            movement_count: row.movement_count,
            integrity_hold: row.integrity_hold,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct MovementRow {
    pub id: String,
    pub customer_id: String,
    pub sequence: i64,
    pub movement_type: MovementType,
    pub amount: i64,
    pub signed_effect: i64,
    pub balance_before: i64,
    pub resulting_balance: i64,
    pub description: String,
    pub payment_method_id: Option<String>,
    pub notes: Option<String>,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<MovementRow> for AccountMovement {
    fn from(row: MovementRow) -> Self {
        AccountMovement {
            id: row.id,
            customer_id: row.customer_id,
            sequence: row.sequence,
            movement_type: row.movement_type,
            amount: Money::from_cents(row.amount),
            signed_effect: Money::from_cents(row.signed_effect),
            balance_before: Money::from_cents(row.balance_before),
            resulting_balance: Money::from_cents(row.resulting_balance),
            description: row.description,
            payment_method_id: row.payment_method_id,
            notes: row.notes,
            actor_id: row.actor_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SessionRow {
    pub id: String,
    pub register_id: String,
    pub sequence: i64,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub initial_amount: i64,
    pub suggested_initial_amount: i64,
    pub adjustment_reason: Option<String>,
    pub opening_notes: Option<String>,
    pub expected_cash_running: i64,
    pub movement_count: i64,
    pub actual_cash_amount: Option<i64>,
    pub expected_cash_amount: Option<i64>,
    pub discrepancy: Option<i64>,
    pub closing_notes: Option<String>,
    pub opened_by: String,
    pub closed_by: Option<String>,
    pub integrity_hold: bool,
}

impl From<SessionRow> for CashSession {
    fn from(row: SessionRow) -> Self {
        CashSession {
            id: row.id,
            register_id: row.register_id,
            sequence: row.sequence,
            state: row.state,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
            initial_amount: Money::from_cents(row.initial_amount),
            suggested_initial_amount: Money::from_cents(row.suggested_initial_amount),
            adjustment_reason: row.adjustment_reason,
            opening_notes: row.opening_notes,
            expected_cash_running: Money::from_cents(row.expected_cash_running),
            movement_count: row.movement_count,
            actual_cash_amount: row.actual_cash_amount.map(Money::from_cents),
            expected_cash_amount: row.expected_cash_amount.map(Money::from_cents),
            discrepancy: row.discrepancy.map(Money::from_cents),
            closing_notes: row.closing_notes,
            opened_by: row.opened_by,
            closed_by: row.closed_by,
            integrity_hold: row.integrity_hold,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct CashMovementRow {
    pub id: String,
    pub session_id: String,
    pub sequence: i64,
    pub payment_method_id: String,
    pub amount: i64,
    pub description: String,
    pub notes: Option<String>,
    pub actor_id: String,
    pub expected_cash_after: i64,
    pub created_at: DateTime<Utc>,
}

impl From<CashMovementRow> for CashMovement {
    fn from(row: CashMovementRow) -> Self {
        CashMovement {
            id: row.id,
            session_id: row.session_id,
            sequence: row.sequence,
            payment_method_id: row.payment_method_id,
            amount: Money::from_cents(row.amount),
            description: row.description,
            notes: row.notes,
            actor_id: row.actor_id,
            expected_cash_after: Money::from_cents(row.expected_cash_after),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PaymentMethodRow {
    pub id: String,
    pub code: String,
    pub name: String,
    pub kind: PaymentMethodKind,
    pub is_active: bool,
}

impl From<PaymentMethodRow> for PaymentMethod {
    fn from(row: PaymentMethodRow) -> Self {
        PaymentMethod {
            id: row.id,
            code: row.code,
            name: row.name,
            kind: row.kind,
            is_active: row.is_active,
        }
    }
}
