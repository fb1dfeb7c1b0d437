//! # Domain Types
//!
//! Core domain types used throughout the Tally ledger.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌──────────────────┐        ┌──────────────────┐                       │
//! │  │ CustomerAccount  │ 1    * │ AccountMovement  │  (immutable)          │
//! │  │  ──────────────  │───────►│  ──────────────  │                       │
//! │  │  customer_id     │        │  sequence        │                       │
//! │  │  balance (cache) │        │  signed_effect   │                       │
//! │  │  status          │        │  resulting_bal.  │                       │
//! │  └──────────────────┘        └──────────────────┘                       │
//! │                                                                         │
//! │  ┌──────────────────┐        ┌──────────────────┐   ┌───────────────┐  │
//! │  │  CashSession     │ 1    * │  CashMovement    │ * │ PaymentMethod │  │
//! │  │  ──────────────  │───────►│  ──────────────  │──►│ ───────────── │  │
//! │  │  register_id     │        │  amount (±)      │ 1 │ kind: cash?   │  │
//! │  │  state           │        │  expected_after  │   └───────────────┘  │
//! │  │  expected (cache)│        └──────────────────┘                       │
//! │  └──────────────────┘                                                   │
//! │                                                                         │
//! │  AuditRecord: write-once {entity, action, before, after, actor}        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Snapshot Pattern
//! Every movement freezes the running value it produced (`resulting_balance`,
//! `expected_cash_after`), so a statement can be read back without replaying
//! the whole ledger, and any drift between snapshot and cache is detectable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::money::Money;

// =============================================================================
// Account Status
// =============================================================================

/// Lifecycle status of a customer account.
///
/// ```text
///   active ◄──────► suspended
///      │                │
///      └──── closed ◄───┘     (only when balance == 0, terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Accepts every movement type.
    Active,
    /// Payments and adjustments only.
    Suspended,
    /// Terminal. Only a balance-zeroing adjustment is accepted.
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Closed => "closed",
        }
    }
}

impl Default for AccountStatus {
    fn default() -> Self {
        AccountStatus::Active
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "suspended" => Ok(AccountStatus::Suspended),
            "closed" => Ok(AccountStatus::Closed),
            _ => Err(ValidationError::NotAllowed {
                field: "status".to_string(),
                allowed: vec!["active".into(), "suspended".into(), "closed".into()],
            }),
        }
    }
}

// =============================================================================
// Movement Type
// =============================================================================

/// Kind of balance-affecting event on a customer account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    /// Sale on credit. Increases what the customer owes.
    Charge,
    /// Customer pays. Decreases what the customer owes.
    Payment,
    /// Manual correction, either direction.
    Adjustment,
    /// Surcharge on outstanding debt. Increases what the customer owes.
    Interest,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Charge => "charge",
            MovementType::Payment => "payment",
            MovementType::Adjustment => "adjustment",
            MovementType::Interest => "interest",
        }
    }
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Customer Account
// =============================================================================

/// A customer's current account.
///
/// `balance` is a cache of the signed sum of the account's movements,
/// updated in the same transaction that appends each movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CustomerAccount {
    /// Owning customer (1:1).
    pub customer_id: String,

    /// Positive: customer owes the business. Negative: business owes customer.
    pub balance: Money,

    pub status: AccountStatus,

    /// `None` means unlimited.
    pub credit_limit: Option<Money>,

    /// Days since the last charge while the account carries debt.
    pub days_overdue: i64,

    #[ts(as = "Option<String>")]
    pub last_charge_at: Option<DateTime<Utc>>,

    #[ts(as = "Option<String>")]
    pub last_payment_at: Option<DateTime<Utc>>,

    /// Sequence of the last appended movement.
    pub movement_count: i64,

    /// Set when a ledger/balance mismatch was detected. Blocks all writes.
    pub integrity_hold: bool,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl CustomerAccount {
    /// Which side owes whom.
    pub fn position(&self) -> CustomerPosition {
        CustomerPosition::from_balance(self.balance)
    }

    /// Whether the account carries debt.
    #[inline]
    pub fn is_debtor(&self) -> bool {
        self.balance.is_positive()
    }
}

// =============================================================================
// Account Movement
// =============================================================================

/// An immutable entry in a customer account's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AccountMovement {
    pub id: String,
    pub customer_id: String,
    /// 1-based, gap-free per account.
    pub sequence: i64,
    pub movement_type: MovementType,
    /// Always positive magnitude.
    pub amount: Money,
    /// Effect on the balance (charge/interest +, payment −, adjustment ±).
    pub signed_effect: Money,
    /// Balance before this movement (frozen).
    pub balance_before: Money,
    /// Balance after this movement (frozen).
    pub resulting_balance: Money,
    pub description: String,
    pub payment_method_id: Option<String>,
    pub notes: Option<String>,
    pub actor_id: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Customer Position
// =============================================================================

/// Which party owes the other, derived from the sign of the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CustomerPosition {
    CustomerOwes,
    BusinessOwes,
    Settled,
}

impl CustomerPosition {
    pub fn from_balance(balance: Money) -> Self {
        if balance.is_positive() {
            CustomerPosition::CustomerOwes
        } else if balance.is_negative() {
            CustomerPosition::BusinessOwes
        } else {
            CustomerPosition::Settled
        }
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a cash-register session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        }
    }
}

// =============================================================================
// Cash Session
// =============================================================================

/// One open → operate → close cycle of a physical register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CashSession {
    pub id: String,
    pub register_id: String,
    /// 1-based per register.
    pub sequence: i64,
    pub state: SessionState,
    #[ts(as = "String")]
    pub opened_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,
    pub initial_amount: Money,
    /// Counted cash of the previous closed session on this register.
    pub suggested_initial_amount: Money,
    /// Why the operator opened with a different amount than suggested.
    pub adjustment_reason: Option<String>,
    pub opening_notes: Option<String>,
    /// Cache: initial + Σ cash-method movements.
    pub expected_cash_running: Money,
    /// Sequence of the last appended cash movement.
    pub movement_count: i64,
    pub actual_cash_amount: Option<Money>,
    pub expected_cash_amount: Option<Money>,
    /// actual − expected, stored as-is (no rounding).
    pub discrepancy: Option<Money>,
    pub closing_notes: Option<String>,
    pub opened_by: String,
    pub closed_by: Option<String>,
    pub integrity_hold: bool,
}

impl CashSession {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }
}

/// The open session of a register, flagged when it was opened on an
/// earlier calendar day (UTC) than today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CurrentSession {
    pub session: CashSession,
    pub is_from_previous_day: bool,
}

// =============================================================================
// Cash Movement
// =============================================================================

/// An immutable entry in a cash session's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CashMovement {
    pub id: String,
    pub session_id: String,
    pub sequence: i64,
    pub payment_method_id: String,
    /// Positive = money in, negative = money out. Never zero.
    pub amount: Money,
    pub description: String,
    pub notes: Option<String>,
    pub actor_id: String,
    /// Running expected cash after this entry (frozen).
    pub expected_cash_after: Money,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Payment Method
// =============================================================================

/// Classification of a payment method. Only `Cash` is counted in the drawer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    Cash,
    Card,
    Transfer,
    Digital,
    Check,
    Other,
}

impl PaymentMethodKind {
    /// Whether movements with this method change the physical drawer.
    #[inline]
    pub fn is_physical_cash(&self) -> bool {
        matches!(self, PaymentMethodKind::Cash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentMethod {
    pub id: String,
    /// Stable business key (`cash`, `debit_card`, ...).
    pub code: String,
    pub name: String,
    pub kind: PaymentMethodKind,
    pub is_active: bool,
}

/// Per payment method totals of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MethodTotal {
    pub session_id: String,
    pub payment_method_id: String,
    pub kind: PaymentMethodKind,
    pub total_in: Money,
    /// Stored as a positive magnitude.
    pub total_out: Money,
    /// Entered at close; `None` while open or when not counted.
    pub counted_amount: Option<Money>,
    /// counted − net, set at close.
    pub difference: Option<Money>,
}

impl MethodTotal {
    /// Net movement for this method (in − out).
    pub fn net(&self) -> Money {
        self.total_in - self.total_out
    }
}

// =============================================================================
// Queries: Date Range, Paging, Filters
// =============================================================================

/// Inclusive timestamp range. Open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DateRange {
    #[ts(as = "Option<String>")]
    pub from: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Unbounded range.
    pub const fn all() -> Self {
        DateRange {
            from: None,
            to: None,
        }
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        DateRange {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// Opaque continuation token for keyset pagination.
///
/// Encodes the key of the last row of the previous page. Holding a token
/// keeps no state on the server; a stale token simply resumes after its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PageToken(String);

impl PageToken {
    const PREFIX: &'static str = "k1.";

    pub fn from_key(key: i64) -> Self {
        PageToken(format!("{}{}", Self::PREFIX, key))
    }

    /// Decodes the key, rejecting tokens this crate did not issue.
    pub fn key(&self) -> LedgerResult<i64> {
        self.0
            .strip_prefix(Self::PREFIX)
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or_else(|| {
                LedgerError::Validation(ValidationError::InvalidFormat {
                    field: "page_token".to_string(),
                    reason: "not a ledger page token".to_string(),
                })
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PageToken {
    fn from(raw: String) -> Self {
        PageToken(raw)
    }
}

/// Page size plus where to resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: u32,
    pub after: Option<PageToken>,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        PageRequest { limit, after: None }
    }

    pub fn after(limit: u32, token: PageToken) -> Self {
        PageRequest {
            limit,
            after: Some(token),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest::first(crate::DEFAULT_PAGE_SIZE)
    }
}

/// One page of results; `next` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// Filter for listing customer accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFilter {
    pub status: Option<AccountStatus>,
    /// Only accounts with a positive balance.
    #[serde(default)]
    pub debtors_only: bool,
}

/// Filter for listing closed sessions and computing session stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFilter {
    pub register_id: Option<String>,
    /// Applied to `opened_at`.
    #[serde(default)]
    pub range: DateRange,
}

// =============================================================================
// Read Models
// =============================================================================

/// Projection of an account's movements over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Statement {
    pub customer_id: String,
    pub range: DateRange,
    /// Balance immediately before the first movement in range.
    pub opening_balance: Money,
    /// Balance after the last movement in range.
    pub closing_balance: Money,
    /// Σ charges and interest in range.
    pub total_charges: Money,
    /// Σ payments in range (positive magnitude).
    pub total_payments: Money,
    /// Σ adjustment effects in range (signed).
    pub total_adjustments: Money,
    /// Oldest first.
    pub movements: Vec<AccountMovement>,
    pub position: CustomerPosition,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AccountStats {
    pub total_accounts: i64,
    pub active_accounts: i64,
    pub suspended_accounts: i64,
    pub closed_accounts: i64,
    pub debtor_accounts: i64,
    /// Σ positive balances.
    pub total_receivable: Money,
    /// Σ |negative balances|.
    pub total_credit: Money,
    pub overdue_accounts: i64,
    pub accounts_on_hold: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OverdueAlert {
    pub customer_id: String,
    pub balance: Money,
    pub days_overdue: i64,
    pub status: AccountStatus,
    #[ts(as = "Option<String>")]
    pub last_charge_at: Option<DateTime<Utc>>,
}

/// Outcome of one overdue refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OverdueRefresh {
    /// Accounts whose `days_overdue` changed.
    pub updated: i64,
    /// Accounts moved from active to suspended.
    pub suspended: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SessionStats {
    pub closed_sessions: i64,
    pub sessions_with_discrepancy: i64,
    pub total_expected: Money,
    pub total_actual: Money,
    /// Σ discrepancies (signed: shortages cancel overages).
    pub net_discrepancy: Money,
    /// Σ |discrepancies|.
    pub absolute_discrepancy: Money,
}

// =============================================================================
// Audit Record
// =============================================================================

/// Aggregate an audit record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum AuditEntity {
    CustomerAccount,
    CashSession,
}

impl AuditEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEntity::CustomerAccount => "customer_account",
            AuditEntity::CashSession => "cash_session",
        }
    }
}

/// What happened to the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Charge,
    Payment,
    Adjustment,
    Surcharge,
    StatusChange,
    CreditLimitChange,
    AutoSuspend,
    HoldPlaced,
    HoldReleased,
    SessionOpened,
    CashMovement,
    SessionClosed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Charge => "charge",
            AuditAction::Payment => "payment",
            AuditAction::Adjustment => "adjustment",
            AuditAction::Surcharge => "surcharge",
            AuditAction::StatusChange => "status_change",
            AuditAction::CreditLimitChange => "credit_limit_change",
            AuditAction::AutoSuspend => "auto_suspend",
            AuditAction::HoldPlaced => "hold_placed",
            AuditAction::HoldReleased => "hold_released",
            AuditAction::SessionOpened => "session_opened",
            AuditAction::CashMovement => "cash_movement",
            AuditAction::SessionClosed => "session_closed",
        }
    }
}

/// A write-once record of one committed mutation.
///
/// Snapshots are JSON so the audit log survives schema changes of the
/// aggregates it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub entity_type: AuditEntity,
    pub entity_id: String,
    pub action: AuditAction,
    pub previous_snapshot: Option<serde_json::Value>,
    pub new_snapshot: Option<serde_json::Value>,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: Option<String>,
}

/// Serializes an audit snapshot. A failure is logged and the snapshot is
/// left empty; the record itself is still written.
fn snapshot<S: Serialize>(value: &S, which: &str) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(
                target: "tally::audit",
                snapshot = which,
                error = %e,
                "Audit snapshot could not be serialized"
            );
            None
        }
    }
}

impl AuditRecord {
    /// Builds a record stamped now, snapshotting `before` and `after`.
    pub fn new<S: Serialize>(
        entity_type: AuditEntity,
        entity_id: impl Into<String>,
        action: AuditAction,
        before: Option<&S>,
        after: Option<&S>,
        actor_id: impl Into<String>,
    ) -> Self {
        AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            action,
            previous_snapshot: before.and_then(|s| snapshot(s, "previous")),
            new_snapshot: after.and_then(|s| snapshot(s, "new")),
            actor_id: actor_id.into(),
            timestamp: Utc::now(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// =============================================================================
// Boundary Requests
// =============================================================================
// Deserialized by the HTTP layer; `validate()` lives in `validation`.

/// Sale on credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCharge {
    pub customer_id: String,
    pub amount: Money,
    pub description: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub actor_id: String,
}

/// Customer payment against the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPayment {
    pub customer_id: String,
    pub amount: Money,
    pub payment_method_id: String,
    pub description: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub actor_id: String,
}

/// Manual correction. Positive increases the debt, negative reduces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAdjustment {
    pub customer_id: String,
    pub amount: Money,
    pub reason: String,
    pub actor_id: String,
}

/// How a surcharge on outstanding debt is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Surcharge {
    /// Rate on the current balance, in basis points (350 = 3.5%).
    Percentage { bps: u32 },
    Fixed { amount: Money },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSurcharge {
    pub customer_id: String,
    pub surcharge: Surcharge,
    #[serde(default)]
    pub description: Option<String>,
    pub actor_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSession {
    pub register_id: String,
    pub initial_amount: Money,
    #[serde(default)]
    pub opening_notes: Option<String>,
    #[serde(default)]
    pub adjustment_reason: Option<String>,
    pub actor_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCashMovement {
    pub session_id: String,
    pub payment_method_id: String,
    /// Positive = in, negative = out.
    pub amount: Money,
    pub description: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub actor_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSession {
    pub session_id: String,
    pub actual_cash_amount: Money,
    #[serde(default)]
    pub closing_notes: Option<String>,
    /// Counted amount per payment method id. Methods not listed are
    /// recorded as counted at their expected total.
    #[serde(default)]
    pub counted_by_method: BTreeMap<String, Money>,
    pub actor_id: String,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_account_status_round_trips_through_str() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Suspended,
            AccountStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<AccountStatus>().unwrap(), status);
        }
        assert!("frozen".parse::<AccountStatus>().is_err());
    }

    #[test]
    fn test_position_from_balance() {
        assert_eq!(
            CustomerPosition::from_balance(Money::from_cents(1)),
            CustomerPosition::CustomerOwes
        );
        assert_eq!(
            CustomerPosition::from_balance(Money::from_cents(-1)),
            CustomerPosition::BusinessOwes
        );
        assert_eq!(
            CustomerPosition::from_balance(Money::zero()),
            CustomerPosition::Settled
        );
    }

    #[test]
    fn test_only_cash_kind_is_physical() {
        assert!(PaymentMethodKind::Cash.is_physical_cash());
        assert!(!PaymentMethodKind::Card.is_physical_cash());
        assert!(!PaymentMethodKind::Digital.is_physical_cash());
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let now = Utc::now();
        let range = DateRange::between(now - Duration::days(1), now);
        assert!(range.contains(now));
        assert!(range.contains(now - Duration::days(1)));
        assert!(!range.contains(now + Duration::seconds(1)));
        assert!(DateRange::all().contains(now));
    }

    #[test]
    fn test_page_token_rejects_foreign_tokens() {
        assert_eq!(PageToken::from_key(42).key().unwrap(), 42);
        assert!(PageToken::from("42".to_string()).key().is_err());
        assert!(PageToken::from("k1.abc".to_string()).key().is_err());
    }

    #[test]
    fn test_surcharge_serializes_tagged() {
        let json = serde_json::to_string(&Surcharge::Percentage { bps: 350 }).unwrap();
        assert_eq!(json, r#"{"kind":"percentage","bps":350}"#);
    }

    #[test]
    fn test_close_session_defaults_counted_by_method() {
        let req: CloseSession = serde_json::from_str(
            r#"{"session_id":"s","actual_cash_amount":1000,"actor_id":"u"}"#,
        )
        .unwrap();
        assert!(req.counted_by_method.is_empty());
        assert_eq!(req.closing_notes, None);
    }

    #[test]
    fn test_unserializable_snapshot_leaves_record_intact() {
        // JSON objects need string keys, so tuple keys fail to serialize.
        let mut bad = BTreeMap::new();
        bad.insert((1, 2), 3);

        let good = BTreeMap::from([("balance".to_string(), 3)]);
        let record = AuditRecord::new(
            AuditEntity::CustomerAccount,
            "cust-1",
            AuditAction::Charge,
            Some(&bad),
            None,
            "cashier-1",
        );
        assert_eq!(record.previous_snapshot, None);
        assert_eq!(record.entity_id, "cust-1");

        let record = AuditRecord::new(
            AuditEntity::CustomerAccount,
            "cust-1",
            AuditAction::Charge,
            None,
            Some(&good),
            "cashier-1",
        );
        assert_eq!(record.new_snapshot, Some(serde_json::json!({ "balance": 3 })));
    }
}
