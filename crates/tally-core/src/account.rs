//! # Account Rules
//!
//! Pure rules for customer current-accounts: how each entry moves the
//! balance, which entries a status accepts, and the status machine.
//!
//! ## Posting Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         post(account, entry)                            │
//! │                                                                         │
//! │  AccountEntry ──► magnitude > 0 ? ──no──► InvalidAmount                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  status accepts? ─ suspended + charge ──► AccountSuspended              │
//! │       │          ─ closed + (not zeroing adjustment) ──► AccountClosed  │
//! │       ▼                                                                 │
//! │  resulting = balance + signed_effect   (checked)                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  charge && resulting > credit_limit ──► CreditLimitExceeded             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Posting { balance_before, signed_effect, resulting_balance }           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine in tally-db calls [`post`] after taking the account row lock,
//! so `balance` is always the latest committed value.

use chrono::{DateTime, Utc};

use crate::error::{LedgerError, LedgerResult};
use crate::money::Money;
use crate::types::{AccountStatus, MovementType, Surcharge};
use crate::validation::validate_amount_limit;

// =============================================================================
// Account Entry
// =============================================================================

/// A balance-affecting entry before it is posted.
///
/// The movement type and the direction travel together, so a signed effect
/// can never disagree with its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEntry {
    /// Positive magnitude; increases the balance.
    Charge(Money),
    /// Positive magnitude; decreases the balance.
    Payment(Money),
    /// Positive magnitude; increases the balance.
    Interest(Money),
    /// Signed amount; applied as given.
    Adjustment(Money),
}

impl AccountEntry {
    pub fn movement_type(&self) -> MovementType {
        match self {
            AccountEntry::Charge(_) => MovementType::Charge,
            AccountEntry::Payment(_) => MovementType::Payment,
            AccountEntry::Interest(_) => MovementType::Interest,
            AccountEntry::Adjustment(_) => MovementType::Adjustment,
        }
    }

    /// The stored `amount` of the movement (always positive once validated).
    pub fn magnitude(&self) -> LedgerResult<Money> {
        match *self {
            AccountEntry::Charge(m)
            | AccountEntry::Payment(m)
            | AccountEntry::Interest(m)
            | AccountEntry::Adjustment(m) => m
                .checked_abs()
                .ok_or_else(|| LedgerError::invalid_amount(format!("amount {m} is out of range"))),
        }
    }

    fn amount(&self) -> Money {
        match *self {
            AccountEntry::Charge(m)
            | AccountEntry::Payment(m)
            | AccountEntry::Interest(m)
            | AccountEntry::Adjustment(m) => m,
        }
    }

    /// Effect on the balance: charge/interest +, payment −, adjustment ±.
    pub fn signed_effect(&self) -> Money {
        match *self {
            AccountEntry::Charge(m) | AccountEntry::Interest(m) => m,
            AccountEntry::Payment(m) => -m,
            AccountEntry::Adjustment(m) => m,
        }
    }

    pub fn validate(&self) -> LedgerResult<()> {
        validate_amount_limit("amount", self.amount())?;
        match *self {
            AccountEntry::Charge(m) | AccountEntry::Payment(m) | AccountEntry::Interest(m) => {
                if !m.is_positive() {
                    return Err(LedgerError::invalid_amount(format!(
                        "{} amount must be greater than zero, got {m}",
                        self.movement_type()
                    )));
                }
            }
            AccountEntry::Adjustment(m) => {
                if m.is_zero() {
                    return Err(LedgerError::invalid_amount("adjustment must not be zero"));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Posting
// =============================================================================

/// The frozen balance transition produced by one accepted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub balance_before: Money,
    pub signed_effect: Money,
    pub resulting_balance: Money,
}

/// The account fields the posting rules read.
#[derive(Debug, Clone, Copy)]
pub struct AccountState<'a> {
    pub customer_id: &'a str,
    pub balance: Money,
    pub status: AccountStatus,
    pub credit_limit: Option<Money>,
}

/// Applies `entry` to the account, or explains why it is rejected.
///
/// ## Example
/// ```rust
/// use tally_core::account::{post, AccountEntry, AccountState};
/// use tally_core::{AccountStatus, Money};
///
/// let state = AccountState {
///     customer_id: "cust-1",
///     balance: Money::from_cents(90_000),
///     status: AccountStatus::Active,
///     credit_limit: Some(Money::from_cents(100_000)),
/// };
///
/// // Exactly at the limit is allowed
/// let posting = post(state, &AccountEntry::Charge(Money::from_cents(10_000))).unwrap();
/// assert_eq!(posting.resulting_balance.cents(), 100_000);
///
/// // One cent over is not
/// assert!(post(state, &AccountEntry::Charge(Money::from_cents(10_001))).is_err());
/// ```
pub fn post(state: AccountState<'_>, entry: &AccountEntry) -> LedgerResult<Posting> {
    entry.validate()?;

    let signed_effect = entry.signed_effect();
    let resulting_balance = state
        .balance
        .checked_add(signed_effect)
        .ok_or_else(|| LedgerError::invalid_amount("resulting balance overflows"))?;

    match (state.status, entry) {
        (AccountStatus::Closed, AccountEntry::Adjustment(_)) if resulting_balance.is_zero() => {}
        (AccountStatus::Closed, _) => {
            return Err(LedgerError::AccountClosed {
                customer_id: state.customer_id.to_string(),
            })
        }
        (AccountStatus::Suspended, AccountEntry::Charge(_)) => {
            return Err(LedgerError::AccountSuspended {
                customer_id: state.customer_id.to_string(),
            })
        }
        _ => {}
    }

    // Interest is not a new sale, so the limit only gates charges.
    if let (AccountEntry::Charge(_), Some(limit)) = (entry, state.credit_limit) {
        if resulting_balance > limit {
            return Err(LedgerError::CreditLimitExceeded {
                customer_id: state.customer_id.to_string(),
                limit,
                resulting: resulting_balance,
            });
        }
    }

    Ok(Posting {
        balance_before: state.balance,
        signed_effect,
        resulting_balance,
    })
}

// =============================================================================
// Status Machine
// =============================================================================

/// Checks a status change.
///
/// ## Rules
/// - `active ↔ suspended` always allowed
/// - `→ closed` only with a zero balance
/// - leaving `closed` is never allowed
/// - setting the current status again is a no-op
pub fn check_transition(
    customer_id: &str,
    from: AccountStatus,
    to: AccountStatus,
    balance: Money,
) -> LedgerResult<()> {
    if from == to {
        return Ok(());
    }

    match (from, to) {
        (AccountStatus::Closed, _) => Err(LedgerError::InvalidState(format!(
            "account {customer_id} is closed and cannot become {to}"
        ))),
        (_, AccountStatus::Closed) if !balance.is_zero() => Err(LedgerError::NonZeroBalance {
            customer_id: customer_id.to_string(),
            balance,
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// Surcharge
// =============================================================================

/// Computes the interest amount for a surcharge on outstanding debt.
///
/// Requires a positive balance. A percentage that rounds to zero cents is
/// rejected rather than posted as an empty movement.
pub fn surcharge_amount(
    customer_id: &str,
    balance: Money,
    surcharge: Surcharge,
) -> LedgerResult<Money> {
    if !balance.is_positive() {
        return Err(LedgerError::InvalidState(format!(
            "account {customer_id} has no outstanding debt to surcharge"
        )));
    }

    let amount = match surcharge {
        Surcharge::Percentage { bps } => balance.apply_bps(bps),
        Surcharge::Fixed { amount } => amount,
    };

    if !amount.is_positive() {
        return Err(LedgerError::invalid_amount(format!(
            "surcharge on {balance} rounds to {amount}"
        )));
    }

    Ok(amount)
}

// =============================================================================
// Overdue Policy
// =============================================================================

/// Whole days since the last charge, for accounts carrying debt.
///
/// Settled or credit balances are never overdue.
pub fn days_overdue(balance: Money, last_charge_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    match last_charge_at {
        Some(at) if balance.is_positive() => (now - at).num_days().max(0),
        _ => 0,
    }
}

/// Whether an overdue refresh should move the account to `suspended`.
///
/// Only active accounts are touched; a threshold of 0 disables the policy.
pub fn should_auto_suspend(status: AccountStatus, days_overdue: i64, suspend_after_days: i64) -> bool {
    suspend_after_days > 0 && status == AccountStatus::Active && days_overdue > suspend_after_days
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::Duration;

    fn state(balance: i64, status: AccountStatus, limit: Option<i64>) -> AccountState<'static> {
        AccountState {
            customer_id: "cust-1",
            balance: Money::from_cents(balance),
            status,
            credit_limit: limit.map(Money::from_cents),
        }
    }

    #[test]
    fn test_signed_effects() {
        let m = Money::from_cents(500);
        assert_eq!(AccountEntry::Charge(m).signed_effect().cents(), 500);
        assert_eq!(AccountEntry::Interest(m).signed_effect().cents(), 500);
        assert_eq!(AccountEntry::Payment(m).signed_effect().cents(), -500);
        assert_eq!(AccountEntry::Adjustment(-m).signed_effect().cents(), -500);
        assert_eq!(AccountEntry::Adjustment(-m).magnitude().unwrap().cents(), 500);
    }

    #[test]
    fn test_extreme_adjustment_rejected_not_negated() {
        let min = AccountEntry::Adjustment(Money::from_cents(i64::MIN));
        assert_eq!(min.magnitude().unwrap_err().kind(), ErrorKind::InvalidAmount);

        let err = post(state(0, AccountStatus::Active, None), &min).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);

        let err = post(
            state(0, AccountStatus::Active, None),
            &AccountEntry::Payment(Money::from_cents(crate::MAX_AMOUNT_CENTS + 1)),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);
    }

    #[test]
    fn test_post_rejects_non_positive_amounts() {
        let err = post(
            state(0, AccountStatus::Active, None),
            &AccountEntry::Charge(Money::zero()),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);

        let err = post(
            state(0, AccountStatus::Active, None),
            &AccountEntry::Payment(Money::from_cents(-10)),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);
    }

    #[test]
    fn test_credit_limit_boundary() {
        let s = state(90_000, AccountStatus::Active, Some(100_000));

        let ok = post(s, &AccountEntry::Charge(Money::from_cents(10_000))).unwrap();
        assert_eq!(ok.resulting_balance.cents(), 100_000);

        let err = post(s, &AccountEntry::Charge(Money::from_cents(10_001))).unwrap_err();
        assert!(matches!(err, LedgerError::CreditLimitExceeded { .. }));
    }

    #[test]
    fn test_unlimited_credit_when_none() {
        let s = state(0, AccountStatus::Active, None);
        assert!(post(s, &AccountEntry::Charge(Money::from_cents(i64::MAX / 2))).is_ok());
    }

    #[test]
    fn test_interest_ignores_credit_limit() {
        let s = state(100_000, AccountStatus::Active, Some(100_000));
        assert!(post(s, &AccountEntry::Interest(Money::from_cents(3_500))).is_ok());
    }

    #[test]
    fn test_suspended_accepts_payments_not_charges() {
        let s = state(5_000, AccountStatus::Suspended, None);
        assert!(matches!(
            post(s, &AccountEntry::Charge(Money::from_cents(1))).unwrap_err(),
            LedgerError::AccountSuspended { .. }
        ));

        let p = post(s, &AccountEntry::Payment(Money::from_cents(8_000))).unwrap();
        // Overpayment leaves the business owing the customer.
        assert_eq!(p.resulting_balance.cents(), -3_000);
    }

    #[test]
    fn test_closed_accepts_only_zeroing_adjustment() {
        let s = state(0, AccountStatus::Closed, None);
        assert!(matches!(
            post(s, &AccountEntry::Payment(Money::from_cents(1))).unwrap_err(),
            LedgerError::AccountClosed { .. }
        ));
        assert!(matches!(
            post(s, &AccountEntry::Adjustment(Money::from_cents(1))).unwrap_err(),
            LedgerError::AccountClosed { .. }
        ));

        let owing = state(250, AccountStatus::Closed, None);
        let p = post(owing, &AccountEntry::Adjustment(Money::from_cents(-250))).unwrap();
        assert!(p.resulting_balance.is_zero());
    }

    #[test]
    fn test_overflow_is_invalid_amount() {
        let s = state(i64::MAX, AccountStatus::Active, None);
        let err = post(s, &AccountEntry::Charge(Money::from_cents(1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);
    }

    #[test]
    fn test_status_transitions() {
        let zero = Money::zero();
        let owing = Money::from_cents(100);

        assert!(check_transition("c", AccountStatus::Active, AccountStatus::Suspended, owing).is_ok());
        assert!(check_transition("c", AccountStatus::Suspended, AccountStatus::Active, owing).is_ok());
        assert!(check_transition("c", AccountStatus::Active, AccountStatus::Closed, zero).is_ok());

        assert!(matches!(
            check_transition("c", AccountStatus::Active, AccountStatus::Closed, owing),
            Err(LedgerError::NonZeroBalance { .. })
        ));
        assert!(matches!(
            check_transition("c", AccountStatus::Closed, AccountStatus::Active, zero),
            Err(LedgerError::InvalidState(_))
        ));
        assert!(check_transition("c", AccountStatus::Closed, AccountStatus::Closed, zero).is_ok());
    }

    #[test]
    fn test_surcharge_amount() {
        let balance = Money::from_cents(20_000);
        assert_eq!(
            surcharge_amount("c", balance, Surcharge::Percentage { bps: 500 })
                .unwrap()
                .cents(),
            1_000
        );
        assert_eq!(
            surcharge_amount("c", balance, Surcharge::Fixed { amount: Money::from_cents(750) })
                .unwrap()
                .cents(),
            750
        );

        let err = surcharge_amount("c", Money::zero(), Surcharge::Percentage { bps: 500 }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        // 0.01% of 10 cents rounds to nothing
        let err = surcharge_amount("c", Money::from_cents(10), Surcharge::Percentage { bps: 1 }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);
    }

    #[test]
    fn test_days_overdue() {
        let now = Utc::now();
        let charged = Some(now - Duration::days(12) - Duration::hours(3));

        assert_eq!(days_overdue(Money::from_cents(100), charged, now), 12);
        assert_eq!(days_overdue(Money::zero(), charged, now), 0);
        assert_eq!(days_overdue(Money::from_cents(-100), charged, now), 0);
        assert_eq!(days_overdue(Money::from_cents(100), None, now), 0);
    }

    #[test]
    fn test_auto_suspend_policy() {
        assert!(should_auto_suspend(AccountStatus::Active, 31, 30));
        assert!(!should_auto_suspend(AccountStatus::Active, 30, 30));
        assert!(!should_auto_suspend(AccountStatus::Suspended, 90, 30));
        assert!(!should_auto_suspend(AccountStatus::Active, 90, 0));
    }
}
