//! # Cash Session Rules
//!
//! Reconciliation arithmetic for cash-register sessions.
//!
//! ```text
//!   expected = initial_amount + Σ amount   (cash-kind methods only)
//!   discrepancy = actual − expected        (stored as-is, never rounded)
//!
//!   discrepancy < 0  → shortage
//!   discrepancy > 0  → overage
//! ```
//!
//! Card, transfer and digital movements are tracked per method but never
//! touch the drawer, so they never move `expected`.

use chrono::{DateTime, Utc};

use crate::error::{LedgerError, LedgerResult};
use crate::money::Money;
use crate::types::PaymentMethodKind;

/// Expected drawer cash after applying one movement.
///
/// Non-cash methods leave the running value unchanged.
pub fn apply_cash_movement(
    expected_running: Money,
    amount: Money,
    kind: PaymentMethodKind,
) -> LedgerResult<Money> {
    if amount.is_zero() {
        return Err(LedgerError::invalid_amount("cash movement must not be zero"));
    }
    if !kind.is_physical_cash() {
        return Ok(expected_running);
    }
    expected_running
        .checked_add(amount)
        .ok_or_else(|| LedgerError::invalid_amount("expected cash overflows"))
}

/// Recomputes expected cash from the initial amount and every movement.
pub fn expected_cash<I>(initial_amount: Money, movements: I) -> LedgerResult<Money>
where
    I: IntoIterator<Item = (Money, PaymentMethodKind)>,
{
    movements
        .into_iter()
        .try_fold(initial_amount, |running, (amount, kind)| {
            apply_cash_movement(running, amount, kind)
        })
}

/// Result of counting the drawer at close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub expected: Money,
    pub actual: Money,
    pub discrepancy: Money,
}

impl Reconciliation {
    pub fn new(expected: Money, actual: Money) -> LedgerResult<Self> {
        let discrepancy = actual
            .checked_sub(expected)
            .ok_or_else(|| LedgerError::invalid_amount("cash discrepancy overflows"))?;
        Ok(Reconciliation {
            expected,
            actual,
            discrepancy,
        })
    }

    #[inline]
    pub fn is_balanced(&self) -> bool {
        self.discrepancy.is_zero()
    }
}

/// Splits a signed movement into the (in, out) increments of a method total.
pub fn split_in_out(amount: Money) -> LedgerResult<(Money, Money)> {
    if amount.is_negative() {
        let out = amount
            .checked_abs()
            .ok_or_else(|| LedgerError::invalid_amount(format!("amount {amount} is out of range")))?;
        Ok((Money::zero(), out))
    } else {
        Ok((amount, Money::zero()))
    }
}

/// Per-method counted amount and difference at close.
///
/// An uncounted method is taken as counted at its expected net.
pub fn method_count(net: Money, counted: Option<Money>) -> LedgerResult<(Money, Money)> {
    let counted = counted.unwrap_or(net);
    let difference = counted
        .checked_sub(net)
        .ok_or_else(|| LedgerError::invalid_amount("method difference overflows"))?;
    Ok((counted, difference))
}

/// Whether a session opened on an earlier UTC calendar day than `now`.
pub fn is_from_previous_day(opened_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    opened_at.date_naive() < now.date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_non_cash_methods_do_not_move_expected() {
        let running = Money::from_cents(10_000);
        assert_eq!(
            apply_cash_movement(running, Money::from_cents(5_000), PaymentMethodKind::Card).unwrap(),
            running
        );
        assert_eq!(
            apply_cash_movement(running, Money::from_cents(-2_000), PaymentMethodKind::Cash)
                .unwrap()
                .cents(),
            8_000
        );
    }

    #[test]
    fn test_expected_cash_scenario() {
        // Open with 100.00, +50.00 cash, −20.00 cash, +30.00 card
        let expected = expected_cash(
            Money::from_cents(10_000),
            [
                (Money::from_cents(5_000), PaymentMethodKind::Cash),
                (Money::from_cents(-2_000), PaymentMethodKind::Cash),
                (Money::from_cents(3_000), PaymentMethodKind::Card),
            ],
        )
        .unwrap();
        assert_eq!(expected.cents(), 13_000);

        let rec = Reconciliation::new(expected, Money::from_cents(12_500)).unwrap();
        assert_eq!(rec.discrepancy.cents(), -500);
        assert!(!rec.is_balanced());
    }

    #[test]
    fn test_zero_movement_rejected() {
        assert!(apply_cash_movement(Money::zero(), Money::zero(), PaymentMethodKind::Cash).is_err());
    }

    #[test]
    fn test_split_and_method_count() {
        assert_eq!(
            split_in_out(Money::from_cents(-300)).unwrap(),
            (Money::zero(), Money::from_cents(300))
        );
        assert_eq!(
            method_count(Money::from_cents(3_000), None).unwrap(),
            (Money::from_cents(3_000), Money::zero())
        );
        assert_eq!(
            method_count(Money::from_cents(3_000), Some(Money::from_cents(2_900))).unwrap(),
            (Money::from_cents(2_900), Money::from_cents(-100))
        );
    }

    #[test]
    fn test_overflowing_arithmetic_is_invalid_amount() {
        use crate::error::ErrorKind;

        let min = Money::from_cents(i64::MIN);
        assert_eq!(split_in_out(min).unwrap_err().kind(), ErrorKind::InvalidAmount);

        let err = Reconciliation::new(Money::from_cents(-i64::MAX), Money::from_cents(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);

        let err = method_count(Money::from_cents(-i64::MAX), Some(Money::from_cents(2))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);
    }

    #[test]
    fn test_previous_day_uses_calendar_date() {
        let late = Utc.with_ymd_and_hms(2024, 3, 1, 23, 50, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 3, 2, 0, 10, 0).unwrap();
        assert!(is_from_previous_day(late, early));
        assert!(!is_from_previous_day(early, early));
    }
}
