//! # Statement Projection
//!
//! Builds a [`Statement`] from movements already read from the ledger.
//! Pure: the same movements always produce the same statement.

use crate::money::Money;
use crate::types::{AccountMovement, CustomerPosition, DateRange, MovementType, Statement};

/// Projects the movements of one account over `range`.
///
/// `opening_balance` is the balance before the first movement in range
/// (the signed sum of everything earlier). Movements are sorted oldest
/// first by sequence regardless of input order.
pub fn build_statement(
    customer_id: &str,
    range: DateRange,
    opening_balance: Money,
    mut movements: Vec<AccountMovement>,
) -> Statement {
    movements.sort_by_key(|m| m.sequence);

    let mut total_charges = Money::zero();
    let mut total_payments = Money::zero();
    let mut total_adjustments = Money::zero();

    for m in &movements {
        match m.movement_type {
            MovementType::Charge | MovementType::Interest => total_charges += m.amount,
            MovementType::Payment => total_payments += m.amount,
            MovementType::Adjustment => total_adjustments += m.signed_effect,
        }
    }

    let closing_balance = movements
        .last()
        .map(|m| m.resulting_balance)
        .unwrap_or(opening_balance);

    Statement {
        customer_id: customer_id.to_string(),
        range,
        opening_balance,
        closing_balance,
        total_charges,
        total_payments,
        total_adjustments,
        position: CustomerPosition::from_balance(closing_balance),
        movements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn movement(sequence: i64, movement_type: MovementType, effect: i64, before: i64) -> AccountMovement {
        AccountMovement {
            id: format!("m-{sequence}"),
            customer_id: "cust-1".into(),
            sequence,
            movement_type,
            amount: Money::from_cents(effect.abs()),
            signed_effect: Money::from_cents(effect),
            balance_before: Money::from_cents(before),
            resulting_balance: Money::from_cents(before + effect),
            description: "entry".into(),
            payment_method_id: None,
            notes: None,
            actor_id: "u".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_statement_totals_and_position() {
        // Charges 450 + 300, payment 200 → owes 550
        let movements = vec![
            movement(3, MovementType::Payment, -20_000, 75_000),
            movement(1, MovementType::Charge, 45_000, 0),
            movement(2, MovementType::Charge, 30_000, 45_000),
        ];
        let st = build_statement("cust-1", DateRange::all(), Money::zero(), movements);

        assert_eq!(st.movements.first().map(|m| m.sequence), Some(1));
        assert_eq!(st.total_charges.cents(), 75_000);
        assert_eq!(st.total_payments.cents(), 20_000);
        assert_eq!(st.closing_balance.cents(), 55_000);
        assert_eq!(st.position, CustomerPosition::CustomerOwes);
    }

    #[test]
    fn test_empty_range_keeps_opening_balance() {
        let st = build_statement("cust-1", DateRange::all(), Money::from_cents(-500), vec![]);
        assert_eq!(st.closing_balance.cents(), -500);
        assert_eq!(st.position, CustomerPosition::BusinessOwes);
    }

    #[test]
    fn test_adjustments_are_signed() {
        let st = build_statement(
            "cust-1",
            DateRange::all(),
            Money::from_cents(1_000),
            vec![movement(4, MovementType::Adjustment, -1_000, 1_000)],
        );
        assert_eq!(st.total_adjustments.cents(), -1_000);
        assert_eq!(st.position, CustomerPosition::Settled);
    }
}
