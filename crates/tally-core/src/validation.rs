//! # Validation Module
//!
//! Boundary validation for the Tally ledger.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: HTTP layer (outside this workspace)                          │
//! │  └── Deserializes NewCharge / OpenSession / ... DTOs                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE, `validate()` on every request                   │
//! │  ├── Amount sign rules (InvalidAmount)                                 │
//! │  └── Required text, id and length checks (Validation)                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Engines in tally-db (under the aggregate lock)               │
//! │  ├── Status / state machine                                            │
//! │  └── Credit limit, integrity hold                                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 4: SQLite                                                       │
//! │  ├── CHECK / FOREIGN KEY constraints                                   │
//! │  └── Append-only triggers                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every check here runs before a transaction is opened, so a rejected
//! request never touches the store.
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{validate_id, validate_positive_amount};
//! use tally_core::Money;
//!
//! validate_id("customer_id", "cust-42").unwrap();
//! assert!(validate_positive_amount("amount", Money::zero()).is_err());
//! ```

use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::money::Money;
use crate::types::{
    CloseSession, NewAdjustment, NewCashMovement, NewCharge, NewPayment, NewSurcharge,
    OpenSession, PageRequest, Surcharge,
};
use crate::{MAX_AMOUNT_CENTS, MAX_DESCRIPTION_LEN, MAX_ID_LEN, MAX_NOTES_LEN, MAX_PAGE_SIZE, MAX_SURCHARGE_BPS};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates an entity identifier.
///
/// Customer and register ids come from other bounded contexts, so any
/// non-empty token is accepted, not only UUIDs.
pub fn validate_id(field: &str, id: &str) -> ValidationResult<()> {
    let id = id.trim();

    if id.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if id.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_ID_LEN,
        });
    }

    Ok(())
}

/// Validates required free text (descriptions, adjustment reasons).
///
/// ## Example
/// ```rust
/// use tally_core::validation::validate_text;
///
/// assert!(validate_text("reason", "price correction", 255).is_ok());
/// assert!(validate_text("reason", "   ", 255).is_err());
/// ```
pub fn validate_text(field: &str, text: &str, max: usize) -> ValidationResult<()> {
    let text = text.trim();

    if text.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if text.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(())
}

/// Validates optional free text. Only the length is checked.
pub fn validate_optional_text(field: &str, text: Option<&str>, max: usize) -> ValidationResult<()> {
    match text {
        Some(text) if text.chars().count() > max => Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// Amount Validators
// =============================================================================

pub(crate) fn validate_amount_limit(field: &str, amount: Money) -> LedgerResult<()> {
    if !amount.is_within_limit() {
        return Err(LedgerError::invalid_amount(format!(
            "{field} exceeds the maximum of {}",
            Money::from_cents(MAX_AMOUNT_CENTS)
        )));
    }
    Ok(())
}

/// Amount must be strictly positive (charges, payments, fixed surcharges).
pub fn validate_positive_amount(field: &str, amount: Money) -> LedgerResult<()> {
    validate_amount_limit(field, amount)?;
    if !amount.is_positive() {
        return Err(LedgerError::invalid_amount(format!(
            "{field} must be greater than zero, got {amount}"
        )));
    }
    Ok(())
}

/// Amount must not be zero (adjustments, cash movements).
pub fn validate_nonzero_amount(field: &str, amount: Money) -> LedgerResult<()> {
    validate_amount_limit(field, amount)?;
    if amount.is_zero() {
        return Err(LedgerError::invalid_amount(format!("{field} must not be zero")));
    }
    Ok(())
}

/// Amount must be zero or more (drawer counts, credit limits).
pub fn validate_non_negative_amount(field: &str, amount: Money) -> LedgerResult<()> {
    validate_amount_limit(field, amount)?;
    if amount.is_negative() {
        return Err(LedgerError::invalid_amount(format!(
            "{field} must not be negative, got {amount}"
        )));
    }
    Ok(())
}

/// Validates a surcharge rate in basis points.
///
/// ## Rules
/// - Must be between 1 and 10000 (0.01% to 100%)
pub fn validate_surcharge_bps(bps: u32) -> ValidationResult<()> {
    if bps == 0 || bps > MAX_SURCHARGE_BPS {
        return Err(ValidationError::OutOfRange {
            field: "surcharge_bps".to_string(),
            min: 1,
            max: MAX_SURCHARGE_BPS as i64,
        });
    }
    Ok(())
}

pub fn validate_page(page: &PageRequest) -> LedgerResult<()> {
    if page.limit == 0 || page.limit > MAX_PAGE_SIZE {
        return Err(ValidationError::OutOfRange {
            field: "limit".to_string(),
            min: 1,
            max: MAX_PAGE_SIZE as i64,
        }
        .into());
    }
    if let Some(token) = &page.after {
        token.key()?;
    }
    Ok(())
}

// =============================================================================
// Request Validation
// =============================================================================

impl NewCharge {
    pub fn validate(&self) -> LedgerResult<()> {
        validate_id("customer_id", &self.customer_id)?;
        validate_positive_amount("amount", self.amount)?;
        validate_text("description", &self.description, MAX_DESCRIPTION_LEN)?;
        validate_optional_text("notes", self.notes.as_deref(), MAX_NOTES_LEN)?;
        validate_id("actor_id", &self.actor_id)?;
        Ok(())
    }
}

impl NewPayment {
    pub fn validate(&self) -> LedgerResult<()> {
        validate_id("customer_id", &self.customer_id)?;
        validate_positive_amount("amount", self.amount)?;
        validate_id("payment_method_id", &self.payment_method_id)?;
        validate_text("description", &self.description, MAX_DESCRIPTION_LEN)?;
        validate_optional_text("notes", self.notes.as_deref(), MAX_NOTES_LEN)?;
        validate_id("actor_id", &self.actor_id)?;
        Ok(())
    }
}

impl NewAdjustment {
    pub fn validate(&self) -> LedgerResult<()> {
        validate_id("customer_id", &self.customer_id)?;
        validate_nonzero_amount("amount", self.amount)?;
        validate_text("reason", &self.reason, MAX_DESCRIPTION_LEN)?;
        validate_id("actor_id", &self.actor_id)?;
        Ok(())
    }
}

impl NewSurcharge {
    pub fn validate(&self) -> LedgerResult<()> {
        validate_id("customer_id", &self.customer_id)?;
        match self.surcharge {
            Surcharge::Percentage { bps } => validate_surcharge_bps(bps)?,
            Surcharge::Fixed { amount } => validate_positive_amount("surcharge", amount)?,
        }
        validate_optional_text("description", self.description.as_deref(), MAX_DESCRIPTION_LEN)?;
        validate_id("actor_id", &self.actor_id)?;
        Ok(())
    }
}

impl OpenSession {
    pub fn validate(&self) -> LedgerResult<()> {
        validate_id("register_id", &self.register_id)?;
        validate_non_negative_amount("initial_amount", self.initial_amount)?;
        validate_optional_text("opening_notes", self.opening_notes.as_deref(), MAX_NOTES_LEN)?;
        validate_optional_text(
            "adjustment_reason",
            self.adjustment_reason.as_deref(),
            MAX_DESCRIPTION_LEN,
        )?;
        validate_id("actor_id", &self.actor_id)?;
        Ok(())
    }
}

impl NewCashMovement {
    pub fn validate(&self) -> LedgerResult<()> {
        validate_id("session_id", &self.session_id)?;
        validate_id("payment_method_id", &self.payment_method_id)?;
        validate_nonzero_amount("amount", self.amount)?;
        validate_text("description", &self.description, MAX_DESCRIPTION_LEN)?;
        validate_optional_text("notes", self.notes.as_deref(), MAX_NOTES_LEN)?;
        validate_id("actor_id", &self.actor_id)?;
        Ok(())
    }
}

impl CloseSession {
    pub fn validate(&self) -> LedgerResult<()> {
        validate_id("session_id", &self.session_id)?;
        validate_non_negative_amount("actual_cash_amount", self.actual_cash_amount)?;
        for (method_id, counted) in &self.counted_by_method {
            validate_id("payment_method_id", method_id)?;
            validate_non_negative_amount("counted_amount", *counted)?;
        }
        validate_optional_text("closing_notes", self.closing_notes.as_deref(), MAX_NOTES_LEN)?;
        validate_id("actor_id", &self.actor_id)?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
