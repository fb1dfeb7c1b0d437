//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── LedgerError      - Every failure an engine operation can report   │
//! │  ├── ErrorKind        - Stable, matchable kind of a LedgerError        │
//! │  └── ValidationError  - Boundary input failures                        │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  Flow: ValidationError → LedgerError ← DbError                         │
//! │                               │                                         │
//! │                               ▼                                         │
//! │                     caller matches on kind()                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (customer, session, amounts)
//! 3. Callers branch on [`ErrorKind`], never on message text
//! 4. Only storage and lock failures are retryable

use crate::money::Money;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

// =============================================================================
// Ledger Error
// =============================================================================

/// Errors returned by every ledger, account and session operation.
///
/// Rule violations are detected BEFORE any write, so a returned error
/// (other than `StorageUnavailable`) means nothing was persisted.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Amount is zero, negative where a magnitude is required, or overflows.
    #[error("Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    /// Referenced account, session, movement or payment method does not exist.
    #[error("{entity} not found: {id}")]
    EntityNotFound { entity: &'static str, id: String },

    /// Suspended accounts accept payments and adjustments, not charges.
    #[error("Account {customer_id} is suspended")]
    AccountSuspended { customer_id: String },

    /// Closed accounts only accept a balance-zeroing adjustment.
    #[error("Account {customer_id} is closed")]
    AccountClosed { customer_id: String },

    /// Operation not permitted in the current lifecycle state.
    ///
    /// ## When This Occurs
    /// - Leaving the `closed` account status
    /// - Surcharging an account with no outstanding debt
    /// - Appending to a session that is not open at the ledger level
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Post-charge balance would exceed the account's credit limit.
    ///
    /// ## User Workflow
    /// ```text
    /// Charge $150 (balance $900, limit $1000)
    ///      │
    ///      ▼
    /// resulting $1050 > limit $1000
    ///      │
    ///      ▼
    /// CreditLimitExceeded { limit: $1000.00, resulting: $1050.00 }
    /// ```
    #[error("Credit limit exceeded for {customer_id}: limit {limit}, resulting balance {resulting}")]
    CreditLimitExceeded {
        customer_id: String,
        limit: Money,
        resulting: Money,
    },

    /// Account cannot be closed while it carries a balance.
    #[error("Account {customer_id} has non-zero balance {balance}")]
    NonZeroBalance { customer_id: String, balance: Money },

    /// Register already has an open session.
    #[error("Register {register_id} already has open session {session_id}")]
    SessionAlreadyOpen {
        register_id: String,
        session_id: String,
    },

    /// Session exists but is not open.
    #[error("Session {session_id} is not open")]
    SessionNotOpen { session_id: String },

    /// The store could not be reached or failed mid-operation.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Lock wait exceeded the configured bound.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Ledger and cached value disagree; the aggregate is on hold.
    ///
    /// Never auto-healed: an operator must reconcile and release the hold.
    #[error("Integrity fault on {entity} {id}: {detail}")]
    IntegrityFault {
        entity: &'static str,
        id: String,
        detail: String,
    },

    /// Boundary validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl LedgerError {
    /// Shorthand for [`LedgerError::InvalidAmount`].
    pub fn invalid_amount(reason: impl Into<String>) -> Self {
        LedgerError::InvalidAmount {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`LedgerError::EntityNotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LedgerError::EntityNotFound {
            entity,
            id: id.into(),
        }
    }

    /// Returns the stable kind of this error.
    ///
    /// `AccountSuspended` and `AccountClosed` are refinements of
    /// `InvalidState`; callers that only care about the kind see them as such.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount { .. } => ErrorKind::InvalidAmount,
            LedgerError::EntityNotFound { .. } => ErrorKind::EntityNotFound,
            LedgerError::AccountSuspended { .. }
            | LedgerError::AccountClosed { .. }
            | LedgerError::InvalidState(_) => ErrorKind::InvalidState,
            LedgerError::CreditLimitExceeded { .. } => ErrorKind::CreditLimitExceeded,
            LedgerError::NonZeroBalance { .. } => ErrorKind::NonZeroBalance,
            LedgerError::SessionAlreadyOpen { .. } => ErrorKind::SessionAlreadyOpen,
            LedgerError::SessionNotOpen { .. } => ErrorKind::SessionNotOpen,
            LedgerError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            LedgerError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            LedgerError::IntegrityFault { .. } => ErrorKind::IntegrityFault,
            LedgerError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Whether the caller may safely retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

// =============================================================================
// Error Kind
// =============================================================================

/// Stable error kind for callers and the HTTP layer above the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidAmount,
    EntityNotFound,
    InvalidState,
    CreditLimitExceeded,
    NonZeroBalance,
    SessionAlreadyOpen,
    SessionNotOpen,
    StorageUnavailable,
    ConcurrencyConflict,
    IntegrityFault,
    Validation,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::StorageUnavailable | ErrorKind::ConcurrencyConflict
        )
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These errors occur when boundary input doesn't meet requirements.
/// Used for early validation before any transaction is opened.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., invalid UUID, malformed page token).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with LedgerError.
pub type LedgerResult<T> = Result<T, LedgerError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LedgerError::CreditLimitExceeded {
            customer_id: "cust-1".to_string(),
            limit: Money::from_cents(100_000),
            resulting: Money::from_cents(105_000),
        };
        assert_eq!(
            err.to_string(),
            "Credit limit exceeded for cust-1: limit $1000.00, resulting balance $1050.00"
        );

        let err = LedgerError::not_found("payment method", "pm-x");
        assert_eq!(err.to_string(), "payment method not found: pm-x");
    }

    #[test]
    fn test_status_errors_are_invalid_state_kind() {
        let suspended = LedgerError::AccountSuspended {
            customer_id: "c".into(),
        };
        let closed = LedgerError::AccountClosed {
            customer_id: "c".into(),
        };
        assert_eq!(suspended.kind(), ErrorKind::InvalidState);
        assert_eq!(closed.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_only_storage_and_conflict_are_retryable() {
        assert!(LedgerError::StorageUnavailable("io".into()).is_retryable());
        assert!(LedgerError::ConcurrencyConflict("busy".into()).is_retryable());

        assert!(!LedgerError::invalid_amount("zero").is_retryable());
        assert!(!LedgerError::SessionNotOpen {
            session_id: "s".into()
        }
        .is_retryable());
        assert!(!LedgerError::IntegrityFault {
            entity: "customer account",
            id: "c".into(),
            detail: "drift".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_validation_converts_to_ledger_error() {
        let validation_err = ValidationError::Required {
            field: "reason".to_string(),
        };
        let err: LedgerError = validation_err.into();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SessionAlreadyOpen).unwrap();
        assert_eq!(json, "\"session_already_open\"");
    }
}
