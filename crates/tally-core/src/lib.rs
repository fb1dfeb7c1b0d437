//! # tally-core: Pure Ledger Rules for Tally
//!
//! This crate is the **heart** of the Tally ledger. It contains every
//! balance rule as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Ledger Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              HTTP layer / UI (outside this workspace)           │   │
//! │  │    deserializes NewCharge, OpenSession, ... and calls engines   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   money   │  │  account  │  │  session  │  │   │
//! │  │   │  Account  │  │   Money   │  │  post()   │  │ reconcile │  │   │
//! │  │   │  Session  │  │  bps math │  │  status   │  │  expected │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Engines)                           │   │
//! │  │        SQLite transactions, row locks, ledger, audit            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types, read models and boundary requests
//! - [`money`] - Money type with integer arithmetic (no floating point!)
//! - [`error`] - `LedgerError` taxonomy and stable `ErrorKind`
//! - [`validation`] - Boundary validation and `validate()` on requests
//! - [`account`] - Posting rules, status machine, surcharge, overdue policy
//! - [`session`] - Cash reconciliation arithmetic
//! - [`statement`] - Statement projection
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::account::{post, AccountEntry, AccountState};
//! use tally_core::{AccountStatus, Money};
//!
//! let state = AccountState {
//!     customer_id: "cust-1",
//!     balance: Money::from_cents(45_000),
//!     status: AccountStatus::Active,
//!     credit_limit: None,
//! };
//!
//! let posting = post(state, &AccountEntry::Payment(Money::from_cents(20_000))).unwrap();
//! assert_eq!(posting.signed_effect.cents(), -20_000);
//! assert_eq!(posting.resulting_balance.cents(), 25_000);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod account;
pub mod error;
pub mod money;
pub mod session;
pub mod statement;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================
// These allow users to do `use tally_core::Money` instead of
// `use tally_core::money::Money`

pub use error::{ErrorKind, LedgerError, LedgerResult, ValidationError};
pub use money::Money;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Actor recorded for mutations the ledger performs on its own
/// (overdue auto-suspension).
pub const SYSTEM_ACTOR: &str = "system";

/// Maximum length of customer, register, session and actor ids.
pub const MAX_ID_LEN: usize = 64;

/// Maximum length of movement descriptions and adjustment reasons.
pub const MAX_DESCRIPTION_LEN: usize = 255;

/// Maximum length of free-form notes.
pub const MAX_NOTES_LEN: usize = 1000;

/// Largest magnitude, in cents, accepted for any single amount
/// (10^12 major units).
pub const MAX_AMOUNT_CENTS: i64 = 100_000_000_000_000;

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: u32 = 500;

/// 100% in basis points.
pub const MAX_SURCHARGE_BPS: u32 = 10_000;

/// Days past the last charge after which an active debtor is suspended.
pub const DEFAULT_SUSPEND_AFTER_DAYS: i64 = 30;
