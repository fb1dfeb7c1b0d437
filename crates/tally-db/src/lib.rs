//! # tally-db: Storage and Engines for the Tally Ledger
//!
//! SQLite persistence for customer accounts, cash register sessions and
//! their append-only movement ledgers, plus the engines that mutate them.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Caller (POS backend, ledger-verify)                                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐   │   │
//! │  │   │   Database    │    │    Engines    │    │  Migrations  │   │   │
//! │  │   │   (pool.rs)   │    │ (repository/) │    │  (embedded)  │   │   │
//! │  │   │               │    │               │    │              │   │   │
//! │  │   │ SqlitePool    │◄───│ accounts      │    │ 001 schema   │   │   │
//! │  │   │ AuditRecorder │    │ sessions      │    │ 002 methods  │   │   │
//! │  │   │               │    │ ledger        │    │              │   │   │
//! │  │   └───────────────┘    └───────┬───────┘    └──────────────┘   │   │
//! │  │                                │ rules                          │   │
//! │  └────────────────────────────────┼────────────────────────────────┘   │
//! │                                   ▼                                     │
//! │                          tally-core (pure)                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool, configuration and engine access
//! - [`config`] - File and environment configuration
//! - [`migrations`] - Embedded database migrations
//! - [`audit`] - Audit recorder trait and the SQLite recorder
//! - [`error`] - Database error types
//! - [`repository`] - Account, session, ledger and payment method engines
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//! use tally_core::{Money, NewCharge};
//!
//! let db = Database::new(DbConfig::new("path/to/ledger.db")).await?;
//!
//! let movement = db.accounts().charge(&NewCharge {
//!     customer_id: "C-1001".into(),
//!     amount: Money::from_cents(4_550),
//!     description: "Sale #8812".into(),
//!     notes: None,
//!     actor_id: "cashier-7".into(),
//! }).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod audit;
pub mod config;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub(crate) mod tx;

// =============================================================================
// Re-exports
// =============================================================================

pub use audit::{AuditLogRepository, AuditRecorder, SqliteAuditRecorder};
pub use config::{AccountPolicy, ConfigError, DatabaseSettings, LedgerConfig};
pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::account::AccountRepository;
pub use repository::ledger::{
    IntegrityIssue, LedgerRepository, MovementPages, NewAccountMovement, Verification, VerifyReport,
};
pub use repository::payment_method::PaymentMethodRepository;
pub use repository::session::SessionRepository;
