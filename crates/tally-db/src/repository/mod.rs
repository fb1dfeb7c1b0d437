//! # Repository Module
//!
//! Engines and repositories of the Tally ledger.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Caller (HTTP handler, CLI, job)                                        │
//! │       │                                                                 │
//! │       │  db.accounts().charge(&req)                                     │
//! │       ▼                                                                 │
//! │  AccountRepository            SessionRepository                         │
//! │  ├── charge / record_payment  ├── open_session                          │
//! │  ├── adjust_balance           ├── record_movement                       │
//! │  ├── apply_surcharge          ├── close_session                         │
//! │  └── set_status, statements   └── reads, stats                          │
//! │       │                             │                                   │
//! │       └──────────┬──────────────────┘                                   │
//! │                  ▼                                                      │
//! │           LedgerRepository  (append, list, sum, verify)                 │
//! │                  │                                                      │
//! │                  ▼                                                      │
//! │           SQLite: *_movements tables (append-only)                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`AccountRepository`](account::AccountRepository) - customer credit accounts
//! - [`SessionRepository`](session::SessionRepository) - cash register sessions
//! - [`LedgerRepository`](ledger::LedgerRepository) - movement ledgers
//! - [`PaymentMethodRepository`](payment_method::PaymentMethodRepository) - payment method registry

pub mod account;
pub mod ledger;
pub mod payment_method;
pub(crate) mod rows;
pub mod session;
