//! # Ledger Verifier
//!
//! Re-sums every account and session ledger and compares the result with
//! the cached balances. Aggregates that disagree are put on integrity hold.
//!
//! ## Usage
//! ```bash
//! # Verify the database named in ledger.toml (or the platform default)
//! cargo run -p tally-db --bin ledger-verify
//!
//! # Explicit config file or database
//! cargo run -p tally-db --bin ledger-verify -- --config ./ledger.toml
//! cargo run -p tally-db --bin ledger-verify -- --db ./data/ledger.db
//! ```
//!
//! Exits with status 1 when any ledger drifted, so it can gate a nightly job.

use std::env;
use std::path::PathBuf;

use tally_db::{Database, LedgerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ACTOR: &str = "ledger-verify";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut db_override: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_override = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally Ledger Verifier");
                println!();
                println!("Usage: ledger-verify [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>  Config file (default: platform config dir)");
                println!("  -d, --db <PATH>      Database file, overrides the config");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {other}");
            }
        }
        i += 1;
    }

    let mut config = LedgerConfig::load(config_path)?;
    if let Some(path) = db_override {
        config.database.path = path;
    }
    config.validate()?;

    info!(path = %config.database.path.display(), "Verifying ledger");

    let db = Database::new(config.db_config()).await?;
    let report = db.ledger().verify_all(ACTOR).await?;

    println!("Accounts checked: {}", report.accounts_checked);
    println!("Sessions checked: {}", report.sessions_checked);

    if report.is_clean() {
        println!("All ledgers consistent");
        db.close().await;
        return Ok(());
    }

    println!("Drift found in {} aggregate(s):", report.issues.len());
    for issue in &report.issues {
        error!(entity = issue.entity, id = %issue.id, "{}", issue.detail);
        println!("  {} {}: {}", issue.entity, issue.id, issue.detail);
    }

    db.close().await;
    std::process::exit(1);
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the default `info,tally=debug,sqlx=warn`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
