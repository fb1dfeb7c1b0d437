//! # Ledger Configuration
//!
//! Configuration for the ledger engines and their store.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_DATABASE_PATH=/var/lib/tally/ledger.db                       │
//! │     TALLY_BUSY_TIMEOUT_MS=2000                                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/ledger.toml (Linux)                                │
//! │     ~/Library/Application Support/com.tally.ledger/ledger.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     ./tally.db, 5 connections, 5s busy timeout, suspend after 30 days  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # ledger.toml
//! [database]
//! path = "/var/lib/tally/ledger.db"
//! max_connections = 5
//! busy_timeout_ms = 5000
//! connect_timeout_secs = 30
//!
//! [accounts]
//! suspend_after_days = 30   # 0 disables auto-suspension
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tally_core::DEFAULT_SUSPEND_AFTER_DAYS;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pool::DbConfig;

// =============================================================================
// Config Error
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// Database Settings
// =============================================================================

/// Store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite database file. `:memory:` for an ephemeral store.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits for the row lock before `ConcurrencyConflict`.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("tally.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// =============================================================================
// Account Policy
// =============================================================================

/// Policy knobs for the customer account engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPolicy {
    /// Active debtors overdue for longer than this are suspended by
    /// `refresh_overdue`. 0 disables auto-suspension.
    #[serde(default = "default_suspend_after_days")]
    pub suspend_after_days: i64,
}

fn default_suspend_after_days() -> i64 {
    DEFAULT_SUSPEND_AFTER_DAYS
}

impl Default for AccountPolicy {
    fn default() -> Self {
        AccountPolicy {
            suspend_after_days: default_suspend_after_days(),
        }
    }
}

// =============================================================================
// Ledger Config
// =============================================================================

/// Complete ledger configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub accounts: AccountPolicy,
}

impl LedgerConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (ledger.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading ledger config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> ConfigResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ConfigError::Invalid("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Ledger config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database.path must not be empty".into()));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        if self.database.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "database.busy_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.accounts.suspend_after_days < 0 {
            return Err(ConfigError::Invalid(
                "accounts.suspend_after_days must not be negative".into(),
            ));
        }

        Ok(())
    }

    /// Builds the pool configuration for [`crate::Database::new`].
    pub fn db_config(&self) -> DbConfig {
        let base = if self.database.path.as_os_str() == ":memory:" {
            DbConfig::in_memory()
        } else {
            DbConfig::new(&self.database.path).max_connections(self.database.max_connections)
        };

        base.busy_timeout(Duration::from_millis(self.database.busy_timeout_ms))
            .connect_timeout(Duration::from_secs(self.database.connect_timeout_secs))
            .account_policy(self.accounts)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TALLY_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(max) = std::env::var("TALLY_MAX_CONNECTIONS") {
            match max.parse::<u32>() {
                Ok(m) => self.database.max_connections = m,
                Err(_) => warn!(value = %max, "Ignoring invalid TALLY_MAX_CONNECTIONS"),
            }
        }

        if let Ok(ms) = std::env::var("TALLY_BUSY_TIMEOUT_MS") {
            match ms.parse::<u64>() {
                Ok(v) => {
                    debug!(busy_timeout_ms = v, "Overriding busy timeout from environment");
                    self.database.busy_timeout_ms = v;
                }
                Err(_) => warn!(value = %ms, "Ignoring invalid TALLY_BUSY_TIMEOUT_MS"),
            }
        }

        if let Ok(days) = std::env::var("TALLY_SUSPEND_AFTER_DAYS") {
            match days.parse::<i64>() {
                Ok(d) => self.accounts.suspend_after_days = d,
                Err(_) => warn!(value = %days, "Ignoring invalid TALLY_SUSPEND_AFTER_DAYS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "ledger")
            .map(|dirs| dirs.config_dir().join("ledger.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert_eq!(config.accounts.suspend_after_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LedgerConfig::default();

        config.database.busy_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.database.busy_timeout_ms = 100;
        config.accounts.suspend_after_days = -1;
        assert!(config.validate().is_err());

        config.accounts.suspend_after_days = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: LedgerConfig = toml::from_str(
            r#"
            [database]
            busy_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.database.busy_timeout_ms, 250);
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.accounts.suspend_after_days, 30);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(&path, "[accounts]\nsuspend_after_days = 45\n").unwrap();

        let config = LedgerConfig::load(Some(path)).unwrap();
        assert_eq!(config.accounts.suspend_after_days, 45);
    }

    #[test]
    fn test_db_config_carries_busy_timeout() {
        let mut config = LedgerConfig::default();
        config.database.path = PathBuf::from(":memory:");
        config.database.busy_timeout_ms = 750;

        let db = config.db_config();
        assert_eq!(db.busy_timeout, Duration::from_millis(750));
        assert_eq!(db.max_connections, 1);
    }

    #[test]
    fn test_toml_serialization() {
        let config = LedgerConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[database]"));
        assert!(toml_str.contains("[accounts]"));
    }
}
