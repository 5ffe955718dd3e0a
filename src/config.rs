// src/config.rs

//! Engine configuration loaded from TOML
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.
//!
//! ```toml
//! db_path = "/var/lib/lockstep/lockstep.db"
//! catalog_dir = "/var/lib/lockstep/catalog"
//! workers = 4
//! reconcile_timeout_secs = 600
//! platform_version = "1.30.0"
//! log_filter = "lockstep=debug"
//! ```

use crate::deadline::MAX_TIMEOUT;
use crate::error::{Error, Result, ResultExt};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite object store
    pub db_path: PathBuf,

    /// Root of the directory artifact catalog
    pub catalog_dir: PathBuf,

    /// Number of concurrent reconcile workers
    pub workers: usize,

    /// Deadline for a single reconcile pass
    pub reconcile_timeout_secs: u64,

    /// How often the controller lists transactions
    pub poll_interval_secs: u64,

    /// Delay before retrying a transaction blocked on the lock
    pub blocked_requeue_secs: u64,

    /// Cap on per-transaction error backoff
    pub max_backoff_secs: u64,

    /// Retry limit given to transactions created from the CLI
    pub default_retry_limit: u32,

    /// Revision history limit given to packages created from the CLI
    pub default_revision_history_limit: u32,

    /// Attempts per install step on transient store errors
    pub step_retry_attempts: u32,

    /// Base delay between install step attempts (multiplied by attempt)
    pub step_retry_delay_ms: u64,

    /// Version of the host platform, checked against package constraints
    pub platform_version: String,

    /// Tracing filter used when RUST_LOG is unset
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/lockstep/lockstep.db"),
            catalog_dir: PathBuf::from("/var/lib/lockstep/catalog"),
            workers: 4,
            reconcile_timeout_secs: 600,
            poll_interval_secs: 5,
            blocked_requeue_secs: 3,
            max_backoff_secs: 300,
            default_retry_limit: crate::db::models::DEFAULT_RETRY_LIMIT,
            default_revision_history_limit: 1,
            step_retry_attempts: 5,
            step_retry_delay_ms: 100,
            platform_version: "1.30.0".to_string(),
            log_filter: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".to_string()));
        }
        if self.step_retry_attempts == 0 {
            return Err(Error::ConfigError(
                "step_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "reconcile_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.reconcile_timeout() > MAX_TIMEOUT {
            return Err(Error::ConfigError(format!(
                "reconcile_timeout_secs must be at most {}",
                MAX_TIMEOUT.as_secs()
            )));
        }
        self.platform_version().map_err(|e| {
            Error::ConfigError(format!(
                "Invalid platform_version '{}': {}",
                self.platform_version, e
            ))
        })?;
        Ok(())
    }

    pub fn platform_version(&self) -> Result<Version> {
        Version::parse(&self.platform_version)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn blocked_requeue(&self) -> Duration {
        Duration::from_secs(self.blocked_requeue_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn step_retry_delay(&self) -> Duration {
        Duration::from_millis(self.step_retry_delay_ms)
    }
}
