//! # Config - Bookie Storage Settings
//!
//! All settings are controlled via environment variables:
//!
//! ```text
//! BOOKIE_LEDGER_DIRS        comma separated ledger dirs   (default: "data/ledgers")
//! BOOKIE_ENTRY_LOG_SIZE_MB  entry log rollover size, MiB  (default: 64)
//! BOOKIE_WRITE_CACHE_MB     size of each write cache, MiB (default: 16)
//! BOOKIE_FLUSH_INTERVAL_MS  periodic checkpoint interval  (default: 60000)
//! BOOKIE_CHECK_RATE         consistency checks per second (default: 0 = unthrottled)
//! ```
//!
//! Unparseable values fall back to the default; [`StorageConfig::validate`]
//! catches values that parse but cannot work.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LEDGER_DIR: &str = "data/ledgers";
pub const DEFAULT_ENTRY_LOG_SIZE_MB: u64 = 64;
pub const DEFAULT_WRITE_CACHE_MB: usize = 16;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 60_000;

const MIB: u64 = 1024 * 1024;

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no ledger directories configured")]
    NoLedgerDirs,

    #[error("write cache capacity must be non-zero")]
    ZeroCacheCapacity,

    #[error("entry log size limit {0} is smaller than a log header")]
    EntryLogTooSmall(u64),

    #[error("flush interval must be non-zero")]
    ZeroFlushInterval,
}

/// Settings of one ledger storage instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directories holding index files; entry logs live in the first one.
    pub ledger_dirs: Vec<PathBuf>,
    /// Size in bytes past which the entry log rolls over to a new file.
    pub entry_log_size_limit: u64,
    /// Capacity in bytes of each of the two write caches.
    pub write_cache_capacity: usize,
    /// Interval between periodic checkpoints.
    pub flush_interval: Duration,
    /// Permits per second for the consistency scan, 0 for unthrottled.
    pub consistency_check_rate: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_dirs: vec![PathBuf::from(DEFAULT_LEDGER_DIR)],
            entry_log_size_limit: DEFAULT_ENTRY_LOG_SIZE_MB * MIB,
            write_cache_capacity: DEFAULT_WRITE_CACHE_MB * MIB as usize,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            consistency_check_rate: 0,
        }
    }
}

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl StorageConfig {
    /// Default settings rooted at a single ledger directory.
    pub fn with_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            ledger_dirs: vec![dir.into()],
            ..Self::default()
        }
    }

    /// Builds the configuration from `BOOKIE_*` environment variables.
    pub fn from_env() -> Self {
        let ledger_dirs = env_or("BOOKIE_LEDGER_DIRS", DEFAULT_LEDGER_DIR)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        let log_mb: u64 = env_or("BOOKIE_ENTRY_LOG_SIZE_MB", "64")
            .parse()
            .unwrap_or(DEFAULT_ENTRY_LOG_SIZE_MB);
        let cache_mb: usize = env_or("BOOKIE_WRITE_CACHE_MB", "16")
            .parse()
            .unwrap_or(DEFAULT_WRITE_CACHE_MB);
        let flush_ms: u64 = env_or("BOOKIE_FLUSH_INTERVAL_MS", "60000")
            .parse()
            .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS);
        let rate: u32 = env_or("BOOKIE_CHECK_RATE", "0").parse().unwrap_or(0);

        Self {
            ledger_dirs,
            entry_log_size_limit: log_mb.saturating_mul(MIB),
            write_cache_capacity: cache_mb.saturating_mul(MIB as usize),
            flush_interval: Duration::from_millis(flush_ms),
            consistency_check_rate: rate,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger_dirs.is_empty() {
            return Err(ConfigError::NoLedgerDirs);
        }
        if self.write_cache_capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if self.entry_log_size_limit <= entrylog::LOG_HEADER_BYTES {
            return Err(ConfigError::EntryLogTooSmall(self.entry_log_size_limit));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        Ok(())
    }
}
