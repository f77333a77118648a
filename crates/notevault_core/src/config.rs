//! Core runtime configuration.
//!
//! # Responsibility
//! - Provide defaults for autosave, commit retry, backup and KDF policy.
//! - Load optional overrides from `<root>/notevault.json`.
//!
//! # Invariants
//! - A missing config file yields defaults, never an error.
//! - Loaded values are normalized before use; out-of-range values are rejected.

use crate::model::KdfParams;
use crate::storage::BackendKind;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

/// File name of the optional per-workspace configuration.
pub const CONFIG_FILE_NAME: &str = "notevault.json";

const DEFAULT_AUTOSAVE_INTERVAL_MS: u64 = 2_000;
const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
const DEFAULT_BACKUP_EVERY_COMMITS: u64 = 10;
const DEFAULT_MAX_BACKUPS: usize = 5;
const DEFAULT_LIST_PAGE_SIZE: usize = 64;
const MAX_RETRY_ATTEMPTS: u32 = 20;
// argon2 rejects memory costs below 8 KiB per lane.
const MIN_KDF_MEMORY_KIB_PER_LANE: u32 = 8;

/// Configuration load/validation error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read config: {err}"),
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

/// Bounded-backoff policy for transient OS write contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), growing linearly.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Core configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Backend used when no marker exists yet.
    pub default_backend: BackendKind,
    /// Autosave tick interval.
    pub autosave_interval_ms: u64,
    pub retry: RetryPolicy,
    /// Take a backup snapshot every N commits (0 disables periodic snapshots).
    pub backup_every_commits: u64,
    /// Snapshots retained per backend kind.
    pub max_backups: usize,
    /// Argon2id costs for newly created vaults.
    pub kdf: KdfParams,
    /// Page size used by lazy summary cursors.
    pub list_page_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_backend: BackendKind::Document,
            autosave_interval_ms: DEFAULT_AUTOSAVE_INTERVAL_MS,
            retry: RetryPolicy::default(),
            backup_every_commits: DEFAULT_BACKUP_EVERY_COMMITS,
            max_backups: DEFAULT_MAX_BACKUPS,
            kdf: KdfParams::default(),
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }
}

impl CoreConfig {
    /// Loads `<root>/notevault.json`, falling back to defaults when absent.
    pub fn load(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = root.as_ref().join(CONFIG_FILE_NAME);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(ConfigError::Io(err)),
        };
        let config: Self = serde_json::from_slice(&raw).map_err(ConfigError::Parse)?;
        config.normalized()
    }

    /// Validates ranges and fills degenerate values with defaults.
    pub fn normalized(mut self) -> Result<Self, ConfigError> {
        if self.retry.max_attempts == 0 {
            self.retry.max_attempts = 1;
        }
        if self.retry.max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(ConfigError::Invalid(format!(
                "retry.max_attempts {} exceeds {MAX_RETRY_ATTEMPTS}",
                self.retry.max_attempts
            )));
        }
        if self.autosave_interval_ms == 0 {
            self.autosave_interval_ms = DEFAULT_AUTOSAVE_INTERVAL_MS;
        }
        if self.list_page_size == 0 {
            self.list_page_size = DEFAULT_LIST_PAGE_SIZE;
        }
        if self.max_backups == 0 {
            self.max_backups = 1;
        }
        if self.kdf.parallelism == 0 || self.kdf.iterations == 0 {
            return Err(ConfigError::Invalid(
                "kdf.parallelism and kdf.iterations must be positive".to_string(),
            ));
        }
        if self.kdf.memory_kib < MIN_KDF_MEMORY_KIB_PER_LANE * self.kdf.parallelism {
            return Err(ConfigError::Invalid(format!(
                "kdf.memory_kib must be at least {} for {} lanes",
                MIN_KDF_MEMORY_KIB_PER_LANE * self.kdf.parallelism,
                self.kdf.parallelism
            )));
        }
        Ok(self)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }
}
