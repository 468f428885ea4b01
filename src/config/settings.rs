//! Engine settings and configuration types.
//!
//! Settings are persisted to `<config dir>/settings.json` (XDG or platform
//! equivalent) and may be overridden from the environment at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::RetryPolicy;

/// Errors that can occur while loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Environment variable overriding [`SyncSettings::interval_ms`].
pub const ENV_SYNC_INTERVAL_MS: &str = "MAILSYNC_SYNC_INTERVAL_MS";
/// Environment variable overriding [`SyncSettings::max_retries`].
pub const ENV_MAX_RETRIES: &str = "MAILSYNC_MAX_RETRIES";
/// Environment variable overriding [`NotifierSettings::debounce_ms`].
pub const ENV_DEBOUNCE_MS: &str = "MAILSYNC_DEBOUNCE_MS";
/// Environment variable overriding [`NotifierSettings::max_wait_ms`].
pub const ENV_MAX_WAIT_MS: &str = "MAILSYNC_MAX_WAIT_MS";
/// Environment variable overriding [`StorageSettings::database_path`].
pub const ENV_DATABASE: &str = "MAILSYNC_DATABASE";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Sync scheduling and retry.
    pub sync: SyncSettings,
    /// Change notification shaping.
    pub notifier: NotifierSettings,
    /// Local storage location.
    pub storage: StorageSettings,
}

/// Sync scheduling and retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Whether periodic sync runs at all.
    pub enabled: bool,
    /// Interval between periodic passes, in milliseconds.
    pub interval_ms: u64,
    /// Failed attempts before a failure is exhausted.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Ceiling for any retry delay, in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Passes applying at least this many changes hold the batch gate.
    pub bulk_threshold: usize,
    /// Whether `start()` runs an immediate pass per account.
    pub sync_on_start: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 300_000, // 5 minutes
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 300_000,
            bulk_threshold: 25,
            sync_on_start: true,
        }
    }
}

impl SyncSettings {
    /// Interval between periodic passes.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Retry policy derived from these settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

/// Change notifier timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    /// Trailing debounce in batched mode, in milliseconds.
    pub debounce_ms: u64,
    /// Hard cap on emission delay in batched mode, in milliseconds.
    pub max_wait_ms: u64,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            max_wait_ms: 500,
        }
    }
}

/// Storage location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database file; the platform data directory when unset.
    pub database_path: Option<PathBuf>,
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "mailsync", "mailsync").ok_or(ConfigError::NoConfigDir)
}

impl Settings {
    /// Default settings file location.
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("settings.json"))
    }

    /// Loads settings from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes settings to `path`, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Applies `MAILSYNC_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Applies overrides from an arbitrary lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, ENV_SYNC_INTERVAL_MS)? {
            self.sync.interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_RETRIES)? {
            self.sync.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_DEBOUNCE_MS)? {
            self.notifier.debounce_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_WAIT_MS)? {
            self.notifier.max_wait_ms = v;
        }
        if let Some(path) = lookup(ENV_DATABASE).filter(|p| !p.is_empty()) {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Database file to open.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join("mailsync.db")),
        }
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}
