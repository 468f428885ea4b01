//! Configuration and settings management.
//!
//! This module provides the engine settings types and their persistence.
//! Settings are stored in the user's config directory as JSON and can be
//! overridden through `MAILSYNC_*` environment variables.

mod settings;

pub use settings::{
    ConfigError, NotifierSettings, Settings, StorageSettings, SyncSettings, ENV_DATABASE,
    ENV_DEBOUNCE_MS, ENV_MAX_RETRIES, ENV_MAX_WAIT_MS, ENV_SYNC_INTERVAL_MS,
};
