//! Provider adapter trait definition.
//!
//! This module defines the [`ProviderAdapter`] trait through which the sync
//! orchestrator pulls deltas from a remote mailbox (Gmail API, Microsoft
//! Graph, IMAP). Wire formats and authentication live entirely behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Cursor, MailItem, ProviderType};

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur during provider operations.
///
/// Adapters surface transport failures and raw HTTP statuses here; the
/// error classifier decides what is retryable.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Authentication failed or credentials expired.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or connection error; no response was received.
    #[error("connection error: {0}")]
    Connection(String),

    /// The request timed out before a response arrived.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code.
        status: u16,
        /// Parsed `Retry-After` header, in seconds.
        retry_after_secs: Option<u64>,
        /// Response body or reason phrase.
        message: String,
    },

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider-specific error.
    #[error("provider error: {0}")]
    Provider(String),

    /// HTTP client error.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// A page of changes returned by [`ProviderAdapter::fetch_changes`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Items created, updated, or tombstoned since the requested cursor.
    pub changes: Vec<MailItem>,
    /// Cursor to store once `changes` have been applied.
    pub next_cursor: Option<Cursor>,
}

impl ChangeSet {
    /// Creates a change set.
    pub fn new(changes: Vec<MailItem>, next_cursor: impl Into<Cursor>) -> Self {
        Self {
            changes,
            next_cursor: Some(next_cursor.into()),
        }
    }

    /// Returns true if no items changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Adapter for a remote mailbox.
///
/// The orchestrator is the only caller. Implementations must be cheap to
/// share across tasks; one adapter instance serves one account.
///
/// # Example
///
/// ```ignore
/// use mailsync::providers::{ChangeSet, ProviderAdapter};
///
/// async fn pull(adapter: &dyn ProviderAdapter) -> mailsync::providers::Result<ChangeSet> {
///     adapter.fetch_changes(None).await
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Returns the type of this provider.
    fn provider_type(&self) -> ProviderType;

    /// Fetches everything that changed after `cursor`.
    ///
    /// `None` requests a full initial sync.
    ///
    /// # Errors
    ///
    /// Returns transport-level errors and HTTP statuses as they occurred;
    /// adapters must not retry internally.
    async fn fetch_changes(&self, cursor: Option<Cursor>) -> Result<ChangeSet>;
}
