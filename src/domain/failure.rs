//! Sync failure records.
//!
//! Classified errors are ephemeral; only the [`SyncFailure`] derived from
//! them is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, EmailId};

/// Retry-relevant error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Network blips, rate limiting, server-side 5xx.
    Transient,
    /// Client errors that retrying cannot fix.
    Permanent,
    /// Anything unrecognized. Retried, but bounded.
    Unknown,
}

/// A failure mapped onto the retry taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Error class.
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// HTTP status, when known.
    pub http_status: Option<u16>,
    /// Human readable message, preserved from the raw error.
    pub message: String,
    /// Server-provided delay before retrying.
    pub retry_after_ms: Option<u64>,
}

impl ClassifiedError {
    /// Creates a classified error without status or retry hint.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status: None,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Sets the HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Sets the retry hint.
    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    /// Returns true for [`ErrorKind::Permanent`].
    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }
}

/// Lifecycle state of a persisted failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStatus {
    /// Will be retried.
    Pending,
    /// Retries used up.
    Exhausted,
    /// Not retryable.
    Permanent,
}

impl FailureStatus {
    /// Returns the storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Exhausted => "exhausted",
            Self::Permanent => "permanent",
        }
    }

    /// Parses the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "exhausted" => Some(Self::Exhausted),
            "permanent" => Some(Self::Permanent),
            _ => None,
        }
    }

    /// Whether the user has to act on this failure.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Permanent)
    }
}

/// A persisted record of a failed fetch or apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    /// Account the failure belongs to.
    pub account_id: AccountId,
    /// Failed item; `None` when the whole pass failed (e.g. fetch).
    pub item_id: Option<EmailId>,
    /// Classified cause of the latest attempt.
    pub error: ClassifiedError,
    /// Number of consecutive failed attempts.
    pub attempt: u32,
    /// Current status.
    pub status: FailureStatus,
    /// Time of the latest attempt.
    pub updated_at: DateTime<Utc>,
}
