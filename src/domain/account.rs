//! Account domain types.
//!
//! An account is a connected remote mailbox together with its persisted
//! sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountId;

/// Opaque provider token marking "everything synced up to here".
///
/// Only the orchestrator advances a cursor, and only after the changes it
/// covers have been applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Type of remote mailbox provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Gmail REST API.
    Gmail,
    /// Microsoft Graph mail API.
    Outlook,
    /// Standard IMAP.
    Imap,
}

impl ProviderType {
    /// Returns the storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
            Self::Imap => "imap",
        }
    }

    /// Parses the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gmail" => Some(Self::Gmail),
            "outlook" => Some(Self::Outlook),
            "imap" => Some(Self::Imap),
            _ => None,
        }
    }
}

/// Status of an account's synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Sync has never run.
    #[default]
    Never,
    /// A sync pass is currently running.
    InProgress,
    /// Last pass completed successfully.
    Success,
    /// Last pass failed.
    Failed,
    /// Last pass was skipped because connectivity was down.
    Offline,
    /// Account was removed from scheduling.
    Inactive,
}

impl SyncStatus {
    /// Returns the storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Offline => "offline",
            Self::Inactive => "inactive",
        }
    }

    /// Parses the storage representation, falling back to [`SyncStatus::Never`].
    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "offline" => Self::Offline,
            "inactive" => Self::Inactive,
            _ => Self::Never,
        }
    }
}

/// A connected mailbox and its persisted sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique identifier for this account.
    pub id: AccountId,
    /// Provider backing this account.
    pub provider: ProviderType,
    /// Last applied cursor, `None` before the first successful pass.
    pub cursor: Option<Cursor>,
    /// Time of the last successful pass.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Current sync status.
    pub status: SyncStatus,
}

impl Account {
    /// Creates the initial state for a newly connected account.
    pub fn new(id: AccountId, provider: ProviderType) -> Self {
        Self {
            id,
            provider,
            cursor: None,
            last_sync_at: None,
            status: SyncStatus::Never,
        }
    }
}
