//! Conflict domain types.
//!
//! A conflict exists when the server version of an item diverged from a
//! local edit that has not been synced yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::email::fields;
use super::{AccountId, ConflictId, EmailId, MailItem};

/// Category of a conflict, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    /// Flags such as read/starred.
    Metadata,
    /// Label membership.
    Labels,
    /// Message content. Never resolved automatically.
    Content,
}

impl ConflictType {
    /// All conflict types.
    pub const ALL: [ConflictType; 3] = [Self::Metadata, Self::Labels, Self::Content];

    /// Returns the storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Labels => "labels",
            Self::Content => "content",
        }
    }

    /// Parses the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metadata" => Some(Self::Metadata),
            "labels" => Some(Self::Labels),
            "content" => Some(Self::Content),
            _ => None,
        }
    }

    /// Classifies a set of differing fields; the most severe category wins.
    /// Returns `None` for an empty set.
    ///
    /// A tombstone divergence counts as content: one side deleted the item,
    /// so it always waits for a decision.
    pub fn for_fields<S: AsRef<str>>(changed: &[S]) -> Option<Self> {
        changed
            .iter()
            .map(|field| match field.as_ref() {
                fields::SUBJECT
                | fields::SNIPPET
                | fields::BODY
                | fields::FROM
                | fields::IS_DELETED => Self::Content,
                fields::LABELS => Self::Labels,
                _ => Self::Metadata,
            })
            .max()
    }
}

/// How a conflict was (or should be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Keep the local version.
    Local,
    /// Take the server version.
    Server,
    /// Use caller-supplied merged data.
    Merged,
}

impl ResolutionStrategy {
    /// Returns the storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Server => "server",
            Self::Merged => "merged",
        }
    }

    /// Parses the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "server" => Some(Self::Server),
            "merged" => Some(Self::Merged),
            _ => None,
        }
    }
}

/// User preference for resolving a conflict type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPreference {
    /// Surface the conflict and wait for a decision.
    #[default]
    AlwaysAsk,
    /// Keep the local version automatically.
    AlwaysLocal,
    /// Take the server version automatically.
    AlwaysServer,
}

impl ConflictPreference {
    /// Returns the storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlwaysAsk => "always-ask",
            Self::AlwaysLocal => "always-local",
            Self::AlwaysServer => "always-server",
        }
    }

    /// Parses the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always-ask" => Some(Self::AlwaysAsk),
            "always-local" => Some(Self::AlwaysLocal),
            "always-server" => Some(Self::AlwaysServer),
            _ => None,
        }
    }

    /// Strategy implied by this preference, `None` for [`Self::AlwaysAsk`].
    pub fn strategy(&self) -> Option<ResolutionStrategy> {
        match self {
            Self::AlwaysAsk => None,
            Self::AlwaysLocal => Some(ResolutionStrategy::Local),
            Self::AlwaysServer => Some(ResolutionStrategy::Server),
        }
    }
}

/// A divergence waiting for resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConflict {
    /// Conflict id.
    pub id: ConflictId,
    /// Item that diverged.
    pub email_id: EmailId,
    /// Owning account.
    pub account_id: AccountId,
    /// Conflict category.
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// Unsynced local version.
    pub local_version: MailItem,
    /// Version reported by the server.
    pub server_version: MailItem,
    /// Names of the fields that differ.
    pub conflicting_fields: Vec<String>,
    /// When the divergence was detected.
    pub detected_at: DateTime<Utc>,
}

impl PendingConflict {
    /// Builds a conflict from the two versions, or `None` if they agree.
    pub fn detect(local: &MailItem, server: &MailItem) -> Option<Self> {
        let (conflict_type, conflicting_fields) = local.conflict_with(server)?;
        Some(Self {
            id: ConflictId::generate(),
            email_id: server.id.clone(),
            account_id: server.account_id.clone(),
            conflict_type,
            local_version: local.clone(),
            server_version: server.clone(),
            conflicting_fields,
            detected_at: Utc::now(),
        })
    }
}

/// Immutable audit record of a resolved conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    /// Resolved conflict.
    pub conflict_id: ConflictId,
    /// Item that diverged.
    pub email_id: EmailId,
    /// Owning account.
    pub account_id: AccountId,
    /// Conflict category.
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// Fields that differed.
    pub conflicting_fields: Vec<String>,
    /// Strategy applied.
    pub strategy: ResolutionStrategy,
    /// Data written back to the document store.
    pub resolved_data: MailItem,
    /// When the decision was made.
    pub resolved_at: DateTime<Utc>,
}
