//! Mail item documents.
//!
//! A [`MailItem`] is the local document mirror of one remote message. The
//! document store keys every write by [`MailItem::id`], so applying the same
//! item twice is harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, ConflictType, EmailId, LabelId, ThreadId};

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }
}

/// Local document for a single message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailItem {
    /// Stable provider-assigned id.
    pub id: EmailId,
    /// Owning account.
    pub account_id: AccountId,
    /// Conversation this message belongs to.
    pub thread_id: ThreadId,
    /// Sender.
    pub from: Address,
    /// Subject line.
    pub subject: Option<String>,
    /// Short preview of the body.
    pub snippet: String,
    /// Plain text body, if fetched.
    pub body: Option<String>,
    /// Labels applied to this message.
    pub labels: Vec<LabelId>,
    /// Read flag.
    pub is_read: bool,
    /// Starred flag.
    pub is_starred: bool,
    /// Tombstone set when the server deleted the message.
    pub is_deleted: bool,
    /// Set when the user edited this document and the edit has not been
    /// acknowledged by the server yet.
    pub has_local_changes: bool,
    /// Server-side modification time of the version this document reflects.
    pub server_updated_at: DateTime<Utc>,
}

/// Fields compared when detecting divergence between two versions.
pub mod fields {
    pub const SUBJECT: &str = "subject";
    pub const SNIPPET: &str = "snippet";
    pub const BODY: &str = "body";
    pub const FROM: &str = "from";
    pub const LABELS: &str = "labels";
    pub const IS_READ: &str = "is_read";
    pub const IS_STARRED: &str = "is_starred";
    pub const IS_DELETED: &str = "is_deleted";
    pub const THREAD_ID: &str = "thread_id";
}

impl MailItem {
    /// Creates a minimal item, mostly useful for providers and tests.
    pub fn new(id: impl Into<EmailId>, account_id: impl Into<AccountId>) -> Self {
        let id = id.into();
        Self {
            thread_id: ThreadId(id.0.clone()),
            id,
            account_id: account_id.into(),
            from: Address::new("unknown@localhost"),
            subject: None,
            snippet: String::new(),
            body: None,
            labels: Vec::new(),
            is_read: false,
            is_starred: false,
            is_deleted: false,
            has_local_changes: false,
            server_updated_at: Utc::now(),
        }
    }

    /// Returns the names of the user-visible fields that differ between the
    /// two versions. Sync bookkeeping (`has_local_changes`,
    /// `server_updated_at`) is not compared.
    pub fn diff(&self, other: &MailItem) -> Vec<String> {
        let mut changed = Vec::new();
        let mut check = |differs: bool, name: &str| {
            if differs {
                changed.push(name.to_string());
            }
        };

        check(self.subject != other.subject, fields::SUBJECT);
        check(self.snippet != other.snippet, fields::SNIPPET);
        check(self.body != other.body, fields::BODY);
        check(self.from != other.from, fields::FROM);
        check(self.labels != other.labels, fields::LABELS);
        check(self.is_read != other.is_read, fields::IS_READ);
        check(self.is_starred != other.is_starred, fields::IS_STARRED);
        check(self.is_deleted != other.is_deleted, fields::IS_DELETED);
        check(self.thread_id != other.thread_id, fields::THREAD_ID);

        changed
    }

    /// Compares two versions and classifies the divergence, if any.
    pub fn conflict_with(&self, other: &MailItem) -> Option<(ConflictType, Vec<String>)> {
        let changed = self.diff(other);
        ConflictType::for_fields(&changed).map(|kind| (kind, changed))
    }
}

/// Filter over mirrored mail items. Tombstones are always excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailQuery {
    /// Restrict to one account.
    pub account_id: Option<AccountId>,
    /// Restrict to items carrying this label.
    pub label: Option<LabelId>,
    /// Only unread items.
    pub unread_only: bool,
}

impl EmailQuery {
    /// Matches every live item.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to one account.
    pub fn account(mut self, account_id: impl Into<AccountId>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Restricts to items carrying `label`.
    pub fn label(mut self, label: impl Into<LabelId>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Restricts to unread items.
    pub fn unread(mut self) -> Self {
        self.unread_only = true;
        self
    }

    /// Evaluates the filter against one item.
    pub fn matches(&self, item: &MailItem) -> bool {
        !item.is_deleted
            && self
                .account_id
                .as_ref()
                .map_or(true, |id| *id == item.account_id)
            && self
                .label
                .as_ref()
                .map_or(true, |label| item.labels.contains(label))
            && (!self.unread_only || !item.is_read)
    }
}
