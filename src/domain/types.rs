//! Core identifier types for domain entities.
//!
//! These newtype wrappers provide type safety for entity identifiers,
//! preventing accidental mixing of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a connected mailbox account.
    AccountId
);

string_id!(
    /// Stable identifier for a mail item, assigned by the provider.
    ///
    /// Every document-store write is an upsert keyed by this id.
    EmailId
);

string_id!(
    /// Identifier for a conversation thread.
    ThreadId
);

string_id!(
    /// Identifier for a label (folder/tag).
    LabelId
);

string_id!(
    /// Identifier for a pending conflict.
    ConflictId
);

impl ConflictId {
    /// Generates a fresh random conflict id.
    pub fn generate() -> Self {
        Self(format!("conflict-{}", uuid::Uuid::new_v4()))
    }
}
