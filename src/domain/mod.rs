//! Domain layer types for the sync engine.
//!
//! This module contains the core domain types shared by the services and
//! the storage layer: accounts, mail item documents, conflicts, and
//! failure records.

mod account;
mod conflict;
mod email;
mod failure;
mod types;

pub use account::{Account, Cursor, ProviderType, SyncStatus};
pub use conflict::{
    ConflictPreference, ConflictResolution, ConflictType, PendingConflict, ResolutionStrategy,
};
pub use email::{fields, Address, EmailQuery, MailItem};
pub use failure::{ClassifiedError, ErrorKind, FailureStatus, SyncFailure};
pub use types::{AccountId, ConflictId, EmailId, LabelId, ThreadId};
