//! Remote mailbox provider seam.
//!
//! This module contains the [`ProviderAdapter`] trait consumed by the sync
//! orchestrator. Concrete adapters (Gmail REST, Microsoft Graph, IMAP) are
//! external collaborators: they own wire formats, OAuth, and paging, and
//! surface failures as [`ProviderError`] for the error classifier.

mod traits;

#[cfg(test)]
pub use traits::MockProviderAdapter;
pub use traits::{ChangeSet, ProviderAdapter, ProviderError, Result};
