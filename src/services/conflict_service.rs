//! Conflict store.
//!
//! The [`ConflictStore`] is the single reconciliation point between a
//! locally edited item and a diverging server version. It keeps pending
//! conflicts and per-type resolution preferences, applies the resolution
//! policy, and appends every decision to the audit trail.
//!
//! Content conflicts always wait for an explicit decision, whatever the
//! stored preference says.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::{
    AccountId, ConflictId, ConflictPreference, ConflictResolution, ConflictType, MailItem,
    PendingConflict, ResolutionStrategy,
};
use crate::storage::DatabaseError;

/// Errors that can occur during conflict operations.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Persisting the change failed. The in-memory state is unchanged.
    #[error("conflict storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Result type for conflict operations.
pub type ConflictResult<T> = std::result::Result<T, ConflictError>;

/// What [`ConflictStore::reconcile`] did with a detected divergence.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// The stored preference decided it. The resolution is in the audit trail.
    AutoResolved(ConflictResolution),
    /// The conflict now waiting for a decision.
    Pending(PendingConflict),
}

/// Persistence for conflicts, preferences and the audit trail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConflictStorage: Send + Sync {
    /// Stores a pending conflict. Returns false if the id already exists.
    async fn insert_pending(&self, conflict: &PendingConflict) -> crate::storage::Result<bool>;

    /// Stores a pending conflict, overwriting the versions, fields and type
    /// of one that already has the same id.
    async fn replace_pending(&self, conflict: &PendingConflict) -> crate::storage::Result<()>;

    /// Loads all pending conflicts.
    async fn pending_conflicts(&self) -> crate::storage::Result<Vec<PendingConflict>>;

    /// Removes an account's pending conflicts.
    async fn delete_pending_for_account(&self, account_id: &AccountId)
        -> crate::storage::Result<usize>;

    /// Appends an audit record and drops the matching pending conflict.
    async fn record_resolution(&self, resolution: &ConflictResolution)
        -> crate::storage::Result<()>;

    /// Loads the audit trail, oldest first.
    async fn resolutions(&self) -> crate::storage::Result<Vec<ConflictResolution>>;

    /// Stores the preference for a conflict type.
    async fn set_preference(
        &self,
        conflict_type: ConflictType,
        preference: ConflictPreference,
    ) -> crate::storage::Result<()>;

    /// Loads stored preferences.
    async fn preferences(&self) -> crate::storage::Result<Vec<(ConflictType, ConflictPreference)>>;
}

/// Pending conflicts and resolution policy.
///
/// Writes go to storage first; the cache only changes once the write has
/// succeeded, so a failed call leaves no partial state behind.
pub struct ConflictStore {
    storage: Arc<dyn ConflictStorage>,
    /// Pending conflicts in detection order. Held across storage writes.
    pending: Mutex<Vec<PendingConflict>>,
    preferences: StdRwLock<HashMap<ConflictType, ConflictPreference>>,
}

impl ConflictStore {
    /// Creates an empty store over `storage`.
    pub fn new(storage: Arc<dyn ConflictStorage>) -> Self {
        Self {
            storage,
            pending: Mutex::new(Vec::new()),
            preferences: StdRwLock::new(HashMap::new()),
        }
    }

    /// Creates a store and restores pending conflicts and preferences.
    pub async fn load(storage: Arc<dyn ConflictStorage>) -> ConflictResult<Self> {
        let pending = storage.pending_conflicts().await?;
        let preferences = storage.preferences().await?;
        tracing::debug!(
            pending = pending.len(),
            preferences = preferences.len(),
            "conflict store loaded"
        );

        Ok(Self {
            storage,
            pending: Mutex::new(pending),
            preferences: StdRwLock::new(preferences.into_iter().collect()),
        })
    }

    /// Adds a conflict awaiting a decision.
    ///
    /// Adding an id that is already pending is a no-op returning `false`.
    pub async fn add_pending_conflict(&self, conflict: PendingConflict) -> ConflictResult<bool> {
        let mut pending = self.pending.lock().await;
        if pending.iter().any(|c| c.id == conflict.id) {
            return Ok(false);
        }

        self.storage.insert_pending(&conflict).await?;
        tracing::info!(
            conflict_id = %conflict.id,
            email_id = %conflict.email_id,
            account_id = %conflict.account_id,
            conflict_type = conflict.conflict_type.as_str(),
            "conflict pending"
        );
        pending.push(conflict);
        Ok(true)
    }

    /// Resolves a pending conflict.
    ///
    /// `Local` and `Server` pick the stored version. `Merged` requires
    /// `merged`; without it nothing changes and `None` is returned. An
    /// unknown id also returns `None`.
    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        strategy: ResolutionStrategy,
        merged: Option<MailItem>,
    ) -> ConflictResult<Option<ConflictResolution>> {
        let mut pending = self.pending.lock().await;
        let Some(index) = pending.iter().position(|c| c.id == *id) else {
            tracing::debug!(conflict_id = %id, "resolve for unknown conflict");
            return Ok(None);
        };

        let Some(resolution) = build_resolution(&pending[index], strategy, merged) else {
            tracing::warn!(conflict_id = %id, "merged resolution without merged data");
            return Ok(None);
        };

        self.storage.record_resolution(&resolution).await?;
        pending.remove(index);
        tracing::info!(
            conflict_id = %id,
            strategy = strategy.as_str(),
            "conflict resolved"
        );
        Ok(Some(resolution))
    }

    /// Resolves a freshly detected conflict with the stored preference.
    ///
    /// Returns `None`, with nothing recorded, when the conflict's type must
    /// be asked about.
    pub async fn auto_resolve(
        &self,
        conflict: &PendingConflict,
    ) -> ConflictResult<Option<ConflictResolution>> {
        let Some(strategy) = self.auto_resolution_strategy(conflict.conflict_type) else {
            return Ok(None);
        };
        let Some(resolution) = build_resolution(conflict, strategy, None) else {
            return Ok(None);
        };

        let mut pending = self.pending.lock().await;
        self.storage.record_resolution(&resolution).await?;
        pending.retain(|c| c.id != conflict.id);
        tracing::info!(
            conflict_id = %conflict.id,
            conflict_type = conflict.conflict_type.as_str(),
            strategy = strategy.as_str(),
            "conflict auto-resolved"
        );
        Ok(Some(resolution))
    }

    /// Reconciles a divergence found during sync.
    ///
    /// An item has at most one pending conflict. When one is already pending
    /// for the item, the new conflict takes over its id and detection time
    /// and replaces its server version, fields and type, so a later decision
    /// always sees the newest server state. The merged conflict is then
    /// auto-resolved if the preference allows it, which also clears the
    /// pending entry, or stored as pending.
    pub async fn reconcile(&self, mut conflict: PendingConflict) -> ConflictResult<Reconciled> {
        let mut pending = self.pending.lock().await;
        let existing = pending
            .iter()
            .position(|c| c.account_id == conflict.account_id && c.email_id == conflict.email_id);
        if let Some(index) = existing {
            conflict.id = pending[index].id.clone();
            conflict.detected_at = pending[index].detected_at;
        }

        let strategy = self.auto_resolution_strategy(conflict.conflict_type);
        if let Some(resolution) =
            strategy.and_then(|strategy| build_resolution(&conflict, strategy, None))
        {
            self.storage.record_resolution(&resolution).await?;
            if let Some(index) = existing {
                pending.remove(index);
            }
            tracing::info!(
                conflict_id = %conflict.id,
                conflict_type = conflict.conflict_type.as_str(),
                strategy = resolution.strategy.as_str(),
                superseded = existing.is_some(),
                "conflict auto-resolved"
            );
            return Ok(Reconciled::AutoResolved(resolution));
        }

        match existing {
            Some(index) => {
                self.storage.replace_pending(&conflict).await?;
                tracing::info!(
                    conflict_id = %conflict.id,
                    email_id = %conflict.email_id,
                    conflict_type = conflict.conflict_type.as_str(),
                    "pending conflict updated with newer server version"
                );
                pending[index] = conflict.clone();
            }
            None => {
                self.storage.insert_pending(&conflict).await?;
                tracing::info!(
                    conflict_id = %conflict.id,
                    email_id = %conflict.email_id,
                    account_id = %conflict.account_id,
                    conflict_type = conflict.conflict_type.as_str(),
                    "conflict pending"
                );
                pending.push(conflict.clone());
            }
        }
        Ok(Reconciled::Pending(conflict))
    }

    /// Whether conflicts of `conflict_type` are resolved without asking.
    pub fn should_auto_resolve(&self, conflict_type: ConflictType) -> bool {
        self.auto_resolution_strategy(conflict_type).is_some()
    }

    /// Strategy applied automatically to `conflict_type`, if any.
    ///
    /// Always `None` for content conflicts.
    pub fn auto_resolution_strategy(&self, conflict_type: ConflictType) -> Option<ResolutionStrategy> {
        if conflict_type == ConflictType::Content {
            return None;
        }
        self.preference(conflict_type).strategy()
    }

    /// Stored preference for a type. Defaults to always-ask.
    pub fn preference(&self, conflict_type: ConflictType) -> ConflictPreference {
        self.preferences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conflict_type)
            .copied()
            .unwrap_or_default()
    }

    /// Stores a preference. A content preference is kept but never acted on.
    pub async fn set_preference(
        &self,
        conflict_type: ConflictType,
        preference: ConflictPreference,
    ) -> ConflictResult<()> {
        self.storage.set_preference(conflict_type, preference).await?;
        self.preferences
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conflict_type, preference);
        tracing::debug!(
            conflict_type = conflict_type.as_str(),
            preference = preference.as_str(),
            "conflict preference stored"
        );
        Ok(())
    }

    /// Looks up a pending conflict.
    pub async fn pending_conflict(&self, id: &ConflictId) -> Option<PendingConflict> {
        self.pending
            .lock()
            .await
            .iter()
            .find(|c| c.id == *id)
            .cloned()
    }

    /// Pending conflicts for one account, in detection order.
    pub async fn conflicts_for_account(&self, account_id: &AccountId) -> Vec<PendingConflict> {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|c| c.account_id == *account_id)
            .cloned()
            .collect()
    }

    /// All pending conflicts, in detection order.
    pub async fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.pending.lock().await.clone()
    }

    /// Number of pending conflicts.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// The audit trail, oldest first.
    pub async fn resolutions(&self) -> ConflictResult<Vec<ConflictResolution>> {
        Ok(self.storage.resolutions().await?)
    }

    /// Drops an account's pending conflicts. Audit records are kept.
    pub async fn discard_for_account(&self, account_id: &AccountId) -> ConflictResult<usize> {
        let mut pending = self.pending.lock().await;
        let removed = self.storage.delete_pending_for_account(account_id).await?;
        pending.retain(|c| c.account_id != *account_id);
        Ok(removed)
    }
}

impl std::fmt::Debug for ConflictStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictStore").finish_non_exhaustive()
    }
}

fn build_resolution(
    conflict: &PendingConflict,
    strategy: ResolutionStrategy,
    merged: Option<MailItem>,
) -> Option<ConflictResolution> {
    let mut resolved_data = match strategy {
        ResolutionStrategy::Local => conflict.local_version.clone(),
        ResolutionStrategy::Server => conflict.server_version.clone(),
        ResolutionStrategy::Merged => merged?,
    };
    resolved_data.id = conflict.email_id.clone();
    resolved_data.account_id = conflict.account_id.clone();

    Some(ConflictResolution {
        conflict_id: conflict.id.clone(),
        email_id: conflict.email_id.clone(),
        account_id: conflict.account_id.clone(),
        conflict_type: conflict.conflict_type,
        conflicting_fields: conflict.conflicting_fields.clone(),
        strategy,
        resolved_data,
        resolved_at: Utc::now(),
    })
}
