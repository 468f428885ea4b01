//! SQLite persistence for the sync engine.
//!
//! This module provides the storage layer for mailsync, including:
//!
//! - The local document mirror of every account's mail items
//! - Per-account sync state (cursor, status, last sync time)
//! - Failure records, pending conflicts, preferences, and the conflict audit trail
//! - Live queries over the document mirror
//!
//! All database work runs on the blocking pool via `tokio::task::spawn_blocking`.

mod database;
pub mod queries;
mod schema;

pub use database::{Database, DatabaseError, Result};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::domain::{
    Account, AccountId, ConflictPreference, ConflictResolution, ConflictType, Cursor, EmailId,
    EmailQuery, MailItem, PendingConflict, SyncFailure, SyncStatus,
};
use crate::services::{ConflictStorage, DocumentStore, SyncStorage};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Combined storage layer over one database.
///
/// This is the main entry point for storage operations. It implements the
/// persistence traits consumed by the services and announces every
/// document write to live queries.
#[derive(Debug, Clone)]
pub struct StorageLayer {
    db: Database,
    changes: broadcast::Sender<EmailId>,
}

impl StorageLayer {
    /// Opens (or creates) the database at `db_path`.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(Database::open(db_path).await?))
    }

    /// Creates a storage layer with an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory().await?))
    }

    fn from_database(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { db, changes }
    }

    /// Returns a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Wraps the storage layer in an Arc for shared ownership.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Writes several items in one transaction, then notifies live queries.
    pub async fn upsert_many(&self, items: Vec<MailItem>) -> Result<usize> {
        let ids: Vec<EmailId> = items.iter().map(|item| item.id.clone()).collect();
        let count = queries::emails::upsert_many(&self.db, items).await?;
        for id in ids {
            self.announce(id);
        }
        Ok(count)
    }

    fn announce(&self, id: EmailId) {
        // Nobody watching is fine.
        let _ = self.changes.send(id);
    }
}

/// Waits for a relevant write. Queued notifications are drained so a burst
/// of writes costs one re-query. Returns false once the store is gone.
async fn next_change(
    rx: &mut broadcast::Receiver<EmailId>,
    relevant: impl Fn(&EmailId) -> bool,
) -> bool {
    loop {
        let mut hit = match rx.recv().await {
            Ok(id) => relevant(&id),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "live query lagged, re-querying");
                true
            }
            Err(RecvError::Closed) => return false,
        };
        loop {
            match rx.try_recv() {
                Ok(id) => hit |= relevant(&id),
                Err(TryRecvError::Lagged(_)) => hit = true,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        if hit {
            return true;
        }
    }
}

#[async_trait]
impl SyncStorage for StorageLayer {
    async fn ensure_account(&self, account: &Account) -> Result<Account> {
        queries::sync_state::ensure(&self.db, account).await
    }

    async fn account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        queries::sync_state::get(&self.db, account_id).await
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        queries::sync_state::get_all(&self.db).await
    }

    async fn set_status(&self, account_id: &AccountId, status: SyncStatus) -> Result<()> {
        queries::sync_state::set_status(&self.db, account_id, status).await
    }

    async fn advance_cursor(
        &self,
        account_id: &AccountId,
        cursor: Option<&Cursor>,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        queries::sync_state::advance_cursor(&self.db, account_id, cursor, synced_at).await
    }

    async fn delete_account(&self, account_id: &AccountId) -> Result<bool> {
        queries::sync_state::delete(&self.db, account_id).await
    }

    async fn failure(
        &self,
        account_id: &AccountId,
        item_id: Option<&EmailId>,
    ) -> Result<Option<SyncFailure>> {
        queries::failures::get(&self.db, account_id, item_id).await
    }

    async fn failures(&self, account_id: Option<&AccountId>) -> Result<Vec<SyncFailure>> {
        queries::failures::list(&self.db, account_id).await
    }

    async fn record_failure(&self, failure: &SyncFailure) -> Result<()> {
        queries::failures::upsert(&self.db, failure).await
    }

    async fn clear_failure(&self, account_id: &AccountId, item_id: Option<&EmailId>) -> Result<bool> {
        queries::failures::delete(&self.db, account_id, item_id).await
    }

    async fn clear_failures(&self, account_id: &AccountId) -> Result<usize> {
        queries::failures::delete_for_account(&self.db, account_id).await
    }
}

#[async_trait]
impl DocumentStore for StorageLayer {
    async fn upsert(&self, item: &MailItem) -> Result<()> {
        queries::emails::upsert(&self.db, item).await?;
        self.announce(item.id.clone());
        Ok(())
    }

    async fn find_one(&self, id: &EmailId) -> Result<Option<MailItem>> {
        queries::emails::get_by_id(&self.db, id).await
    }

    async fn find(&self, query: &EmailQuery) -> Result<Vec<MailItem>> {
        queries::emails::find(&self.db, query).await
    }

    fn watch_one(&self, id: EmailId) -> BoxStream<'static, Option<MailItem>> {
        let state = (self.db.clone(), self.changes.subscribe(), id, true);

        stream::unfold(state, |(db, mut rx, id, mut first)| async move {
            loop {
                if !first && !next_change(&mut rx, |changed| *changed == id).await {
                    return None;
                }
                first = false;
                match queries::emails::get_by_id(&db, &id).await {
                    Ok(item) => return Some((item, (db, rx, id, false))),
                    Err(e) => tracing::warn!(email_id = %id, "live query failed: {}", e),
                }
            }
        })
        .boxed()
    }

    fn watch(&self, query: EmailQuery) -> BoxStream<'static, Vec<MailItem>> {
        let state = (self.db.clone(), self.changes.subscribe(), query, true);

        stream::unfold(state, |(db, mut rx, query, mut first)| async move {
            loop {
                if !first && !next_change(&mut rx, |_| true).await {
                    return None;
                }
                first = false;
                match queries::emails::find(&db, &query).await {
                    Ok(items) => return Some((items, (db, rx, query, false))),
                    Err(e) => tracing::warn!(query = ?query, "live query failed: {}", e),
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl ConflictStorage for StorageLayer {
    async fn insert_pending(&self, conflict: &PendingConflict) -> Result<bool> {
        queries::conflicts::insert_pending(&self.db, conflict).await
    }

    async fn replace_pending(&self, conflict: &PendingConflict) -> Result<()> {
        queries::conflicts::replace_pending(&self.db, conflict).await
    }

    async fn pending_conflicts(&self) -> Result<Vec<PendingConflict>> {
        queries::conflicts::list_pending(&self.db).await
    }

    async fn delete_pending_for_account(&self, account_id: &AccountId) -> Result<usize> {
        queries::conflicts::delete_pending_for_account(&self.db, account_id).await
    }

    async fn record_resolution(&self, resolution: &ConflictResolution) -> Result<()> {
        queries::conflicts::record_resolution(&self.db, resolution).await
    }

    async fn resolutions(&self) -> Result<Vec<ConflictResolution>> {
        queries::conflicts::list_resolutions(&self.db).await
    }

    async fn set_preference(
        &self,
        conflict_type: ConflictType,
        preference: ConflictPreference,
    ) -> Result<()> {
        queries::conflicts::set_preference(&self.db, conflict_type, preference).await
    }

    async fn preferences(&self) -> Result<Vec<(ConflictType, ConflictPreference)>> {
        queries::conflicts::list_preferences(&self.db).await
    }
}
