//! Sync orchestrator.
//!
//! The [`SyncOrchestrator`] keeps the local document mirror of every
//! connected mailbox current. Each account runs on its own timer and syncs
//! independently of the others; a slow or failing account never blocks the
//! rest.
//!
//! A pass for one account is strictly sequential:
//!
//! ```text
//! connectivity check -> fetch(cursor) -> conflict check -> apply -> advance cursor
//! ```
//!
//! The cursor only moves after every change in the batch has been applied,
//! and applies are upserts keyed by item id, so replaying a batch after a
//! crash is harmless. Failures are classified and either retried with
//! backoff or recorded; they never escape the orchestrator.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    classify_error, classify_provider_error, BatchModeController, ConflictError, ConflictStore,
    Connectivity, Reconciled, RetryPolicy,
};
use crate::config::SyncSettings;
use crate::domain::{
    Account, AccountId, ClassifiedError, ConflictId, ConflictResolution, Cursor, EmailId,
    EmailQuery, MailItem, PendingConflict, ResolutionStrategy, SyncFailure, SyncStatus,
};
use crate::providers::{ChangeSet, ProviderAdapter, ProviderError};
use crate::storage::{DatabaseError, Result as StorageResult};

/// Errors returned by orchestrator operations.
///
/// Sync failures themselves are not errors here; they are recorded and
/// reported through [`SyncReport`] and [`SyncEvent`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// The account was never added or has been removed.
    #[error("account not registered: {0}")]
    UnknownAccount(AccountId),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),

    /// Conflict store error.
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

/// Result type for orchestrator operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Persistence for per-account sync state and failures.
#[async_trait]
pub trait SyncStorage: Send + Sync {
    /// Creates the account's state unless present; returns the stored state.
    async fn ensure_account(&self, account: &Account) -> StorageResult<Account>;

    /// Gets the state for an account.
    async fn account(&self, account_id: &AccountId) -> StorageResult<Option<Account>>;

    /// Gets the state for every account.
    async fn accounts(&self) -> StorageResult<Vec<Account>>;

    /// Updates an account's status.
    async fn set_status(&self, account_id: &AccountId, status: SyncStatus) -> StorageResult<()>;

    /// Stores the new cursor after a successful apply and marks the account synced.
    async fn advance_cursor(
        &self,
        account_id: &AccountId,
        cursor: Option<&Cursor>,
        synced_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Deletes an account's state.
    async fn delete_account(&self, account_id: &AccountId) -> StorageResult<bool>;

    /// Gets one failure. `item_id` is `None` for account-level failures.
    async fn failure(
        &self,
        account_id: &AccountId,
        item_id: Option<&EmailId>,
    ) -> StorageResult<Option<SyncFailure>>;

    /// Lists failures for one account, or for all when `None`.
    async fn failures(&self, account_id: Option<&AccountId>) -> StorageResult<Vec<SyncFailure>>;

    /// Inserts or replaces a failure.
    async fn record_failure(&self, failure: &SyncFailure) -> StorageResult<()>;

    /// Removes one failure.
    async fn clear_failure(
        &self,
        account_id: &AccountId,
        item_id: Option<&EmailId>,
    ) -> StorageResult<bool>;

    /// Removes every failure for an account.
    async fn clear_failures(&self, account_id: &AccountId) -> StorageResult<usize>;
}

/// The local document store mirrored by the orchestrator.
///
/// Writes are per-document atomic upserts. Readers subscribe through the
/// `watch` methods, usually wrapped in a
/// [`BatchedChangeNotifier`](super::BatchedChangeNotifier).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts or replaces an item, keyed by id.
    async fn upsert(&self, item: &MailItem) -> StorageResult<()>;

    /// Gets an item by id, tombstones included.
    async fn find_one(&self, id: &EmailId) -> StorageResult<Option<MailItem>>;

    /// Gets the live items matching `query`.
    async fn find(&self, query: &EmailQuery) -> StorageResult<Vec<MailItem>>;

    /// Streams the item's current value, then its value after each write.
    fn watch_one(&self, id: EmailId) -> BoxStream<'static, Option<MailItem>>;

    /// Streams the query's current result, then its result after each write.
    fn watch(&self, query: EmailQuery) -> BoxStream<'static, Vec<MailItem>>;
}

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Connectivity was known to be down.
    Offline,
    /// A pass for the same account was still running.
    AlreadyRunning,
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Changes applied and cursor advanced.
    Completed,
    /// The pass did not start.
    Skipped(SkipReason),
    /// The pass failed; the failure was recorded.
    Failed(ClassifiedError),
    /// The account was removed or the orchestrator stopped while the pass
    /// was in flight; its results were dropped.
    Discarded,
}

/// Statistics for one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Account synced.
    pub account_id: AccountId,
    /// How the pass ended.
    pub outcome: SyncOutcome,
    /// Changes returned by the provider.
    pub fetched: usize,
    /// Changes written to the document store.
    pub applied: usize,
    /// Conflicts detected.
    pub conflicts: usize,
    /// Conflicts resolved by stored preference.
    pub auto_resolved: usize,
    /// Items skipped after a permanent or exhausted failure.
    pub failed_items: usize,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            outcome: SyncOutcome::Completed,
            fetched: 0,
            applied: 0,
            conflicts: 0,
            auto_resolved: 0,
            failed_items: 0,
            duration_ms: 0,
        }
    }

    /// Returns true if the pass completed.
    pub fn is_success(&self) -> bool {
        self.outcome == SyncOutcome::Completed
    }
}

/// Event emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pass started.
    Started(AccountId),
    /// A pass completed.
    Completed(SyncReport),
    /// A pass was skipped.
    Skipped {
        account_id: AccountId,
        reason: SkipReason,
    },
    /// A pass's results were dropped.
    Discarded(AccountId),
    /// A retry was scheduled.
    RetryScheduled {
        account_id: AccountId,
        attempt: u32,
        delay: Duration,
    },
    /// A failure was recorded. Exhausted and permanent ones need attention.
    FailureRecorded(SyncFailure),
    /// A conflict is waiting for a decision, or a pending one took a newer
    /// server version.
    ConflictDetected(PendingConflict),
    /// A conflict was resolved by stored preference.
    ConflictAutoResolved(ConflictResolution),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassKind {
    /// Runs regardless of orchestrator run state.
    Manual,
    /// Timer driven; dropped once the orchestrator stops.
    Scheduled,
}

struct PassContext {
    account_id: AccountId,
    provider: Arc<dyn ProviderAdapter>,
    generation: u64,
    epoch: u64,
    kind: PassKind,
}

enum PassEnd {
    Applied,
    Discarded,
}

/// A classified pass failure. `item_id` is set when one item failed.
struct PassFailure {
    item_id: Option<EmailId>,
    error: ClassifiedError,
}

impl From<DatabaseError> for PassFailure {
    fn from(err: DatabaseError) -> Self {
        Self {
            item_id: None,
            error: classify_error(&err),
        }
    }
}

impl From<ProviderError> for PassFailure {
    fn from(err: ProviderError) -> Self {
        Self {
            item_id: None,
            error: classify_provider_error(&err),
        }
    }
}

struct AccountEntry {
    provider: Arc<dyn ProviderAdapter>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    retry: Option<(u64, JoinHandle<()>)>,
}

impl AccountEntry {
    fn cancel_retry(&mut self) -> bool {
        match self.retry.take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.cancel_retry();
    }
}

struct Inner {
    storage: Arc<dyn SyncStorage>,
    documents: Arc<dyn DocumentStore>,
    conflicts: Arc<ConflictStore>,
    gate: BatchModeController,
    connectivity: Connectivity,
    settings: SyncSettings,
    policy: RetryPolicy,
    accounts: Mutex<HashMap<AccountId, AccountEntry>>,
    /// Outlive account entries so a re-added account cannot overlap a pass
    /// still running under its old registration.
    pass_locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
    running: AtomicBool,
    epoch: AtomicU64,
    next_id: AtomicU64,
    events: broadcast::Sender<SyncEvent>,
}

/// Builder for [`SyncOrchestrator`].
pub struct SyncOrchestratorBuilder {
    storage: Arc<dyn SyncStorage>,
    documents: Arc<dyn DocumentStore>,
    conflicts: Arc<ConflictStore>,
    settings: SyncSettings,
    gate: Option<BatchModeController>,
    connectivity: Option<Connectivity>,
}

impl SyncOrchestratorBuilder {
    /// Sets scheduling and retry settings.
    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Shares a batch gate with other bulk writers and notifiers.
    pub fn batch_gate(mut self, gate: BatchModeController) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Shares a connectivity signal.
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Builds the orchestrator. Nothing is scheduled until [`SyncOrchestrator::start`].
    pub fn build(self) -> SyncOrchestrator {
        let (events, _) = broadcast::channel(256);
        let policy = self.settings.retry_policy();
        SyncOrchestrator {
            inner: Arc::new(Inner {
                storage: self.storage,
                documents: self.documents,
                conflicts: self.conflicts,
                gate: self.gate.unwrap_or_default(),
                connectivity: self.connectivity.unwrap_or_default(),
                settings: self.settings,
                policy,
                accounts: Mutex::new(HashMap::new()),
                pass_locks: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                events,
            }),
        }
    }
}

/// Multi-account sync coordinator.
///
/// Cheap to clone; clones share the same accounts, timers, and event
/// channel. Must be used from within a tokio runtime.
///
/// # Example
///
/// ```ignore
/// let orchestrator = SyncOrchestrator::builder(storage.clone(), storage.clone(), conflicts)
///     .settings(settings.sync.clone())
///     .batch_gate(gate.clone())
///     .build();
///
/// orchestrator.add_account(account_id.clone(), adapter).await?;
/// orchestrator.start();
///
/// // Manual refresh
/// let report = orchestrator.trigger_sync(&account_id).await?;
/// ```
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Starts building an orchestrator over its collaborators.
    pub fn builder(
        storage: Arc<dyn SyncStorage>,
        documents: Arc<dyn DocumentStore>,
        conflicts: Arc<ConflictStore>,
    ) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            storage,
            documents,
            conflicts,
            settings: SyncSettings::default(),
            gate: None,
            connectivity: None,
        }
    }

    /// Starts scheduling every registered account.
    ///
    /// Each account gets an immediate pass (when `sync_on_start` is set)
    /// and a periodic timer. Calling this while running only logs.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut accounts = inner.lock_accounts();
        if inner.running.swap(true, Ordering::SeqCst) {
            tracing::info!("sync orchestrator already running");
            return;
        }

        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for (account_id, entry) in accounts.iter_mut() {
            inner.arm_timer(account_id, entry, inner.settings.sync_on_start, epoch);
        }
        tracing::info!(accounts = accounts.len(), "sync orchestrator started");
    }

    /// Cancels every timer and pending retry.
    ///
    /// Passes already in flight run to completion but their results are
    /// discarded.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut accounts = inner.lock_accounts();
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        inner.epoch.fetch_add(1, Ordering::SeqCst);
        for entry in accounts.values_mut() {
            entry.cancel_tasks();
        }
        tracing::info!("sync orchestrator stopped");
    }

    /// Returns whether the orchestrator is scheduling passes.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Registers an account and its provider adapter.
    ///
    /// Creates the persisted sync state if absent. If the orchestrator is
    /// running, the first pass is scheduled immediately. Re-adding an
    /// account replaces its adapter; passes started under the previous
    /// registration are discarded.
    pub async fn add_account(
        &self,
        account_id: AccountId,
        provider: Arc<dyn ProviderAdapter>,
    ) -> SyncResult<Account> {
        let inner = &self.inner;
        let account = inner
            .storage
            .ensure_account(&Account::new(account_id.clone(), provider.provider_type()))
            .await?;

        let mut accounts = inner.lock_accounts();
        let mut entry = AccountEntry {
            provider,
            generation: inner.next_id.fetch_add(1, Ordering::SeqCst),
            timer: None,
            retry: None,
        };
        if inner.running.load(Ordering::SeqCst) {
            let epoch = inner.epoch.load(Ordering::SeqCst);
            inner.arm_timer(&account_id, &mut entry, true, epoch);
        }
        if let Some(mut previous) = accounts.insert(account_id.clone(), entry) {
            previous.cancel_tasks();
        }

        tracing::info!(
            account_id = %account_id,
            provider = account.provider.as_str(),
            "account added"
        );
        Ok(account)
    }

    /// Stops scheduling an account and marks it inactive.
    ///
    /// A pass in flight completes but its result is dropped. Returns false
    /// if the account was not registered.
    pub async fn remove_account(&self, account_id: &AccountId) -> SyncResult<bool> {
        let removed = match self.inner.lock_accounts().remove(account_id) {
            Some(mut entry) => {
                entry.cancel_tasks();
                true
            }
            None => false,
        };

        if removed {
            self.inner
                .storage
                .set_status(account_id, SyncStatus::Inactive)
                .await?;
            tracing::info!(account_id = %account_id, "account removed");
        }
        Ok(removed)
    }

    /// Removes an account and destroys its sync state, failures, and
    /// pending conflicts. Conflict audit records are kept.
    pub async fn disconnect_account(&self, account_id: &AccountId) -> SyncResult<()> {
        self.remove_account(account_id).await?;

        let inner = &self.inner;
        inner.storage.delete_account(account_id).await?;
        let failures = inner.storage.clear_failures(account_id).await?;
        let conflicts = inner.conflicts.discard_for_account(account_id).await?;

        tracing::info!(
            account_id = %account_id,
            failures,
            conflicts,
            "account disconnected"
        );
        Ok(())
    }

    /// Runs one pass for the account now, whether or not the orchestrator
    /// is running.
    ///
    /// # Errors
    ///
    /// Only [`SyncError::UnknownAccount`]; sync failures are reported in
    /// the returned [`SyncReport`].
    pub async fn trigger_sync(&self, account_id: &AccountId) -> SyncResult<SyncReport> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.run_pass(account_id, PassKind::Manual, epoch).await
    }

    /// Resolves a pending conflict and writes the chosen version to the
    /// document store.
    ///
    /// Returns `None` if the conflict is unknown, or if `Merged` was asked
    /// for without `merged` data.
    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        strategy: ResolutionStrategy,
        merged: Option<MailItem>,
    ) -> SyncResult<Option<ConflictResolution>> {
        let resolution = self
            .inner
            .conflicts
            .resolve_conflict(id, strategy, merged)
            .await?;

        if let Some(resolution) = &resolution {
            self.inner.write_resolution(resolution).await?;
        }
        Ok(resolution)
    }

    /// Recorded failures for an account.
    pub async fn failures(&self, account_id: &AccountId) -> SyncResult<Vec<SyncFailure>> {
        Ok(self.inner.storage.failures(Some(account_id)).await?)
    }

    /// Discards a recorded failure. `item_id` is `None` for the
    /// account-level failure.
    pub async fn discard_failure(
        &self,
        account_id: &AccountId,
        item_id: Option<&EmailId>,
    ) -> SyncResult<bool> {
        let removed = self.inner.storage.clear_failure(account_id, item_id).await?;
        if removed {
            tracing::info!(account_id = %account_id, item_id = ?item_id, "failure discarded");
        }
        Ok(removed)
    }

    /// Persisted sync state for an account.
    pub async fn status(&self, account_id: &AccountId) -> SyncResult<Option<Account>> {
        Ok(self.inner.storage.account(account_id).await?)
    }

    /// Persisted sync state for every account.
    pub async fn accounts(&self) -> SyncResult<Vec<Account>> {
        Ok(self.inner.storage.accounts().await?)
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// The conflict store passes delegate to.
    pub fn conflicts(&self) -> &Arc<ConflictStore> {
        &self.inner.conflicts
    }

    /// The batch gate held during bulk applies.
    pub fn batch_gate(&self) -> &BatchModeController {
        &self.inner.gate
    }

    /// The connectivity signal checked before each pass.
    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("running", &self.is_running())
            .field("accounts", &self.inner.lock_accounts().len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_accounts(&self) -> MutexGuard<'_, HashMap<AccountId, AccountEntry>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pass_lock(&self, account_id: &AccountId) -> Arc<tokio::sync::Mutex<()>> {
        self.pass_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(account_id.clone())
            .or_default()
            .clone()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Whether a pass's results may still be applied.
    fn is_live(&self, ctx: &PassContext) -> bool {
        let accounts = self.lock_accounts();
        let registered = accounts
            .get(&ctx.account_id)
            .is_some_and(|entry| entry.generation == ctx.generation);
        let scheduled_ok = ctx.kind == PassKind::Manual
            || (self.running.load(Ordering::SeqCst)
                && self.epoch.load(Ordering::SeqCst) == ctx.epoch);
        registered && scheduled_ok
    }

    async fn set_status(&self, account_id: &AccountId, status: SyncStatus) {
        if let Err(e) = self.storage.set_status(account_id, status).await {
            tracing::warn!(account_id = %account_id, status = status.as_str(), "failed to store sync status: {}", e);
        }
    }

    fn arm_timer(
        self: &Arc<Self>,
        account_id: &AccountId,
        entry: &mut AccountEntry,
        immediate: bool,
        epoch: u64,
    ) {
        let weak = Arc::downgrade(self);
        let account_id = account_id.clone();
        let periodic = self.settings.enabled;
        let interval = self.settings.interval().max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            if immediate && !spawn_scheduled_pass(&weak, &account_id, epoch) {
                return;
            }
            if !periodic {
                return;
            }

            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !spawn_scheduled_pass(&weak, &account_id, epoch) {
                    return;
                }
            }
        });

        if let Some(previous) = entry.timer.replace(handle) {
            previous.abort();
        }
    }

    async fn run_pass(
        self: &Arc<Self>,
        account_id: &AccountId,
        kind: PassKind,
        epoch: u64,
    ) -> SyncResult<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::new(account_id.clone());

        let ctx = {
            let accounts = self.lock_accounts();
            let entry = accounts
                .get(account_id)
                .ok_or_else(|| SyncError::UnknownAccount(account_id.clone()))?;
            PassContext {
                account_id: account_id.clone(),
                provider: entry.provider.clone(),
                generation: entry.generation,
                epoch,
                kind,
            }
        };

        if !self.is_live(&ctx) {
            tracing::debug!(account_id = %account_id, "orchestrator stopped, pass dropped");
            report.outcome = SyncOutcome::Discarded;
            self.emit(SyncEvent::Discarded(account_id.clone()));
            return Ok(finish(report, started));
        }

        let Ok(_pass) = self.pass_lock(account_id).try_lock_owned() else {
            tracing::debug!(account_id = %account_id, "pass already running, skipping");
            return Ok(self.skip(report, SkipReason::AlreadyRunning, started));
        };

        // A fresh pass supersedes any pending retry.
        if let Some(entry) = self.lock_accounts().get_mut(account_id) {
            if entry.cancel_retry() {
                tracing::debug!(account_id = %account_id, "pending retry cancelled");
            }
        }

        if !self.connectivity.is_online() {
            tracing::info!(account_id = %account_id, "offline, skipping sync pass");
            self.set_status(account_id, SyncStatus::Offline).await;
            return Ok(self.skip(report, SkipReason::Offline, started));
        }

        self.set_status(account_id, SyncStatus::InProgress).await;
        self.emit(SyncEvent::Started(account_id.clone()));
        tracing::info!(account_id = %account_id, kind = ?kind, "sync pass started");

        report.outcome = match self.execute(&ctx, &mut report).await {
            Ok(PassEnd::Applied) => SyncOutcome::Completed,
            Ok(PassEnd::Discarded) => SyncOutcome::Discarded,
            Err(_) if !self.is_live(&ctx) => SyncOutcome::Discarded,
            Err(failure) => self.handle_failure(&ctx, failure).await,
        };

        let report = finish(report, started);
        match &report.outcome {
            SyncOutcome::Completed => {
                tracing::info!(
                    account_id = %account_id,
                    fetched = report.fetched,
                    applied = report.applied,
                    conflicts = report.conflicts,
                    duration_ms = report.duration_ms,
                    "sync pass completed"
                );
                self.emit(SyncEvent::Completed(report.clone()));
            }
            SyncOutcome::Discarded => {
                tracing::info!(account_id = %account_id, "account no longer active, pass discarded");
                self.emit(SyncEvent::Discarded(account_id.clone()));
            }
            SyncOutcome::Failed(_) | SyncOutcome::Skipped(_) => {}
        }
        Ok(report)
    }

    fn skip(&self, mut report: SyncReport, reason: SkipReason, started: Instant) -> SyncReport {
        report.outcome = SyncOutcome::Skipped(reason);
        self.emit(SyncEvent::Skipped {
            account_id: report.account_id.clone(),
            reason,
        });
        finish(report, started)
    }

    async fn execute(
        &self,
        ctx: &PassContext,
        report: &mut SyncReport,
    ) -> Result<PassEnd, PassFailure> {
        let account_id = &ctx.account_id;
        let cursor = self
            .storage
            .account(account_id)
            .await?
            .and_then(|state| state.cursor);

        let ChangeSet {
            changes,
            next_cursor,
        } = ctx.provider.fetch_changes(cursor).await?;
        report.fetched = changes.len();

        if !self.is_live(ctx) {
            return Ok(PassEnd::Discarded);
        }

        let failed_items: HashSet<EmailId> = self
            .storage
            .failures(Some(account_id))
            .await?
            .into_iter()
            .filter_map(|failure| failure.item_id)
            .collect();

        let _batch = (changes.len() >= self.settings.bulk_threshold.max(1)).then(|| {
            tracing::debug!(account_id = %account_id, changes = changes.len(), "bulk apply");
            self.gate.guard()
        });

        for change in changes {
            // Removal or stop between items drops the rest of the pass.
            if !self.is_live(ctx) {
                tracing::debug!(
                    account_id = %account_id,
                    applied = report.applied,
                    "pass superseded mid-apply"
                );
                return Ok(PassEnd::Discarded);
            }

            let item_id = change.id.clone();
            match self.apply_change(change, report).await {
                Ok(()) => {
                    if failed_items.contains(&item_id) {
                        self.storage
                            .clear_failure(account_id, Some(&item_id))
                            .await?;
                    }
                }
                Err(error) => {
                    let attempt = self.next_attempt(account_id, Some(&item_id)).await;
                    if self.policy.should_retry(&error, attempt) {
                        return Err(PassFailure {
                            item_id: Some(item_id),
                            error,
                        });
                    }
                    // Permanent or exhausted: record it and keep going so
                    // the cursor can advance past the item.
                    self.record_failure(account_id, Some(item_id), error, attempt)
                        .await;
                    report.failed_items += 1;
                }
            }
        }

        if !self.is_live(ctx) {
            return Ok(PassEnd::Discarded);
        }

        self.storage
            .advance_cursor(account_id, next_cursor.as_ref(), Utc::now())
            .await?;
        self.storage.clear_failure(account_id, None).await?;
        Ok(PassEnd::Applied)
    }

    async fn apply_change(
        &self,
        server: MailItem,
        report: &mut SyncReport,
    ) -> Result<(), ClassifiedError> {
        let mut incoming = server;
        incoming.has_local_changes = false;

        let local = self
            .documents
            .find_one(&incoming.id)
            .await
            .map_err(|e| classify_error(&e))?;

        if let Some(local) = local.filter(|item| item.has_local_changes) {
            if let Some(conflict) = PendingConflict::detect(&local, &incoming) {
                report.conflicts += 1;
                return self
                    .handle_conflict(conflict, report)
                    .await
                    .map_err(|e| classify_error(&e));
            }
        }

        self.documents
            .upsert(&incoming)
            .await
            .map_err(|e| classify_error(&e))?;
        report.applied += 1;
        Ok(())
    }

    async fn handle_conflict(
        &self,
        conflict: PendingConflict,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        tracing::info!(
            account_id = %conflict.account_id,
            email_id = %conflict.email_id,
            conflict_type = conflict.conflict_type.as_str(),
            fields = ?conflict.conflicting_fields,
            "conflict detected"
        );

        match self.conflicts.reconcile(conflict).await? {
            Reconciled::AutoResolved(resolution) => {
                self.write_resolution(&resolution).await?;
                report.auto_resolved += 1;
                self.emit(SyncEvent::ConflictAutoResolved(resolution));
            }
            // The local document stays as the user left it until a decision.
            Reconciled::Pending(conflict) => self.emit(SyncEvent::ConflictDetected(conflict)),
        }
        Ok(())
    }

    async fn write_resolution(&self, resolution: &ConflictResolution) -> StorageResult<()> {
        let mut document = resolution.resolved_data.clone();
        // Local and merged data still has to reach the server.
        document.has_local_changes = resolution.strategy != ResolutionStrategy::Server;
        self.documents.upsert(&document).await
    }

    async fn next_attempt(&self, account_id: &AccountId, item_id: Option<&EmailId>) -> u32 {
        match self.storage.failure(account_id, item_id).await {
            Ok(previous) => previous.map_or(1, |failure| failure.attempt.saturating_add(1)),
            Err(e) => {
                tracing::warn!(account_id = %account_id, "failed to read failure record: {}", e);
                1
            }
        }
    }

    async fn record_failure(
        &self,
        account_id: &AccountId,
        item_id: Option<EmailId>,
        error: ClassifiedError,
        attempt: u32,
    ) -> SyncFailure {
        let failure = SyncFailure {
            account_id: account_id.clone(),
            item_id,
            status: self.policy.failure_status(&error, attempt),
            error,
            attempt,
            updated_at: Utc::now(),
        };

        tracing::warn!(
            account_id = %account_id,
            item_id = ?failure.item_id,
            attempt,
            status = failure.status.as_str(),
            kind = ?failure.error.kind,
            http_status = ?failure.error.http_status,
            "sync failure: {}",
            failure.error.message
        );
        if let Err(e) = self.storage.record_failure(&failure).await {
            tracing::error!(account_id = %account_id, "failed to persist sync failure: {}", e);
        }
        self.emit(SyncEvent::FailureRecorded(failure.clone()));
        failure
    }

    async fn handle_failure(self: &Arc<Self>, ctx: &PassContext, failure: PassFailure) -> SyncOutcome {
        let account_id = &ctx.account_id;
        let attempt = self.next_attempt(account_id, failure.item_id.as_ref()).await;
        let recorded = self
            .record_failure(account_id, failure.item_id, failure.error, attempt)
            .await;
        self.set_status(account_id, SyncStatus::Failed).await;

        if self.policy.should_retry(&recorded.error, attempt) {
            let delay = self.policy.backoff(&recorded.error, attempt);
            self.schedule_retry(ctx, attempt, delay);
        }
        SyncOutcome::Failed(recorded.error)
    }

    fn schedule_retry(self: &Arc<Self>, ctx: &PassContext, attempt: u32, delay: Duration) {
        let token = self.next_id.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        let account_id = ctx.account_id.clone();
        let (kind, epoch) = (ctx.kind, ctx.epoch);

        let mut accounts = self.lock_accounts();
        let Some(entry) = accounts.get_mut(&ctx.account_id) else {
            return;
        };

        let task_account = account_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.take_retry(&task_account, token) {
                return;
            }
            if let Err(e) = inner.run_pass(&task_account, kind, epoch).await {
                tracing::debug!(account_id = %task_account, "retry dropped: {}", e);
            }
        });

        if let Some((_, previous)) = entry.retry.replace((token, handle)) {
            previous.abort();
        }
        drop(accounts);

        tracing::info!(
            account_id = %account_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        self.emit(SyncEvent::RetryScheduled {
            account_id,
            attempt,
            delay,
        });
    }

    /// Detaches the retry handle so the retry's own pass does not cancel it.
    fn take_retry(&self, account_id: &AccountId, token: u64) -> bool {
        let mut accounts = self.lock_accounts();
        match accounts.get_mut(account_id) {
            Some(entry) if entry.retry.as_ref().is_some_and(|(t, _)| *t == token) => {
                entry.retry = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let accounts = self.accounts.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in accounts.values_mut() {
            entry.cancel_tasks();
        }
    }
}

/// Spawns a scheduled pass. Returns false once the orchestrator is gone.
fn spawn_scheduled_pass(weak: &Weak<Inner>, account_id: &AccountId, epoch: u64) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let account_id = account_id.clone();
    tokio::spawn(async move {
        if let Err(e) = inner.run_pass(&account_id, PassKind::Scheduled, epoch).await {
            tracing::debug!(account_id = %account_id, "scheduled pass dropped: {}", e);
        }
    });
    true
}

fn finish(mut report: SyncReport, started: Instant) -> SyncReport {
    report.duration_ms = started.elapsed().as_millis() as u64;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ConflictPreference, ConflictType, ErrorKind, FailureStatus, LabelId, ProviderType,
    };
    use crate::providers::MockProviderAdapter;
    use crate::services::ConflictStorage;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    /// In-memory sync storage and document store.
    #[derive(Default)]
    struct MemoryStore {
        accounts: Mutex<HashMap<AccountId, Account>>,
        failures: Mutex<HashMap<(AccountId, Option<EmailId>), SyncFailure>>,
        documents: Mutex<HashMap<EmailId, MailItem>>,
        fail_upserts: Mutex<HashSet<EmailId>>,
        /// Suspends the next upsert until notified.
        hold_upsert: Mutex<Option<Arc<Notify>>>,
        upsert_entered: Notify,
    }

    impl MemoryStore {
        fn document(&self, id: &str) -> Option<MailItem> {
            self.documents.lock().unwrap().get(&EmailId::from(id)).cloned()
        }

        fn put(&self, item: MailItem) {
            self.documents.lock().unwrap().insert(item.id.clone(), item);
        }

        fn cursor(&self, account: &str) -> Option<Cursor> {
            self.accounts
                .lock()
                .unwrap()
                .get(&AccountId::from(account))
                .and_then(|a| a.cursor.clone())
        }
    }

    #[async_trait]
    impl SyncStorage for MemoryStore {
        async fn ensure_account(&self, account: &Account) -> StorageResult<Account> {
            Ok(self
                .accounts
                .lock()
                .unwrap()
                .entry(account.id.clone())
                .or_insert_with(|| account.clone())
                .clone())
        }

        async fn account(&self, account_id: &AccountId) -> StorageResult<Option<Account>> {
            Ok(self.accounts.lock().unwrap().get(account_id).cloned())
        }

        async fn accounts(&self) -> StorageResult<Vec<Account>> {
            Ok(self.accounts.lock().unwrap().values().cloned().collect())
        }

        async fn set_status(&self, account_id: &AccountId, status: SyncStatus) -> StorageResult<()> {
            if let Some(account) = self.accounts.lock().unwrap().get_mut(account_id) {
                account.status = status;
            }
            Ok(())
        }

        async fn advance_cursor(
            &self,
            account_id: &AccountId,
            cursor: Option<&Cursor>,
            synced_at: DateTime<Utc>,
        ) -> StorageResult<()> {
            if let Some(account) = self.accounts.lock().unwrap().get_mut(account_id) {
                if let Some(cursor) = cursor {
                    account.cursor = Some(cursor.clone());
                }
                account.last_sync_at = Some(synced_at);
                account.status = SyncStatus::Success;
            }
            Ok(())
        }

        async fn delete_account(&self, account_id: &AccountId) -> StorageResult<bool> {
            Ok(self.accounts.lock().unwrap().remove(account_id).is_some())
        }

        async fn failure(
            &self,
            account_id: &AccountId,
            item_id: Option<&EmailId>,
        ) -> StorageResult<Option<SyncFailure>> {
            let key = (account_id.clone(), item_id.cloned());
            Ok(self.failures.lock().unwrap().get(&key).cloned())
        }

        async fn failures(&self, account_id: Option<&AccountId>) -> StorageResult<Vec<SyncFailure>> {
            Ok(self
                .failures
                .lock()
                .unwrap()
                .values()
                .filter(|f| account_id.map_or(true, |id| f.account_id == *id))
                .cloned()
                .collect())
        }

        async fn record_failure(&self, failure: &SyncFailure) -> StorageResult<()> {
            let key = (failure.account_id.clone(), failure.item_id.clone());
            self.failures.lock().unwrap().insert(key, failure.clone());
            Ok(())
        }

        async fn clear_failure(
            &self,
            account_id: &AccountId,
            item_id: Option<&EmailId>,
        ) -> StorageResult<bool> {
            let key = (account_id.clone(), item_id.cloned());
            Ok(self.failures.lock().unwrap().remove(&key).is_some())
        }

        async fn clear_failures(&self, account_id: &AccountId) -> StorageResult<usize> {
            let mut failures = self.failures.lock().unwrap();
            let before = failures.len();
            failures.retain(|(id, _), _| id != account_id);
            Ok(before - failures.len())
        }
    }

    #[async_trait]
    impl DocumentStore for MemoryStore {
        async fn upsert(&self, item: &MailItem) -> StorageResult<()> {
            let hold = self.hold_upsert.lock().unwrap().take();
            if let Some(release) = hold {
                self.upsert_entered.notify_one();
                release.notified().await;
            }
            if self.fail_upserts.lock().unwrap().contains(&item.id) {
                return Err(DatabaseError::Corrupt(format!("cannot write {}", item.id)));
            }
            self.put(item.clone());
            Ok(())
        }

        async fn find_one(&self, id: &EmailId) -> StorageResult<Option<MailItem>> {
            Ok(self.documents.lock().unwrap().get(id).cloned())
        }

        async fn find(&self, query: &EmailQuery) -> StorageResult<Vec<MailItem>> {
            Ok(self
                .documents
                .lock()
                .unwrap()
                .values()
                .filter(|item| query.matches(item))
                .cloned()
                .collect())
        }

        fn watch_one(&self, id: EmailId) -> BoxStream<'static, Option<MailItem>> {
            let current = self.documents.lock().unwrap().get(&id).cloned();
            futures::stream::iter([current]).boxed()
        }

        fn watch(&self, query: EmailQuery) -> BoxStream<'static, Vec<MailItem>> {
            let current: Vec<MailItem> = self
                .documents
                .lock()
                .unwrap()
                .values()
                .filter(|item| query.matches(item))
                .cloned()
                .collect();
            futures::stream::iter([current]).boxed()
        }
    }

    /// Conflict storage that keeps nothing beyond the store's own cache.
    #[derive(Default)]
    struct NullConflictStorage {
        resolutions: Mutex<Vec<ConflictResolution>>,
    }

    #[async_trait]
    impl ConflictStorage for NullConflictStorage {
        async fn insert_pending(&self, _: &PendingConflict) -> StorageResult<bool> {
            Ok(true)
        }
        async fn replace_pending(&self, _: &PendingConflict) -> StorageResult<()> {
            Ok(())
        }
        async fn pending_conflicts(&self) -> StorageResult<Vec<PendingConflict>> {
            Ok(Vec::new())
        }
        async fn delete_pending_for_account(&self, _: &AccountId) -> StorageResult<usize> {
            Ok(0)
        }
        async fn record_resolution(&self, resolution: &ConflictResolution) -> StorageResult<()> {
            self.resolutions.lock().unwrap().push(resolution.clone());
            Ok(())
        }
        async fn resolutions(&self) -> StorageResult<Vec<ConflictResolution>> {
            Ok(self.resolutions.lock().unwrap().clone())
        }
        async fn set_preference(&self, _: ConflictType, _: ConflictPreference) -> StorageResult<()> {
            Ok(())
        }
        async fn preferences(&self) -> StorageResult<Vec<(ConflictType, ConflictPreference)>> {
            Ok(Vec::new())
        }
    }

    /// Provider that replays scripted responses and can be held mid-fetch.
    struct ScriptedProvider {
        responses: Mutex<VecDeque<crate::providers::Result<ChangeSet>>>,
        hold: Option<Arc<Notify>>,
        entered: Arc<Notify>,
        cursors: Mutex<Vec<Option<Cursor>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<crate::providers::Result<ChangeSet>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                hold: None,
                entered: Arc::new(Notify::new()),
                cursors: Mutex::new(Vec::new()),
            }
        }

        fn held(mut self, release: Arc<Notify>) -> Self {
            self.hold = Some(release);
            self
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        fn provider_type(&self) -> ProviderType {
            ProviderType::Imap
        }

        async fn fetch_changes(&self, cursor: Option<Cursor>) -> crate::providers::Result<ChangeSet> {
            self.cursors.lock().unwrap().push(cursor);
            self.entered.notify_one();
            if let Some(release) = &self.hold {
                release.notified().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ChangeSet::default()))
        }
    }

    struct Harness {
        orchestrator: SyncOrchestrator,
        store: Arc<MemoryStore>,
        conflicts: Arc<ConflictStore>,
    }

    fn harness(settings: SyncSettings) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let conflicts = Arc::new(ConflictStore::new(Arc::new(NullConflictStorage::default())));
        let orchestrator = SyncOrchestrator::builder(store.clone(), store.clone(), conflicts.clone())
            .settings(settings)
            .build();
        Harness {
            orchestrator,
            store,
            conflicts,
        }
    }

    fn manual_settings() -> SyncSettings {
        SyncSettings {
            sync_on_start: false,
            ..SyncSettings::default()
        }
    }

    fn item(id: &str, account: &str) -> MailItem {
        let mut item = MailItem::new(id, account);
        item.subject = Some(format!("Subject {id}"));
        item.labels = vec![LabelId::from("INBOX")];
        item
    }

    fn unavailable() -> ProviderError {
        ProviderError::Http {
            status: 503,
            retry_after_secs: None,
            message: "Service Unavailable".to_string(),
        }
    }

    fn account(id: &str) -> AccountId {
        AccountId::from(id)
    }

    #[tokio::test]
    async fn offline_pass_skips_before_fetching() {
        let h = harness(manual_settings());
        let mut provider = MockProviderAdapter::new();
        provider.expect_provider_type().return_const(ProviderType::Gmail);
        provider.expect_fetch_changes().never();

        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();
        h.orchestrator.connectivity().set_online(false);

        let report = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::Skipped(SkipReason::Offline));

        let state = h.orchestrator.status(&account("a1")).await.unwrap().unwrap();
        assert_eq!(state.status, SyncStatus::Offline);
    }

    #[tokio::test]
    async fn pass_applies_changes_then_advances_cursor() {
        let h = harness(manual_settings());
        let mut provider = MockProviderAdapter::new();
        provider.expect_provider_type().return_const(ProviderType::Gmail);
        provider
            .expect_fetch_changes()
            .withf(|cursor| cursor.is_none())
            .times(1)
            .returning(|_| Ok(ChangeSet::new(vec![item("e1", "a1"), item("e2", "a1")], "c-1")));
        provider
            .expect_fetch_changes()
            .withf(|cursor| cursor.as_ref().map(Cursor::as_str) == Some("c-1"))
            .times(1)
            .returning(|_| Ok(ChangeSet::new(Vec::new(), "c-2")));

        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();

        let first = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.fetched, 2);
        assert_eq!(first.applied, 2);
        assert_eq!(h.store.cursor("a1"), Some(Cursor::from("c-1")));
        assert!(h.store.document("e1").is_some());

        h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert_eq!(h.store.cursor("a1"), Some(Cursor::from("c-2")));

        let state = h.orchestrator.status(&account("a1")).await.unwrap().unwrap();
        assert_eq!(state.status, SyncStatus::Success);
        assert!(state.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn failed_fetch_keeps_cursor_and_records_failure() {
        let h = harness(manual_settings());
        let mut provider = MockProviderAdapter::new();
        provider.expect_provider_type().return_const(ProviderType::Gmail);
        provider.expect_fetch_changes().returning(|_| {
            Err(ProviderError::Http {
                status: 403,
                retry_after_secs: None,
                message: "Forbidden".to_string(),
            })
        });

        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();
        let mut events = h.orchestrator.subscribe();

        let report = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        match &report.outcome {
            SyncOutcome::Failed(error) => {
                assert_eq!(error.kind, ErrorKind::Permanent);
                assert_eq!(error.http_status, Some(403));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.store.cursor("a1"), None);

        let failures = h.orchestrator.failures(&account("a1")).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status, FailureStatus::Permanent);
        assert_eq!(failures[0].item_id, None);

        // Permanent failures are never retried.
        let mut saw_retry = false;
        while let Ok(event) = events.try_recv() {
            saw_retry |= matches!(event, SyncEvent::RetryScheduled { .. });
        }
        assert!(!saw_retry);

        assert!(h
            .orchestrator
            .discard_failure(&account("a1"), None)
            .await
            .unwrap());
        assert!(h.orchestrator.failures(&account("a1")).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_exhausted() {
        let h = harness(manual_settings());
        let mut provider = MockProviderAdapter::new();
        provider.expect_provider_type().return_const(ProviderType::Gmail);
        provider
            .expect_fetch_changes()
            .times(3)
            .returning(|_| Err(unavailable()));

        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();
        let mut events = h.orchestrator.subscribe();

        h.orchestrator.trigger_sync(&account("a1")).await.unwrap();

        let mut statuses = Vec::new();
        let mut delays = Vec::new();
        while statuses.len() < 3 {
            match events.recv().await.unwrap() {
                SyncEvent::FailureRecorded(failure) => statuses.push((failure.attempt, failure.status)),
                SyncEvent::RetryScheduled { delay, .. } => delays.push(delay),
                _ => {}
            }
        }

        assert_eq!(
            statuses,
            vec![
                (1, FailureStatus::Pending),
                (2, FailureStatus::Pending),
                (3, FailureStatus::Exhausted),
            ]
        );
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);

        // No further retry after exhaustion.
        tokio::time::sleep(Duration::from_secs(600)).await;
        let state = h.orchestrator.status(&account("a1")).await.unwrap().unwrap();
        assert_eq!(state.status, SyncStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_pass_cancels_pending_retry() {
        let h = harness(manual_settings());
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(unavailable()),
            Ok(ChangeSet::new(vec![item("e1", "a1")], "c-1")),
        ]));
        h.orchestrator
            .add_account(account("a1"), provider.clone())
            .await
            .unwrap();

        let failed = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert!(matches!(failed.outcome, SyncOutcome::Failed(_)));

        let recovered = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert!(recovered.is_success());
        assert!(h.orchestrator.failures(&account("a1")).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.cursors.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn content_conflict_waits_for_decision() {
        let h = harness(manual_settings());
        h.conflicts
            .set_preference(ConflictType::Content, ConflictPreference::AlwaysServer)
            .await
            .unwrap();

        let mut local = item("e1", "a1");
        local.subject = Some("My edit".to_string());
        local.has_local_changes = true;
        h.store.put(local.clone());

        let server = item("e1", "a1");
        let provider = ScriptedProvider::new(vec![Ok(ChangeSet::new(vec![server.clone()], "c-1"))]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();

        let report = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.auto_resolved, 0);
        assert_eq!(report.applied, 0);

        // Local edit untouched, conflict pending, cursor still advanced.
        assert_eq!(h.store.document("e1"), Some(local.clone()));
        let pending = h.conflicts.conflicts_for_account(&account("a1")).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].conflict_type, ConflictType::Content);
        assert_eq!(h.store.cursor("a1"), Some(Cursor::from("c-1")));

        let resolution = h
            .orchestrator
            .resolve_conflict(&pending[0].id, ResolutionStrategy::Server, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::Server);
        assert_eq!(h.store.document("e1"), Some(server));
        assert_eq!(h.conflicts.pending_count().await, 0);
    }

    #[tokio::test]
    async fn label_conflict_auto_resolves_by_preference() {
        let h = harness(manual_settings());
        h.conflicts
            .set_preference(ConflictType::Labels, ConflictPreference::AlwaysLocal)
            .await
            .unwrap();

        let mut local = item("e1", "a1");
        local.labels.push(LabelId::from("work"));
        local.has_local_changes = true;
        h.store.put(local.clone());

        let provider = ScriptedProvider::new(vec![Ok(ChangeSet::new(vec![item("e1", "a1")], "c-1"))]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();
        let mut events = h.orchestrator.subscribe();

        let report = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.auto_resolved, 1);

        let stored = h.store.document("e1").unwrap();
        assert_eq!(stored.labels, local.labels);
        assert!(stored.has_local_changes);
        assert_eq!(h.conflicts.resolutions().await.unwrap().len(), 1);
        assert_eq!(h.conflicts.pending_count().await, 0);

        let mut auto_resolved = false;
        while let Ok(event) = events.try_recv() {
            auto_resolved |= matches!(event, SyncEvent::ConflictAutoResolved(_));
        }
        assert!(auto_resolved);
    }

    #[tokio::test]
    async fn merged_resolution_keeps_local_flag() {
        let h = harness(manual_settings());
        let mut local = item("e1", "a1");
        local.subject = Some("Mine".to_string());
        local.has_local_changes = true;
        h.store.put(local);

        let provider = ScriptedProvider::new(vec![Ok(ChangeSet::new(vec![item("e1", "a1")], "c-1"))]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();
        h.orchestrator.trigger_sync(&account("a1")).await.unwrap();

        let conflict = h.conflicts.pending_conflicts().await.remove(0);
        assert!(h
            .orchestrator
            .resolve_conflict(&conflict.id, ResolutionStrategy::Merged, None)
            .await
            .unwrap()
            .is_none());

        let mut merged = conflict.server_version.clone();
        merged.subject = Some("Mine and theirs".to_string());
        h.orchestrator
            .resolve_conflict(&conflict.id, ResolutionStrategy::Merged, Some(merged))
            .await
            .unwrap()
            .unwrap();

        let stored = h.store.document("e1").unwrap();
        assert_eq!(stored.subject.as_deref(), Some("Mine and theirs"));
        assert!(stored.has_local_changes);
    }

    #[tokio::test]
    async fn exhausted_item_failure_does_not_block_cursor() {
        let h = harness(SyncSettings {
            max_retries: 1,
            ..manual_settings()
        });
        h.store.fail_upserts.lock().unwrap().insert(EmailId::from("bad"));

        let provider = ScriptedProvider::new(vec![Ok(ChangeSet::new(
            vec![item("e1", "a1"), item("bad", "a1"), item("e2", "a1")],
            "c-1",
        ))]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();

        let report = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed_items, 1);
        assert_eq!(h.store.cursor("a1"), Some(Cursor::from("c-1")));

        let failures = h.orchestrator.failures(&account("a1")).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].item_id, Some(EmailId::from("bad")));
        assert_eq!(failures[0].status, FailureStatus::Exhausted);
    }

    #[tokio::test]
    async fn retryable_item_failure_aborts_before_cursor() {
        let h = harness(manual_settings());
        h.store.fail_upserts.lock().unwrap().insert(EmailId::from("bad"));

        let provider = ScriptedProvider::new(vec![Ok(ChangeSet::new(
            vec![item("e1", "a1"), item("bad", "a1")],
            "c-1",
        ))]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();

        let report = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert!(matches!(report.outcome, SyncOutcome::Failed(_)));
        assert_eq!(h.store.cursor("a1"), None);

        let failures = h.orchestrator.failures(&account("a1")).await.unwrap();
        assert_eq!(failures[0].item_id, Some(EmailId::from("bad")));
        assert_eq!(failures[0].status, FailureStatus::Pending);
        h.orchestrator.remove_account(&account("a1")).await.unwrap();
    }

    #[tokio::test]
    async fn accounts_sync_independently() {
        let h = harness(manual_settings());
        let release = Arc::new(Notify::new());
        let slow = Arc::new(
            ScriptedProvider::new(vec![Ok(ChangeSet::new(vec![item("s1", "slow")], "c-s"))])
                .held(release.clone()),
        );
        let fast = ScriptedProvider::new(vec![Ok(ChangeSet::new(vec![item("f1", "fast")], "c-f"))]);

        h.orchestrator
            .add_account(account("slow"), slow.clone())
            .await
            .unwrap();
        h.orchestrator
            .add_account(account("fast"), Arc::new(fast))
            .await
            .unwrap();

        let orchestrator = h.orchestrator.clone();
        let in_flight =
            tokio::spawn(async move { orchestrator.trigger_sync(&account("slow")).await });
        slow.entered.notified().await;

        // The slow account is mid-fetch; the fast one is unaffected.
        let fast_report = h.orchestrator.trigger_sync(&account("fast")).await.unwrap();
        assert!(fast_report.is_success());

        // A second pass for the busy account is refused.
        let again = h.orchestrator.trigger_sync(&account("slow")).await.unwrap();
        assert_eq!(again.outcome, SyncOutcome::Skipped(SkipReason::AlreadyRunning));

        release.notify_one();
        let slow_report = in_flight.await.unwrap().unwrap();
        assert!(slow_report.is_success());
        assert!(h.store.document("s1").is_some());
    }

    #[tokio::test]
    async fn removed_account_discards_in_flight_results() {
        let h = harness(manual_settings());
        let release = Arc::new(Notify::new());
        let provider = Arc::new(
            ScriptedProvider::new(vec![Ok(ChangeSet::new(vec![item("e1", "a1")], "c-1"))])
                .held(release.clone()),
        );
        h.orchestrator
            .add_account(account("a1"), provider.clone())
            .await
            .unwrap();

        let orchestrator = h.orchestrator.clone();
        let in_flight = tokio::spawn(async move { orchestrator.trigger_sync(&account("a1")).await });
        provider.entered.notified().await;

        assert!(h.orchestrator.remove_account(&account("a1")).await.unwrap());
        release.notify_one();

        let report = in_flight.await.unwrap().unwrap();
        assert_eq!(report.outcome, SyncOutcome::Discarded);
        assert!(h.store.document("e1").is_none());
        assert_eq!(h.store.cursor("a1"), None);

        let state = h.orchestrator.status(&account("a1")).await.unwrap().unwrap();
        assert_eq!(state.status, SyncStatus::Inactive);

        let err = h.orchestrator.trigger_sync(&account("a1")).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownAccount(_)));
    }

    #[tokio::test]
    async fn removal_mid_apply_stops_remaining_writes() {
        let h = harness(manual_settings());
        let release = Arc::new(Notify::new());
        *h.store.hold_upsert.lock().unwrap() = Some(release.clone());

        let changes = (0..5).map(|i| item(&format!("e{i}"), "a1")).collect();
        let provider = ScriptedProvider::new(vec![Ok(ChangeSet::new(changes, "c-1"))]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();

        let orchestrator = h.orchestrator.clone();
        let in_flight = tokio::spawn(async move { orchestrator.trigger_sync(&account("a1")).await });
        h.store.upsert_entered.notified().await;

        assert!(h.orchestrator.remove_account(&account("a1")).await.unwrap());
        release.notify_one();

        let report = in_flight.await.unwrap().unwrap();
        assert_eq!(report.outcome, SyncOutcome::Discarded);
        // Only the write already under way lands.
        assert_eq!(report.applied, 1);
        assert!(h.store.document("e0").is_some());
        for i in 1..5 {
            assert!(h.store.document(&format!("e{i}")).is_none(), "e{i} written");
        }
        assert_eq!(h.store.cursor("a1"), None);
    }

    #[tokio::test]
    async fn stop_discards_in_flight_scheduled_pass() {
        let h = harness(SyncSettings {
            sync_on_start: true,
            interval_ms: 60_000,
            ..SyncSettings::default()
        });
        let release = Arc::new(Notify::new());
        let provider = Arc::new(
            ScriptedProvider::new(vec![Ok(ChangeSet::new(vec![item("e1", "a1")], "c-1"))])
                .held(release.clone()),
        );
        h.orchestrator
            .add_account(account("a1"), provider.clone())
            .await
            .unwrap();
        let mut events = h.orchestrator.subscribe();

        h.orchestrator.start();
        provider.entered.notified().await;
        h.orchestrator.stop();
        release.notify_one();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("no outcome for the stopped pass")
                .unwrap();
            match event {
                SyncEvent::Discarded(id) => {
                    assert_eq!(id, account("a1"));
                    break;
                }
                SyncEvent::Completed(report) => panic!("stopped pass completed: {report:?}"),
                _ => {}
            }
        }

        assert!(h.store.document("e1").is_none());
        assert_eq!(h.store.cursor("a1"), None);
        assert_eq!(provider.cursors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn newer_server_version_replaces_pending_conflict() {
        let h = harness(manual_settings());
        let mut local = item("e1", "a1");
        local.subject = Some("Mine".to_string());
        local.has_local_changes = true;
        h.store.put(local.clone());

        let mut v1 = item("e1", "a1");
        v1.subject = Some("Server v1".to_string());
        let mut v2 = item("e1", "a1");
        v2.subject = Some("Server v2".to_string());
        let provider = ScriptedProvider::new(vec![
            Ok(ChangeSet::new(vec![v1], "c-1")),
            Ok(ChangeSet::new(vec![v2.clone()], "c-2")),
        ]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();
        let mut events = h.orchestrator.subscribe();

        h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        let first = h.conflicts.conflicts_for_account(&account("a1")).await;
        let report = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(h.store.cursor("a1"), Some(Cursor::from("c-2")));

        let pending = h.conflicts.conflicts_for_account(&account("a1")).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first[0].id);
        assert_eq!(pending[0].server_version, v2);
        assert_eq!(h.store.document("e1"), Some(local));

        let mut detected = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::ConflictDetected(_)) {
                detected += 1;
            }
        }
        assert_eq!(detected, 2);

        h.orchestrator
            .resolve_conflict(&pending[0].id, ResolutionStrategy::Server, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            h.store.document("e1").and_then(|doc| doc.subject),
            Some("Server v2".to_string())
        );
        assert_eq!(h.conflicts.pending_count().await, 0);
    }

    #[tokio::test]
    async fn auto_resolution_clears_earlier_pending_conflict() {
        let h = harness(manual_settings());
        let mut local = item("e1", "a1");
        local.labels.push(LabelId::from("work"));
        local.has_local_changes = true;
        h.store.put(local.clone());

        let provider = ScriptedProvider::new(vec![
            Ok(ChangeSet::new(vec![item("e1", "a1")], "c-1")),
            Ok(ChangeSet::new(vec![item("e1", "a1")], "c-2")),
        ]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();

        h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert_eq!(h.conflicts.pending_count().await, 1);

        h.conflicts
            .set_preference(ConflictType::Labels, ConflictPreference::AlwaysLocal)
            .await
            .unwrap();
        let report = h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert_eq!(report.auto_resolved, 1);

        assert_eq!(h.conflicts.pending_count().await, 0);
        assert_eq!(h.conflicts.resolutions().await.unwrap().len(), 1);
        assert_eq!(h.store.document("e1").map(|doc| doc.labels), Some(local.labels));
    }

    #[tokio::test]
    async fn bulk_pass_holds_batch_gate() {
        let h = harness(SyncSettings {
            bulk_threshold: 3,
            ..manual_settings()
        });
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();
        let _sub = h
            .orchestrator
            .batch_gate()
            .subscribe(move |active| sink.lock().unwrap().push(active));

        let changes = (0..5).map(|i| item(&format!("e{i}"), "a1")).collect();
        let provider = ScriptedProvider::new(vec![
            Ok(ChangeSet::new(changes, "c-1")),
            Ok(ChangeSet::new(vec![item("e9", "a1")], "c-2")),
        ]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();

        h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        h.orchestrator.trigger_sync(&account("a1")).await.unwrap();

        assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
        assert!(!h.orchestrator.batch_gate().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_initial_and_periodic_passes() {
        let h = harness(SyncSettings {
            interval_ms: 60_000,
            ..SyncSettings::default()
        });
        let a1 = Arc::new(ScriptedProvider::new(Vec::new()));
        let a2 = Arc::new(ScriptedProvider::new(Vec::new()));
        h.orchestrator.add_account(account("a1"), a1.clone()).await.unwrap();
        h.orchestrator.add_account(account("a2"), a2.clone()).await.unwrap();
        let mut events = h.orchestrator.subscribe();

        h.orchestrator.start();
        h.orchestrator.start();
        assert!(h.orchestrator.is_running());

        let mut completed = HashSet::new();
        while completed.len() < 2 {
            if let SyncEvent::Completed(report) = events.recv().await.unwrap() {
                completed.insert(report.account_id);
            }
        }

        tokio::time::sleep(Duration::from_millis(60_500)).await;
        assert_eq!(a1.cursors.lock().unwrap().len(), 2);
        assert_eq!(a2.cursors.lock().unwrap().len(), 2);

        h.orchestrator.stop();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(a1.cursors.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn disconnect_destroys_state_but_keeps_audit() {
        let h = harness(manual_settings());
        let mut local = item("e1", "a1");
        local.subject = Some("Edited".to_string());
        local.has_local_changes = true;
        h.store.put(local);

        let provider = ScriptedProvider::new(vec![
            Ok(ChangeSet::new(vec![item("e1", "a1")], "c-1")),
            Err(unavailable()),
        ]);
        h.orchestrator
            .add_account(account("a1"), Arc::new(provider))
            .await
            .unwrap();
        h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        h.orchestrator.trigger_sync(&account("a1")).await.unwrap();
        assert_eq!(h.conflicts.pending_count().await, 1);
        assert_eq!(h.orchestrator.failures(&account("a1")).await.unwrap().len(), 1);

        h.orchestrator.disconnect_account(&account("a1")).await.unwrap();

        assert!(h.orchestrator.status(&account("a1")).await.unwrap().is_none());
        assert!(h.orchestrator.failures(&account("a1")).await.unwrap().is_empty());
        assert_eq!(h.conflicts.pending_count().await, 0);
    }

    #[test]
    fn report_serializes_outcome() {
        let mut report = SyncReport::new(account("a1"));
        report.outcome = SyncOutcome::Skipped(SkipReason::AlreadyRunning);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"]["skipped"], "already_running");
    }
}
