//! Integration tests for batched change notification.
//!
//! These tests wrap live queries from the SQLite storage layer in a
//! [`BatchedChangeNotifier`] and check how many emissions a burst of writes
//! produces with and without the batch gate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use mailsync::config::SyncSettings;
use mailsync::domain::{AccountId, Cursor, EmailId, EmailQuery, MailItem, ProviderType};
use mailsync::providers::{ChangeSet, ProviderAdapter, Result as ProviderResult};
use mailsync::services::{
    BatchModeController, BatchedChangeNotifier, ChangeSubscription, ConflictStore, DocumentStore,
    NotifierConfig, SyncOrchestrator,
};
use mailsync::StorageLayer;

fn config() -> NotifierConfig {
    NotifierConfig {
        debounce: Duration::from_millis(100),
        max_wait: Duration::from_millis(500),
    }
}

fn item(i: usize) -> MailItem {
    let mut item = MailItem::new(format!("e{i}"), "a1");
    item.subject = Some(format!("Message {i}"));
    item
}

/// Reads emissions until one has `expected` items. Returns how many
/// emissions it took.
async fn emissions_until(sub: &mut ChangeSubscription<Vec<MailItem>>, expected: usize) -> usize {
    let mut count = 0;
    loop {
        let batch = tokio::time::timeout(Duration::from_secs(10), sub.recv())
            .await
            .expect("notifier stalled")
            .expect("notifier ended");
        count += 1;
        if batch.len() == expected {
            return count;
        }
    }
}

/// Drains whatever else arrives within `quiet`. Returns the last value seen.
async fn settle(
    sub: &mut ChangeSubscription<Vec<MailItem>>,
    quiet: Duration,
) -> Option<Vec<MailItem>> {
    let mut last = None;
    while let Ok(Some(batch)) = tokio::time::timeout(quiet, sub.recv()).await {
        last = Some(batch);
    }
    last
}

// ============================================================================
// Gate held by the writer
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_under_gate_emits_few_times() {
    let storage = StorageLayer::in_memory().await.unwrap();
    let gate = BatchModeController::new();
    let notifier = BatchedChangeNotifier::new(gate.clone(), config());

    let guard = gate.guard();
    let mut inbox = notifier.wrap(storage.watch(EmailQuery::all()));

    for i in 0..500 {
        storage.upsert(&item(i)).await.unwrap();
    }

    // The full result has to come through the window while the gate is on.
    let emissions = emissions_until(&mut inbox, 500).await;
    assert!(emissions < 10, "{emissions} emissions for 500 writes");
    assert!(gate.is_active());
    drop(guard);

    // Anything after the full result is the same full result.
    if let Some(tail) = settle(&mut inbox, Duration::from_millis(700)).await {
        assert_eq!(tail.len(), 500);
    }
}

#[tokio::test]
async fn single_item_watch_sees_terminal_value() {
    let storage = StorageLayer::in_memory().await.unwrap();
    let gate = BatchModeController::new();
    let notifier = BatchedChangeNotifier::new(gate.clone(), config());

    let mut watched = notifier.wrap(storage.watch_one(EmailId::from("e0")));
    assert_eq!(watched.recv().await.unwrap(), None);

    {
        let _batch = gate.guard();
        for round in 0..20 {
            let mut next = item(0);
            next.snippet = format!("revision {round}");
            storage.upsert(&next).await.unwrap();
        }
    }

    let mut last = None;
    while let Ok(Some(value)) =
        tokio::time::timeout(Duration::from_millis(700), watched.recv()).await
    {
        last = value;
    }
    assert_eq!(last.map(|item| item.snippet), Some("revision 19".to_string()));
}

#[tokio::test]
async fn without_gate_every_change_is_forwarded() {
    let storage = StorageLayer::in_memory().await.unwrap();
    let notifier = BatchedChangeNotifier::new(BatchModeController::new(), config());
    let mut inbox = notifier.wrap(storage.watch(EmailQuery::all()));
    assert!(inbox.recv().await.unwrap().is_empty());

    for i in 0..3 {
        storage.upsert(&item(i)).await.unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), i + 1);
    }
}

// ============================================================================
// Gate held by the orchestrator
// ============================================================================

struct BulkProvider(usize);

#[async_trait]
impl ProviderAdapter for BulkProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Imap
    }

    async fn fetch_changes(&self, _cursor: Option<Cursor>) -> ProviderResult<ChangeSet> {
        Ok(ChangeSet::new((0..self.0).map(item).collect(), "bulk-1"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bulk_pass_is_coalesced_for_subscribers() {
    let storage = StorageLayer::in_memory().await.unwrap().into_arc();
    let gate = BatchModeController::new();
    let notifier = BatchedChangeNotifier::new(gate.clone(), config());

    let conflicts = Arc::new(ConflictStore::new(storage.clone()));
    let sync = SyncOrchestrator::builder(storage.clone(), storage.clone(), conflicts)
        .settings(SyncSettings {
            sync_on_start: false,
            bulk_threshold: 50,
            ..SyncSettings::default()
        })
        .batch_gate(gate.clone())
        .build();
    sync.add_account(AccountId::from("a1"), Arc::new(BulkProvider(300)))
        .await
        .unwrap();

    let mut inbox = notifier.wrap(storage.watch(EmailQuery::all().account("a1")));
    assert!(inbox.recv().await.unwrap().is_empty());

    let report = sync.trigger_sync(&AccountId::from("a1")).await.unwrap();
    assert_eq!(report.applied, 300);
    assert!(!gate.is_active());

    let emissions = emissions_until(&mut inbox, 300).await;
    assert!(emissions < 10, "{emissions} emissions for a 300 item pass");
}
