//! Sync services layer.
//!
//! This module contains the services that keep the local mirror in step
//! with remote mailboxes, coordinating between provider adapters, storage,
//! and domain types.
//!
//! # Architecture
//!
//! ```text
//! Host application (UI, CLI)
//!          |
//!          v
//!    Services Layer  <-- You are here
//!          |
//!          v
//! Infrastructure (Provider adapters, Storage)
//! ```
//!
//! # Services Overview
//!
//! - [`SyncOrchestrator`]: Schedules per-account passes and applies provider deltas
//! - [`ConflictStore`]: Holds divergences between local edits and server versions
//! - [`BatchModeController`]: Reference-counted gate raised during bulk writes
//! - [`BatchedChangeNotifier`]: Coalesces live-query emissions while the gate is up
//! - [`Connectivity`]: Online/offline signal checked before each pass
//! - Error classification: maps raw failures onto the retry taxonomy

mod batch_mode;
mod change_notifier;
mod conflict_service;
mod connectivity;
mod error_classifier;
mod sync_service;

pub use batch_mode::{BatchGuard, BatchModeController, GateSubscription};
pub use change_notifier::{
    BatchWindow, BatchedChangeNotifier, ChangeSubscription, NotifierConfig, WindowPhase,
};
#[cfg(test)]
pub use conflict_service::MockConflictStorage;
pub use conflict_service::{
    ConflictError, ConflictResult, ConflictStorage, ConflictStore, Reconciled,
};
pub use connectivity::Connectivity;
pub use error_classifier::{
    classify_anyhow, classify_error, classify_http_error, classify_message,
    classify_provider_error, classify_reqwest_error, failure_status, should_retry, RetryPolicy,
};
pub use sync_service::{
    DocumentStore, SkipReason, SyncError, SyncEvent, SyncOrchestrator, SyncOrchestratorBuilder,
    SyncOutcome, SyncReport, SyncResult, SyncStorage,
};
