//! mailsync - A local-first, multi-account mailbox sync engine
//!
//! This crate keeps a local document mirror of several remote mailboxes in
//! step with their providers, including per-account scheduling, retry
//! classification, conflict tracking, and batched change notification.

pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;

pub use services::SyncOrchestrator;
pub use storage::StorageLayer;
