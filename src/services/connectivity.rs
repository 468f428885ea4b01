//! Network reachability signal.
//!
//! The host application feeds reachability changes in; the orchestrator
//! reads the current value before every network call.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared online/offline flag.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    /// Creates a signal with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Records a reachability change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "connectivity changed");
        }
    }

    /// Returns the last known state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribes to changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
