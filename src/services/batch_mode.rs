//! Reference-counted batch mode gate.
//!
//! Independent bulk operations (an initial sync, a bulk user action queue)
//! each hold the gate while they mutate many documents. Subscribers hear
//! about the edges only: "on" when the first holder enters, "off" when the
//! last holder exits.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct GateState {
    depth: usize,
    listeners: BTreeMap<u64, Listener>,
}

struct Inner {
    state: Mutex<GateState>,
    next_listener_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        // A panicking listener never runs while the lock is held, so the
        // state cannot be left half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Gate signaling "bulk mutation in progress".
///
/// Cheap to clone; clones share the same counter. Construct one per
/// orchestrator (or per application) and hand it to the consumers that need
/// it.
///
/// # Example
///
/// ```ignore
/// let gate = BatchModeController::new();
/// let _sub = gate.subscribe(|active| tracing::info!(active, "batch mode"));
///
/// let guard = gate.guard();
/// // ... many writes ...
/// drop(guard);
/// ```
#[derive(Clone)]
pub struct BatchModeController {
    inner: Arc<Inner>,
}

impl Default for BatchModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchModeController {
    /// Creates an inactive gate with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(GateState::default()),
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a holder. Notifies subscribers on the 0 → 1 transition.
    pub fn enter(&self) {
        let listeners = {
            let mut state = self.inner.lock();
            state.depth += 1;
            if state.depth != 1 {
                return;
            }
            snapshot(&state)
        };
        tracing::debug!("batch mode on");
        notify(&listeners, true);
    }

    /// Releases a holder. Notifies subscribers on the 1 → 0 transition.
    ///
    /// Extra calls while the gate is already inactive are ignored.
    pub fn exit(&self) {
        let listeners = {
            let mut state = self.inner.lock();
            if state.depth == 0 {
                tracing::warn!("batch mode exit without matching enter");
                return;
            }
            state.depth -= 1;
            if state.depth != 0 {
                return;
            }
            snapshot(&state)
        };
        tracing::debug!("batch mode off");
        notify(&listeners, false);
    }

    /// Returns true while at least one holder is inside.
    pub fn is_active(&self) -> bool {
        self.inner.lock().depth > 0
    }

    /// Number of current holders.
    pub fn depth(&self) -> usize {
        self.inner.lock().depth
    }

    /// Enters the gate and returns a guard that exits it on drop.
    pub fn guard(&self) -> BatchGuard {
        self.enter();
        BatchGuard { gate: self.clone() }
    }

    /// Registers a transition listener.
    ///
    /// The listener receives `true` when batch mode turns on and `false`
    /// when it turns off. It is called outside the gate's lock, so it may
    /// call back into the gate. Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, listener: F) -> GateSubscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().listeners.insert(id, Arc::new(listener));
        GateSubscription {
            gate: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }
}

impl std::fmt::Debug for BatchModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("BatchModeController")
            .field("depth", &state.depth)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

fn snapshot(state: &GateState) -> Vec<Listener> {
    state.listeners.values().cloned().collect()
}

fn notify(listeners: &[Listener], active: bool) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| (listener.as_ref())(active))).is_err() {
            tracing::warn!(active, "batch mode listener panicked");
        }
    }
}

/// Holds the gate until dropped.
#[must_use = "dropping the guard exits batch mode immediately"]
pub struct BatchGuard {
    gate: BatchModeController,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.gate.exit();
    }
}

/// Handle returned by [`BatchModeController::subscribe`].
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct GateSubscription {
    gate: std::sync::Weak<Inner>,
    id: Option<u64>,
}

impl GateSubscription {
    /// Removes the listener now.
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let (Some(id), Some(inner)) = (self.id.take(), self.gate.upgrade()) {
            inner.lock().listeners.remove(&id);
        }
    }
}

impl Drop for GateSubscription {
    fn drop(&mut self) {
        self.remove();
    }
}
