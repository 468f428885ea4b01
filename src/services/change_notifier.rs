//! Change notification shaping.
//!
//! [`BatchedChangeNotifier`] wraps a raw change stream (a document or query
//! subscription) and decides how often downstream consumers hear about it:
//!
//! - gate inactive: every change is forwarded immediately, in order;
//! - gate active: changes are coalesced by a trailing debounce plus a hard
//!   cap, so a burst of N writes produces a bounded number of emissions.
//!
//! The latest observed value is always delivered eventually; only
//! intermediate values are dropped.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::batch_mode::BatchModeController;
use crate::config::NotifierSettings;

/// Timing for batched mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierConfig {
    /// Quiet time required before a batched emission.
    pub debounce: Duration,
    /// Maximum delay of a batched emission under continuous churn.
    pub max_wait: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            max_wait: Duration::from_millis(500),
        }
    }
}

impl From<&NotifierSettings> for NotifierConfig {
    fn from(settings: &NotifierSettings) -> Self {
        Self {
            debounce: Duration::from_millis(settings.debounce_ms),
            max_wait: Duration::from_millis(settings.max_wait_ms),
        }
    }
}

/// Observable phase of a [`BatchWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    /// Nothing pending, no timers armed.
    Idle,
    /// A value is waiting for the debounce or the hard cap.
    PendingDebounce,
    /// The latest value was emitted; the hard-cap window is still open and
    /// new values join it.
    PendingAudit,
}

enum WindowState<T> {
    Idle,
    PendingDebounce {
        latest: T,
        debounce_at: Instant,
        audit_at: Instant,
    },
    PendingAudit {
        audit_at: Instant,
    },
}

/// Timer-driven coalescing state machine used in batched mode.
///
/// The window never owns a timer itself: callers ask for
/// [`next_deadline`](Self::next_deadline), sleep until then, and call
/// [`fire`](Self::fire). A debounce firing and a hard-cap firing that would
/// carry the same value collapse into one emission.
pub struct BatchWindow<T> {
    config: NotifierConfig,
    state: WindowState<T>,
}

impl<T> BatchWindow<T> {
    /// Creates an idle window.
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            config,
            state: WindowState::Idle,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> WindowPhase {
        match self.state {
            WindowState::Idle => WindowPhase::Idle,
            WindowState::PendingDebounce { .. } => WindowPhase::PendingDebounce,
            WindowState::PendingAudit { .. } => WindowPhase::PendingAudit,
        }
    }

    /// Records a new source value observed at `now`.
    pub fn push(&mut self, value: T, now: Instant) {
        let debounce_at = now + self.config.debounce;
        self.state = match std::mem::replace(&mut self.state, WindowState::Idle) {
            WindowState::Idle => WindowState::PendingDebounce {
                latest: value,
                debounce_at,
                audit_at: now + self.config.max_wait,
            },
            WindowState::PendingDebounce { audit_at, .. }
            | WindowState::PendingAudit { audit_at } => WindowState::PendingDebounce {
                latest: value,
                debounce_at,
                audit_at,
            },
        };
    }

    /// Earliest instant at which [`fire`](Self::fire) may change state.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            WindowState::Idle => None,
            WindowState::PendingDebounce {
                debounce_at,
                audit_at,
                ..
            } => Some((*debounce_at).min(*audit_at)),
            WindowState::PendingAudit { audit_at } => Some(*audit_at),
        }
    }

    /// Advances timers to `now`, returning the value to emit, if any.
    pub fn fire(&mut self, now: Instant) -> Option<T> {
        let (next, emitted) = match std::mem::replace(&mut self.state, WindowState::Idle) {
            WindowState::Idle => (WindowState::Idle, None),
            WindowState::PendingDebounce {
                latest,
                debounce_at,
                audit_at,
            } => {
                if now >= audit_at {
                    // Hard cap: emit and close the window. The debounce that
                    // would have carried the same value is dropped with it.
                    (WindowState::Idle, Some(latest))
                } else if now >= debounce_at {
                    (WindowState::PendingAudit { audit_at }, Some(latest))
                } else {
                    (
                        WindowState::PendingDebounce {
                            latest,
                            debounce_at,
                            audit_at,
                        },
                        None,
                    )
                }
            }
            WindowState::PendingAudit { audit_at } => {
                if now >= audit_at {
                    // Nothing new since the debounce emission.
                    (WindowState::Idle, None)
                } else {
                    (WindowState::PendingAudit { audit_at }, None)
                }
            }
        };
        self.state = next;
        emitted
    }

    /// Drops all timers and returns the pending value, if any.
    pub fn flush(&mut self) -> Option<T> {
        match std::mem::replace(&mut self.state, WindowState::Idle) {
            WindowState::PendingDebounce { latest, .. } => Some(latest),
            WindowState::Idle | WindowState::PendingAudit { .. } => None,
        }
    }
}

/// Shapes change streams according to the batch gate.
///
/// # Example
///
/// ```ignore
/// let notifier = BatchedChangeNotifier::new(gate.clone(), NotifierConfig::default());
/// let mut inbox = notifier.wrap(store.watch(EmailQuery::inbox(account_id)));
/// while let Some(items) = inbox.next().await {
///     render(items);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct BatchedChangeNotifier {
    gate: BatchModeController,
    config: NotifierConfig,
}

impl BatchedChangeNotifier {
    /// Creates a notifier bound to `gate`.
    pub fn new(gate: BatchModeController, config: NotifierConfig) -> Self {
        Self { gate, config }
    }

    /// Returns the timing configuration.
    pub fn config(&self) -> NotifierConfig {
        self.config
    }

    /// Wraps `source`. Must be called within a tokio runtime.
    ///
    /// The returned subscription stays valid across gate transitions; the
    /// internal wiring is rebuilt for the new mode without ending the
    /// stream. The stream ends after `source` ends (flushing any pending
    /// value first).
    pub fn wrap<S, T>(&self, source: S) -> ChangeSubscription<T>
    where
        S: Stream<Item = T> + Send + Unpin + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_notifier(source, self.gate.clone(), self.config, tx));
        ChangeSubscription { rx, task }
    }
}

async fn run_notifier<S, T>(
    mut source: S,
    gate: BatchModeController,
    config: NotifierConfig,
    tx: mpsc::UnboundedSender<T>,
) where
    S: Stream<Item = T> + Send + Unpin + 'static,
    T: Send + 'static,
{
    let (gate_tx, mut gate_rx) = mpsc::unbounded_channel();
    let _gate_subscription = gate.subscribe(move |active| {
        let _ = gate_tx.send(active);
    });

    let mut window = BatchWindow::new(config);
    let mut batched = gate.is_active();

    loop {
        let deadline = window.next_deadline();
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            Some(_) = gate_rx.recv() => {
                // Transitions may be reported out of order across threads;
                // the current level is authoritative.
                if !rewire(&gate, &mut batched, &mut window, &tx) {
                    break;
                }
            }
            _ = tx.closed() => break,
            _ = timer => {
                if let Some(value) = window.fire(Instant::now()) {
                    if tx.send(value).is_err() {
                        break;
                    }
                }
            }
            next = source.next() => match next {
                Some(value) => {
                    if !rewire(&gate, &mut batched, &mut window, &tx) {
                        break;
                    }
                    if batched {
                        window.push(value, Instant::now());
                    } else if tx.send(value).is_err() {
                        break;
                    }
                }
                None => {
                    if let Some(value) = window.flush() {
                        let _ = tx.send(value);
                    }
                    break;
                }
            },
        }
    }

    tracing::trace!("change notifier finished");
}

/// Switches wiring when the gate level differs from the current mode.
/// Returns false if the consumer is gone.
fn rewire<T>(
    gate: &BatchModeController,
    batched: &mut bool,
    window: &mut BatchWindow<T>,
    tx: &mpsc::UnboundedSender<T>,
) -> bool {
    let active = gate.is_active();
    if active == *batched {
        return true;
    }

    tracing::debug!(batched = active, "rewiring change notifier");
    *batched = active;
    // Leaving batched mode must not lose the terminal value.
    match window.flush() {
        Some(value) => tx.send(value).is_ok(),
        None => true,
    }
}

/// Downstream side of a wrapped change stream.
///
/// Implements [`Stream`]; dropping it tears down the internal task and the
/// gate subscription.
pub struct ChangeSubscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    task: JoinHandle<()>,
}

impl<T> ChangeSubscription<T> {
    /// Waits for the next emission; `None` once the source has ended.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns an already-delivered emission without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for ChangeSubscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for ChangeSubscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
