//! Tree nodes and the cancel-propagation algorithm.
//!
//! Edge ownership is inverted relative to the conceptual tree: a child holds
//! a strong reference up its parent chain (value lookup must work at any
//! time), while a parent's children set holds weak down-edges keyed by node
//! id. This keeps detachment O(1) without creating `Arc` cycles.

use crate::errors::{CancelCause, UsageError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{trace, warn};

use super::Scope;

/// A listener invoked exactly once when a scope transitions to done.
pub(crate) type DoneListener = Box<dyn FnOnce() + Send>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique node id.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A node in the scope tree.
pub(crate) struct ScopeInner {
    /// Process-unique id, used as the key in a tracker's children map.
    pub(crate) id: u64,
    /// Strong back-reference for value lookup and liveness forwarding.
    pub(crate) parent: Option<Scope>,
    /// The tagged variant resolving per-kind behavior.
    pub(crate) kind: ScopeKind,
}

/// The kind of a scope node.
pub(crate) enum ScopeKind {
    /// The process-wide root: never done, no values.
    Root,
    /// An immutable single key/value binding.
    Value {
        /// The bound key.
        key: String,
        /// The bound value.
        value: serde_json::Value,
    },
    /// A cancel-capable node.
    Cancel(CancelState),
    /// A cancel-capable node with a fixed expiry.
    Deadline(DeadlineState),
}

impl ScopeInner {
    /// Short name of this node's kind, for diagnostics.
    pub(crate) fn kind_name(&self) -> &'static str {
        match &self.kind {
            ScopeKind::Root => "root",
            ScopeKind::Value { .. } => "value",
            ScopeKind::Cancel(_) => "cancel",
            ScopeKind::Deadline(_) => "deadline",
        }
    }

    /// Returns the cancellation state if this node is cancel-capable.
    pub(crate) fn cancel_state(&self) -> Option<&CancelState> {
        match &self.kind {
            ScopeKind::Cancel(state) => Some(state),
            ScopeKind::Deadline(deadline) => Some(&deadline.cancel),
            ScopeKind::Root | ScopeKind::Value { .. } => None,
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let Some(state) = self.cancel_state() else {
            return;
        };
        // A cancelled node already detached and disarmed its timer.
        if state.is_cancelled() {
            return;
        }
        let timer = state.guarded.lock().timer.take();
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(tracker) = state.tracker.as_ref().and_then(Weak::upgrade) {
            if let Some(tracker_state) = tracker.cancel_state() {
                tracker_state.remove_child(self.id);
            }
        }
    }
}

/// Cancellation state extended with a fixed expiry instant.
pub(crate) struct DeadlineState {
    /// The underlying cancellation state.
    pub(crate) cancel: CancelState,
    /// The instant at which the one-shot timer cancels this node.
    pub(crate) deadline_at: Instant,
}

/// State mutated only under the node-local lock.
struct Guarded {
    /// Terminal cause; `Some` iff the node is done.
    cause: Option<CancelCause>,
    /// Live tracked children, keyed by node id.
    children: HashMap<u64, Weak<ScopeInner>>,
    /// Listeners pending the done transition.
    listeners: Vec<DoneListener>,
    /// Handle to the armed deadline timer, if any.
    timer: Option<AbortHandle>,
}

/// Per-node cancellation state.
///
/// The `cancelled` flag and `cause` are set together under the lock; the
/// flag exists so `is_done` checks stay lock-free.
pub(crate) struct CancelState {
    cancelled: AtomicBool,
    guarded: Mutex<Guarded>,
    done_tx: watch::Sender<bool>,
    /// The nearest cancel-capable ancestor this node registered with.
    tracker: Option<Weak<ScopeInner>>,
}

impl CancelState {
    /// Creates live cancellation state registered (later) with `tracker`.
    pub(crate) fn alive(tracker: Option<Weak<ScopeInner>>) -> Self {
        let (done_tx, _done_rx) = watch::channel(false);
        Self {
            cancelled: AtomicBool::new(false),
            guarded: Mutex::new(Guarded {
                cause: None,
                children: HashMap::new(),
                listeners: Vec::new(),
                timer: None,
            }),
            done_tx,
            tracker,
        }
    }

    /// Creates state for a node that is done at construction time.
    ///
    /// Born-done nodes are never attached to a tracker and never arm a
    /// timer, so there is nothing to detach or disarm later.
    pub(crate) fn done_with(cause: CancelCause) -> Self {
        let (done_tx, _done_rx) = watch::channel(true);
        Self {
            cancelled: AtomicBool::new(true),
            guarded: Mutex::new(Guarded {
                cause: Some(cause),
                children: HashMap::new(),
                listeners: Vec::new(),
                timer: None,
            }),
            done_tx,
            tracker: None,
        }
    }

    /// Returns whether this node has transitioned to done.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the terminal cause, if set.
    pub(crate) fn cause(&self) -> Option<CancelCause> {
        self.guarded.lock().cause
    }

    /// Subscribes to the single-fire done broadcast.
    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Registers a done listener, invoking it immediately if already done.
    pub(crate) fn add_listener(&self, scope_id: u64, listener: DoneListener) {
        let pending = {
            let mut guard = self.guarded.lock();
            if guard.cause.is_some() {
                Some(listener)
            } else {
                guard.listeners.push(listener);
                None
            }
        };
        if let Some(listener) = pending {
            run_listener(scope_id, listener);
        }
    }

    /// Adds a child to the tracked set.
    ///
    /// # Errors
    ///
    /// Returns the terminal cause if this node is already done; the caller
    /// must then cancel the child instead of attaching it.
    pub(crate) fn register_child(&self, child: &Arc<ScopeInner>) -> Result<(), CancelCause> {
        let mut guard = self.guarded.lock();
        match guard.cause {
            Some(cause) => Err(cause),
            None => {
                guard.children.insert(child.id, Arc::downgrade(child));
                Ok(())
            }
        }
    }

    /// Removes a child from the tracked set.
    pub(crate) fn remove_child(&self, id: u64) {
        self.guarded.lock().children.remove(&id);
    }

    /// Stores the deadline timer handle, aborting it if cancellation
    /// already won the race against arming.
    pub(crate) fn arm_timer(&self, timer: AbortHandle) {
        let stale = {
            let mut guard = self.guarded.lock();
            if guard.cause.is_some() {
                Some(timer)
            } else {
                guard.timer = Some(timer);
                None
            }
        };
        if let Some(timer) = stale {
            timer.abort();
        }
    }

    /// Number of live tracked children; prunes dropped entries.
    pub(crate) fn live_children(&self) -> usize {
        let mut guard = self.guarded.lock();
        guard.children.retain(|_, child| child.strong_count() > 0);
        guard.children.len()
    }
}

/// Cancels a node and its entire subtree.
///
/// The transition is idempotent: the first cause wins and later calls are
/// no-ops. Children are cancelled before the node detaches from its own
/// tracker, so a tree walk never observes a done parent with a live
/// attached child. At most one node lock is held at a time.
///
/// # Errors
///
/// Returns [`UsageError::NotCancelCapable`] when invoked on a root or
/// value-only node; the fault is reported here and never enters the tree.
pub(crate) fn cancel_node(inner: &Arc<ScopeInner>, cause: CancelCause) -> Result<(), UsageError> {
    let Some(state) = inner.cancel_state() else {
        let err = UsageError::NotCancelCapable {
            kind: inner.kind_name(),
        };
        warn!(scope_id = inner.id, %err, "ignoring cancel on non-cancellable scope");
        return Err(err);
    };

    let (children, listeners, timer) = {
        let mut guard = state.guarded.lock();
        if guard.cause.is_some() {
            // Already done; the first cause wins.
            return Ok(());
        }
        guard.cause = Some(cause);
        state.cancelled.store(true, Ordering::SeqCst);
        (
            std::mem::take(&mut guard.children),
            std::mem::take(&mut guard.listeners),
            guard.timer.take(),
        )
    };

    trace!(scope_id = inner.id, %cause, "scope cancelled");

    if let Some(timer) = timer {
        timer.abort();
    }

    // The cause is published before the signal, so any listener or waiter
    // that observes the transition also observes the cause.
    state.done_tx.send_replace(true);
    for listener in listeners {
        run_listener(inner.id, listener);
    }

    for (_, child) in children {
        if let Some(child) = child.upgrade() {
            let _ = cancel_node(&child, cause);
        }
    }

    if let Some(tracker) = state.tracker.as_ref().and_then(Weak::upgrade) {
        if let Some(tracker_state) = tracker.cancel_state() {
            tracker_state.remove_child(inner.id);
        }
    }

    Ok(())
}

/// Invokes a done listener, logging and suppressing panics.
pub(crate) fn run_listener(scope_id: u64, listener: DoneListener) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(listener)) {
        warn!(scope_id, "done listener panicked: {panic:?}");
    }
}
