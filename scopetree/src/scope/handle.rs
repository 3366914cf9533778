//! The public scope handle.

use crate::errors::CancelCause;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::node::{CancelState, ScopeInner, ScopeKind};

/// A handle to a node in the cancellation/value tree.
///
/// Handles are cheap to clone and safe to share across tasks; all tree
/// mutation is serialized on per-node locks internally.
///
/// Liveness queries on value scopes forward to the nearest cancel-capable
/// ancestor, so cancellation remains observable through value-only nodes.
/// Scopes with no cancel-capable ancestor (the root, or value chains hanging
/// directly off it) are never done.
#[derive(Clone)]
pub struct Scope {
    pub(crate) inner: Arc<ScopeInner>,
}

impl Scope {
    pub(crate) fn from_inner(inner: Arc<ScopeInner>) -> Self {
        Self { inner }
    }

    /// Walks the parent chain (self-inclusive) to the nearest
    /// cancel-capable node.
    fn nearest_cancel(&self) -> Option<(&ScopeInner, &CancelState)> {
        let mut cur: &ScopeInner = &self.inner;
        loop {
            if let Some(state) = cur.cancel_state() {
                return Some((cur, state));
            }
            match &cur.parent {
                Some(parent) => cur = &parent.inner,
                None => return None,
            }
        }
    }

    /// Like [`Self::nearest_cancel`] but returns an owned reference, for
    /// callers that need to register against or downgrade the node.
    pub(crate) fn nearest_cancel_arc(&self) -> Option<Arc<ScopeInner>> {
        let mut cur: &Scope = self;
        loop {
            if cur.inner.cancel_state().is_some() {
                return Some(Arc::clone(&cur.inner));
            }
            match &cur.inner.parent {
                Some(parent) => cur = parent,
                None => return None,
            }
        }
    }

    /// Looks up a value by walking the parent chain.
    ///
    /// The innermost binding nearest this scope shadows outer bindings with
    /// the same key. Lookup is independent of cancellation state. O(depth).
    #[must_use]
    pub fn value(&self, key: &str) -> Option<serde_json::Value> {
        let mut cur: &ScopeInner = &self.inner;
        loop {
            if let ScopeKind::Value {
                key: bound,
                value,
            } = &cur.kind
            {
                if bound == key {
                    return Some(value.clone());
                }
            }
            match &cur.parent {
                Some(parent) => cur = &parent.inner,
                None => return None,
            }
        }
    }

    /// Returns whether this scope has transitioned to done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.nearest_cancel()
            .is_some_and(|(_, state)| state.is_cancelled())
    }

    /// Returns the terminal cause, or `None` while the scope is alive.
    #[must_use]
    pub fn cause(&self) -> Option<CancelCause> {
        self.nearest_cancel().and_then(|(_, state)| state.cause())
    }

    /// Completes when this scope transitions to done.
    ///
    /// Completes immediately if the scope is already done. Pends forever on
    /// scopes that can never be done (the root, or value-only chains).
    pub async fn done(&self) {
        let Some((_, state)) = self.nearest_cancel() else {
            std::future::pending::<()>().await;
            return;
        };
        if state.is_cancelled() {
            return;
        }
        let mut done_rx = state.subscribe();
        loop {
            if *done_rx.borrow_and_update() {
                return;
            }
            // The sender lives as long as the node, which we hold.
            if done_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Registers a listener invoked exactly once when this scope becomes
    /// done.
    ///
    /// If the scope is already done the listener runs immediately, with the
    /// cause already visible. Listeners on never-done scopes are dropped.
    /// Panicking listeners are logged and suppressed.
    pub fn on_done<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some((node, state)) = self.nearest_cancel() {
            state.add_listener(node.id, Box::new(listener));
        }
    }

    /// Returns the nearest deadline up the chain, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        let mut cur: &ScopeInner = &self.inner;
        loop {
            if let ScopeKind::Deadline(deadline) = &cur.kind {
                return Some(deadline.deadline_at);
            }
            match &cur.parent {
                Some(parent) => cur = &parent.inner,
                None => return None,
            }
        }
    }

    /// Reports the elapsed time past the nearest deadline.
    ///
    /// Meaningful only once the deadline scope is done with
    /// [`CancelCause::DeadlineExceeded`]; returns `None` otherwise.
    #[must_use]
    pub fn overage(&self) -> Option<Duration> {
        let mut cur: &ScopeInner = &self.inner;
        loop {
            if let ScopeKind::Deadline(deadline) = &cur.kind {
                if deadline.cancel.cause() == Some(CancelCause::DeadlineExceeded) {
                    return Some(Instant::now().saturating_duration_since(deadline.deadline_at));
                }
                return None;
            }
            match &cur.parent {
                Some(parent) => cur = &parent.inner,
                None => return None,
            }
        }
    }

    /// Number of live children tracked by this node.
    ///
    /// Always zero for root and value scopes (they do not track children)
    /// and for cancelled nodes (their children set is drained).
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner
            .cancel_state()
            .map_or(0, CancelState::live_children)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind_name())
            .field("done", &self.is_done())
            .field("cause", &self.cause())
            .finish()
    }
}
