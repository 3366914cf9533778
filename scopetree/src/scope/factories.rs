//! Factory operations that construct scopes and wire them into the tree.

use crate::errors::{CancelCause, UsageError};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use super::node::{cancel_node, next_id, CancelState, DeadlineState, ScopeInner, ScopeKind};
use super::Scope;

static ROOT: OnceLock<Scope> = OnceLock::new();

/// Returns the process-wide root scope.
///
/// The root is immutable and safe to share without synchronization: it is
/// never done, has no cause, and holds no values. Every scope chain
/// terminates here.
#[must_use]
pub fn root() -> Scope {
    ROOT.get_or_init(|| {
        Scope::from_inner(Arc::new(ScopeInner {
            id: next_id(),
            parent: None,
            kind: ScopeKind::Root,
        }))
    })
    .clone()
}

/// Returns a child scope binding `key` to `value`.
///
/// Value scopes have no lifecycle of their own: the parent may be live or
/// already done. Lookup through the new scope shadows outer bindings with
/// the same key; liveness queries forward to the parent chain.
#[must_use]
pub fn with_value(
    parent: &Scope,
    key: impl Into<String>,
    value: impl Into<serde_json::Value>,
) -> Scope {
    Scope::from_inner(Arc::new(ScopeInner {
        id: next_id(),
        parent: Some(parent.clone()),
        kind: ScopeKind::Value {
            key: key.into(),
            value: value.into(),
        },
    }))
}

/// Returns a cancellable child scope and the handle that cancels it.
///
/// The scope registers with the nearest cancel-capable ancestor, so
/// cancelling that ancestor also cancels this scope. If the ancestor is
/// already done, the returned scope is born done with the ancestor's cause.
#[must_use]
pub fn with_cancel(parent: &Scope) -> (Scope, CancelHandle) {
    let scope = new_cancel_node(parent, None);
    let handle = CancelHandle {
        node: Arc::clone(&scope.inner),
    };
    (scope, handle)
}

/// Returns a child scope that auto-cancels at `deadline_at`.
///
/// Whichever of the timer and an explicit cancel happens first wins and
/// disarms the other path; the first cause is never overwritten. A deadline
/// already in the past yields a scope born done with
/// [`CancelCause::DeadlineExceeded`] and no timer is armed.
///
/// Must be called within a Tokio runtime unless the scope is born done.
#[must_use]
pub fn with_deadline(parent: &Scope, deadline_at: Instant) -> (Scope, CancelHandle) {
    let scope = new_cancel_node(parent, Some(deadline_at));
    let handle = CancelHandle {
        node: Arc::clone(&scope.inner),
    };
    (scope, handle)
}

/// Returns a child scope that auto-cancels after `timeout`.
///
/// Equivalent to [`with_deadline`] at `now + timeout`.
#[must_use]
pub fn with_timeout(parent: &Scope, timeout: Duration) -> (Scope, CancelHandle) {
    with_deadline(parent, Instant::now() + timeout)
}

/// Low-level cancel operation on an arbitrary scope.
///
/// Prefer [`CancelHandle::cancel`], which is infallible by construction.
/// This is the escape hatch mirroring the internal propagation step.
///
/// # Errors
///
/// Returns [`UsageError::NotCancelCapable`] when `scope` is the root or a
/// pure value scope; the fault is reported to this call site and never
/// injected into the tree.
pub fn cancel(scope: &Scope, cause: CancelCause) -> Result<(), UsageError> {
    cancel_node(&scope.inner, cause)
}

/// Builds a cancel or deadline node and wires it into the tree.
fn new_cancel_node(parent: &Scope, deadline_at: Option<Instant>) -> Scope {
    let id = next_id();
    let tracker = parent.nearest_cancel_arc();

    // A dead ancestor yields an already-dead child.
    if let Some(cause) = tracker
        .as_ref()
        .and_then(|node| node.cancel_state().and_then(CancelState::cause))
    {
        return born_done(id, parent, deadline_at, cause);
    }
    if let Some(at) = deadline_at {
        if at <= Instant::now() {
            return born_done(id, parent, Some(at), CancelCause::DeadlineExceeded);
        }
    }

    let state = CancelState::alive(tracker.as_ref().map(Arc::downgrade));
    let kind = match deadline_at {
        Some(at) => ScopeKind::Deadline(DeadlineState {
            cancel: state,
            deadline_at: at,
        }),
        None => ScopeKind::Cancel(state),
    };
    let inner = Arc::new(ScopeInner {
        id,
        parent: Some(parent.clone()),
        kind,
    });

    if let Some(tracker) = tracker {
        if let Some(tracker_state) = tracker.cancel_state() {
            if let Err(cause) = tracker_state.register_child(&inner) {
                // The ancestor died between the liveness check and
                // registration; the new node inherits its cause.
                let _ = cancel_node(&inner, cause);
            }
        }
    }

    // The timer is armed only after registration: a fire during
    // construction must find the node already tracked so its detach step
    // removes it. A cancel that wins before arming aborts the stale timer
    // in `arm_timer`.
    if let Some(at) = deadline_at {
        arm_deadline_timer(&inner, at);
    }

    Scope::from_inner(inner)
}

/// Builds a node that is done at construction time.
fn born_done(
    id: u64,
    parent: &Scope,
    deadline_at: Option<Instant>,
    cause: CancelCause,
) -> Scope {
    let state = CancelState::done_with(cause);
    let kind = match deadline_at {
        Some(at) => ScopeKind::Deadline(DeadlineState {
            cancel: state,
            deadline_at: at,
        }),
        None => ScopeKind::Cancel(state),
    };
    Scope::from_inner(Arc::new(ScopeInner {
        id,
        parent: Some(parent.clone()),
        kind,
    }))
}

/// Arms the one-shot deadline timer for `inner`.
///
/// The timer task holds only a weak reference, so it never extends the
/// node's lifetime; a fire after explicit cancellation is a no-op.
fn arm_deadline_timer(inner: &Arc<ScopeInner>, deadline_at: Instant) {
    let weak = Arc::downgrade(inner);
    let task = tokio::spawn(async move {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline_at)).await;
        if let Some(node) = weak.upgrade() {
            let _ = cancel_node(&node, CancelCause::DeadlineExceeded);
        }
    });
    if let Some(state) = inner.cancel_state() {
        state.arm_timer(task.abort_handle());
    }
}

/// Cancels the scope it was created with.
///
/// Handles are `Clone` and may be invoked from any task; only the first
/// invocation (across all clones and the deadline timer) has an effect.
#[derive(Clone)]
pub struct CancelHandle {
    node: Arc<ScopeInner>,
}

impl CancelHandle {
    /// Cancels the scope subtree with [`CancelCause::Canceled`].
    ///
    /// Every descendant's cause is set before this returns. No-op if the
    /// scope is already done.
    pub fn cancel(&self) {
        let _ = cancel_node(&self.node, CancelCause::Canceled);
    }

    /// Cancels the scope subtree with an explicit cause.
    pub fn cancel_with(&self, cause: CancelCause) {
        let _ = cancel_node(&self.node, cause);
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("scope_id", &self.node.id)
            .field(
                "done",
                &self
                    .node
                    .cancel_state()
                    .is_some_and(CancelState::is_cancelled),
            )
            .finish()
    }
}
