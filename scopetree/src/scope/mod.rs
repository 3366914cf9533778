//! Scope tree: cooperative cancellation and scoped-value lookup.
//!
//! This module provides:
//! - A process-wide root scope ([`root`])
//! - Immutable key/value bindings chained to a parent ([`with_value`])
//! - Cancellable subtrees with idempotent propagation ([`with_cancel`])
//! - Deadline-driven automatic cancellation ([`with_deadline`],
//!   [`with_timeout`])
//!
//! Cancelling any node recursively cancels and detaches its entire subtree;
//! ancestors and siblings outside that subtree are never affected.

mod factories;
mod handle;
mod node;

pub use factories::{
    cancel, root, with_cancel, with_deadline, with_timeout, with_value, CancelHandle,
};
pub use handle::Scope;
