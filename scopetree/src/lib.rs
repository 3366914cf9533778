//! # Scopetree
//!
//! Cooperative cancellation and scoped-value propagation for trees of
//! related concurrent operations.
//!
//! A caller starts from the shared root scope, derives child scopes for
//! sub-operations, and can cancel an entire subtree (explicitly or via a
//! deadline) without holding references to every spawned task:
//!
//! - **Value scopes**: immutable key/value bindings looked up by walking
//!   the parent chain (innermost binding wins)
//! - **Cancel scopes**: idempotent subtree cancellation with a terminal
//!   cause, propagated to every descendant before `cancel` returns
//! - **Deadline scopes**: a one-shot timer that auto-cancels with
//!   `DeadlineExceeded` unless an explicit cancel wins the race first
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scopetree::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let scope = with_value(&root(), "request_id", "r-42");
//! let (scope, handle) = with_timeout(&scope, Duration::from_secs(5));
//!
//! tokio::spawn({
//!     let scope = scope.clone();
//!     async move {
//!         scope.done().await;
//!         tracing::info!(cause = ?scope.cause(), "work stopped");
//!     }
//! });
//!
//! handle.cancel();
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod errors;
pub mod scope;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::errors::{CancelCause, UsageError};
    pub use crate::scope::{
        cancel, root, with_cancel, with_deadline, with_timeout, with_value, CancelHandle, Scope,
    };
}
