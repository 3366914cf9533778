//! Error types for the scopetree crate.
//!
//! The taxonomy is deliberately small: a scope's terminal state carries a
//! [`CancelCause`], and misuse of the low-level operations is reported to the
//! call site as a [`UsageError`]. Usage faults are never stored in the tree.

use thiserror::Error;

/// The terminal cause stored on a scope once it becomes done.
///
/// Causes are monotonic: the first cause recorded on a scope wins and is
/// never overwritten by a later cancellation or timer fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelCause {
    /// The scope was cancelled explicitly through its cancel handle.
    #[error("scope canceled")]
    Canceled,

    /// The scope's deadline elapsed before any explicit cancellation.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl CancelCause {
    /// Returns true if this cause came from a deadline timer.
    #[must_use]
    pub fn is_deadline_exceeded(self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }
}

/// A programming-usage fault at a call site.
///
/// Usage faults are returned to the caller of the misused operation (and
/// logged at `warn` level); they never propagate into the scope tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// A cancel operation was invoked on a scope kind that cannot be
    /// cancelled (the root scope or a pure value scope).
    #[error("scope of kind '{kind}' is not cancel-capable")]
    NotCancelCapable {
        /// The kind of scope the operation was invoked on.
        kind: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_display() {
        assert_eq!(CancelCause::Canceled.to_string(), "scope canceled");
        assert_eq!(
            CancelCause::DeadlineExceeded.to_string(),
            "deadline exceeded"
        );
    }

    #[test]
    fn test_is_deadline_exceeded() {
        assert!(CancelCause::DeadlineExceeded.is_deadline_exceeded());
        assert!(!CancelCause::Canceled.is_deadline_exceeded());
    }

    #[test]
    fn test_usage_error_display() {
        let err = UsageError::NotCancelCapable { kind: "root" };
        assert_eq!(err.to_string(), "scope of kind 'root' is not cancel-capable");
    }
}
