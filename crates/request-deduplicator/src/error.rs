//! Error types for the request deduplicator.

use thiserror::Error;

/// Outcome delivered to every caller attached to an in-flight key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DedupError<E> {
    /// The wrapped operation itself failed.
    #[error("operation failed: {0}")]
    Operation(E),

    /// The in-flight operation was cancelled via `cancel` or `cancel_all`.
    #[error("request was cancelled")]
    Cancelled,

    /// The ledger owner task is gone.
    #[error("request deduplicator is closed")]
    Closed,
}

impl<E> DedupError<E> {
    /// Returns true when the failure is a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DedupError::Cancelled)
    }
}

/// Result type alias for deduplicated fetches.
pub type DedupResult<T, E> = Result<T, DedupError<E>>;
