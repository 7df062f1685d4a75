//! Multiplexer error types.

use thiserror::Error;

/// Realtime error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// The change-feed transport rejected an operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// A change notification could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The multiplexer owner task is no longer running
    #[error("Multiplexer stopped")]
    Stopped,
}

/// Result type alias using RealtimeError.
pub type RealtimeResult<T> = Result<T, RealtimeError>;
