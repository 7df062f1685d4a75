//! Outbound delivery error types.

use crate::OutboundStatus;
use thiserror::Error;

/// Outbound delivery error type.
#[derive(Error, Debug)]
pub enum OutboundError {
    /// Durable store failure
    #[error("Store error: {0}")]
    Store(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend rejected the request
    #[error("Backend error (status {status}): {message}")]
    Backend { status: u16, message: String },

    /// Transport-level failure that is not an HTTP error
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The item has nothing that can be sent
    #[error("Missing payload: {0}")]
    MissingPayload(String),

    /// No access token is available for an authenticated request
    #[error("Not authenticated")]
    Unauthenticated,

    /// Unknown outbound item id
    #[error("Outbound item not found: {0}")]
    NotFound(String),

    /// Recovery operation on an item that is not failed
    #[error("Outbound item {id} is {status}, not failed")]
    NotFailed { id: String, status: OutboundStatus },

    /// The send worker has been stopped
    #[error("Send worker is stopped")]
    WorkerStopped,
}

/// Result type alias using OutboundError.
pub type OutboundResult<T> = Result<T, OutboundError>;
