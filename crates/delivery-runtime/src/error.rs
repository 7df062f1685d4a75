//! Runtime error types.

use client_config_and_utils::CoreError;
use outbound_send_worker::OutboundError;
use outbound_store_sqlite::StoreError;
use realtime_subscription_multiplexer::RealtimeError;
use thiserror::Error;

/// Runtime error type.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration or path error
    #[error(transparent)]
    Config(#[from] CoreError),

    /// Outbound store could not be opened
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Send worker or delivery transport error
    #[error(transparent)]
    Outbound(#[from] OutboundError),

    /// Subscription multiplexer error
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

/// Result type alias using RuntimeError.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
