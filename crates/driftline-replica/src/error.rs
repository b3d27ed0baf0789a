//! Error types for replicated state.

use thiserror::Error;

use driftline_core::CoreError;
use driftline_net::NetError;

/// Errors that can occur while replicating state.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The underlying connection failed.
    #[error("connection error: {0}")]
    Net(#[from] NetError),

    /// A payload could not be converted.
    #[error("payload error: {0}")]
    Codec(#[from] CoreError),

    /// The replica was destroyed.
    #[error("replica destroyed")]
    Destroyed,
}

/// Result type for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;
