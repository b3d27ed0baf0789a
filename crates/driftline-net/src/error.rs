//! Error types for the network layer.

use thiserror::Error;

use driftline_core::CoreError;

/// Errors that can occur on a connection.
#[derive(Debug, Error)]
pub enum NetError {
    /// The transport failed to open or broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CoreError),

    /// The operation requires an open connection.
    #[error("not connected")]
    NotConnected,

    /// The connection was closed before the operation completed.
    #[error("connection closed")]
    Closed,

    /// The HTTP endpoint answered with a non-success status.
    #[error("http error {status}: {reason}")]
    Http { status: u16, reason: String },
}

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, NetError>;
