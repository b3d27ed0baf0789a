//! Error types for the peer-to-peer layer.

use thiserror::Error;

use driftline_core::CoreError;
use driftline_net::NetError;
use driftline_replica::ReplicaError;

/// Errors that can occur while negotiating or using peer connections.
#[derive(Debug, Error)]
pub enum RtcError {
    /// The signaling connection failed.
    #[error("connection error: {0}")]
    Net(#[from] NetError),

    /// A signaling payload could not be converted.
    #[error("payload error: {0}")]
    Codec(#[from] CoreError),

    /// Presence tracking failed.
    #[error("presence error: {0}")]
    Replica(#[from] ReplicaError),

    /// A data channel message was not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The RTC engine rejected an operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// An operation was not valid in the current signaling state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No open data channel to the peer.
    #[error("data channel not open")]
    ChannelNotOpen,

    /// The peer connection was closed.
    #[error("peer connection closed")]
    Closed,
}

/// Result type for peer-to-peer operations.
pub type Result<T> = std::result::Result<T, RtcError>;
