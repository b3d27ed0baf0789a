//! Error types for the Room API.

use driftline_core::CoreError;
use driftline_net::NetError;
use driftline_replica::ReplicaError;
use driftline_rtc::RtcError;
use thiserror::Error;

/// Errors that can occur during Room operations.
#[derive(Debug, Error)]
pub enum DriftError {
    /// Encoding or payload error.
    #[error("codec error: {0}")]
    Core(#[from] CoreError),

    /// Connection error.
    #[error("connection error: {0}")]
    Net(#[from] NetError),

    /// Replicated state error.
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),

    /// Peer-to-peer error.
    #[error("rtc error: {0}")]
    Rtc(#[from] RtcError),
}

/// Result type for Room operations.
pub type Result<T> = std::result::Result<T, DriftError>;
