//! Error types for Driftline Core.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
