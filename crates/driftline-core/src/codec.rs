//! Frame codec for the wire protocol.
//!
//! Outbound messages are encoded according to the connection's
//! [`Encoding`]. Inbound frames are decoded by sniffing the frame type:
//! binary frames are CBOR, text frames are JSON. A connection therefore
//! accepts either encoding from the server regardless of what it sends.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::Value;

/// Query parameter that asks the server to speak CBOR.
pub const CBOR_QUERY_PARAM: &str = "cbor=true";

/// Encoding used for outbound frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// JSON text frames.
    #[default]
    Json,
    /// CBOR binary frames.
    Cbor,
}

impl Encoding {
    /// Rewrite a socket URL so the server selects this encoding.
    pub fn apply_to_url(&self, url: &str) -> String {
        match self {
            Encoding::Json => url.to_string(),
            Encoding::Cbor if url.contains('?') => format!("{}&{}", url, CBOR_QUERY_PARAM),
            Encoding::Cbor => format!("{}?{}", url, CBOR_QUERY_PARAM),
        }
    }
}

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Length of the frame payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the frame payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a message into a frame.
pub fn encode_frame<T: Serialize>(message: &T, encoding: Encoding) -> Result<Frame> {
    match encoding {
        Encoding::Json => serde_json::to_string(message)
            .map(Frame::Text)
            .map_err(|e| CoreError::EncodingError(e.to_string())),
        Encoding::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(message, &mut buf)
                .map_err(|e| CoreError::EncodingError(e.to_string()))?;
            Ok(Frame::Binary(Bytes::from(buf)))
        }
    }
}

/// Decode a frame, choosing the codec by frame type.
pub fn decode_frame<T: DeserializeOwned>(frame: &Frame) -> Result<T> {
    let decoded = match frame {
        Frame::Text(text) => serde_json::from_str(text).map_err(|e| e.to_string()),
        Frame::Binary(bytes) => ciborium::from_reader(bytes.as_ref()).map_err(|e| e.to_string()),
    };
    decoded.map_err(|error| {
        let kind = match frame {
            Frame::Text(_) => "json",
            Frame::Binary(_) => "cbor",
        };
        debug!(kind, len = frame.len(), %error, "frame not decoded");
        CoreError::DecodingError(error)
    })
}

/// Convert a typed value into a wire payload.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Value::serialized(value).map_err(|e| CoreError::EncodingError(e.to_string()))
}

/// Convert a wire payload into a typed value.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    value
        .deserialized()
        .map_err(|e| CoreError::UnexpectedPayload(e.to_string()))
}
