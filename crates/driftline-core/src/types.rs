//! Strong type definitions for Driftline.
//!
//! Identifiers are newtypes so a key can never be passed where a sequence
//! number is expected.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::codec;
use crate::error::Result;

/// Dynamic payload carried by the wire protocol.
///
/// CBOR's data model is a superset of JSON's, so the same value type
/// represents payloads arriving on either encoding, including raw byte
/// strings on binary connections.
pub use ciborium::value::Value;

/// Identifier of one logical ordered log.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Create a key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Server-assigned position within a key's log.
///
/// Strictly increasing per key. Zero means "nothing confirmed yet" and, in a
/// `get` request, "replay from the beginning".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// The zero sequence number.
    pub const ZERO: Self = Self(0);

    /// Create from a raw value.
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Whether this is the zero sequence number.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(seq: u64) -> Self {
        Self(seq)
    }
}

/// A value in a log together with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceValue {
    pub value: Value,
    pub seq: SequenceNumber,
}

impl SequenceValue {
    /// Create a sequence value.
    pub fn new(value: Value, seq: impl Into<SequenceNumber>) -> Self {
        Self {
            value,
            seq: seq.into(),
        }
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        codec::from_value(&self.value)
    }
}

/// Room descriptor returned by the room bootstrap API.
///
/// Only `socket_url` is consumed by the client core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// The room name.
    pub room: String,
    /// WebSocket endpoint for the room.
    pub socket_url: String,
    /// HTTP endpoint accepting single messages for the room.
    pub http_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_debug() {
        let key = Key::new("counter");
        assert_eq!(format!("{}", key), "counter");
        assert_eq!(format!("{:?}", key), "Key(\"counter\")");
    }

    #[test]
    fn test_key_serializes_as_plain_string() {
        let json = serde_json::to_string(&Key::from("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }

    #[test]
    fn test_sequence_number_ordering() {
        assert!(SequenceNumber(1) < SequenceNumber(2));
        assert!(SequenceNumber::ZERO.is_zero());
        assert!(!SequenceNumber::new(7).is_zero());
    }

    #[test]
    fn test_sequence_value_decode() {
        let sv = SequenceValue::new(Value::Text("hello".into()), 3);
        let decoded: String = sv.decode().unwrap();
        assert_eq!(decoded, "hello");
        assert_eq!(sv.seq, SequenceNumber(3));
    }

    #[test]
    fn test_room_info_from_json() {
        let info: RoomInfo = serde_json::from_str(concat!(
            r#"{"room":"r1","socket_url":"ws://h/room/r1/connect","#,
            r#""http_url":"http://h/room/r1/send"}"#,
        ))
        .unwrap();
        assert_eq!(info.room, "r1");
        assert_eq!(info.socket_url, "ws://h/room/r1/connect");
        assert_eq!(info.http_url, "http://h/room/r1/send");
    }
}
