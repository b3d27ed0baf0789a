//! Wire messages exchanged between a client and the log service.
//!
//! Both directions are internally tagged by a `type` field:
//!
//! ```text
//! client -> server   push{key, value, action} | get{key, seq} | ping{nonce?}
//! server -> client   push{key, value, seq} | init{key, data} | stream_size{key, size}
//!                    | pong{nonce?} | error{message}
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{Key, SequenceNumber, SequenceValue, Value};

/// How a pushed value affects the server-side log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Retain the value at the end of the log.
    Append,

    /// Clear the log and retain only this value.
    Replace,

    /// Deliver to live subscribers only; never retained.
    Relay,

    /// Drop every entry up to and including `seq`, retaining this value as
    /// the new baseline at `seq`.
    Compact { seq: SequenceNumber },
}

impl Action {
    /// Whether the server retains values pushed with this action.
    pub fn is_retained(&self) -> bool {
        !matches!(self, Action::Relay)
    }
}

/// Messages sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageToDb {
    /// Push a value to a key.
    Push {
        key: Key,
        value: Value,
        action: Action,
    },

    /// Request replay of a key starting after `seq` (zero = full replay).
    Get { key: Key, seq: SequenceNumber },

    /// Round-trip latency check.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<u64>,
    },
}

impl MessageToDb {
    /// Construct a push message.
    pub fn push(key: impl Into<Key>, value: Value, action: Action) -> Self {
        MessageToDb::Push {
            key: key.into(),
            value,
            action,
        }
    }

    /// Construct a full-replay request.
    pub fn get(key: impl Into<Key>) -> Self {
        MessageToDb::Get {
            key: key.into(),
            seq: SequenceNumber::ZERO,
        }
    }

    /// The key this message targets, if any.
    pub fn key(&self) -> Option<&Key> {
        match self {
            MessageToDb::Push { key, .. } | MessageToDb::Get { key, .. } => Some(key),
            MessageToDb::Ping { .. } => None,
        }
    }
}

/// Messages sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageFromDb {
    /// A live value on a key.
    Push {
        key: Key,
        value: Value,
        seq: SequenceNumber,
    },

    /// Replay response for a `get`, in sequence order.
    Init { key: Key, data: Vec<SequenceValue> },

    /// Number of entries the server currently retains for a key.
    StreamSize { key: Key, size: usize },

    /// Response to a `ping`.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<u64>,
    },

    /// Server-reported error.
    Error { message: String },
}
