//! # Driftline Core
//!
//! Pure primitives shared by every Driftline layer: keys, server-ordered
//! sequence values, the client/server wire messages, the frame codec, and the
//! in-process keyed event bus.
//!
//! This crate contains no sockets and no timers.
//!
//! ## Key Types
//!
//! - [`Key`] - Identifier of one ordered log
//! - [`SequenceNumber`] - Server-assigned position within a log
//! - [`SequenceValue`] - A value together with its sequence number
//! - [`Action`] - How a pushed value affects the log (append, replace, relay, compact)
//! - [`MessageToDb`] / [`MessageFromDb`] - The wire protocol
//! - [`KeyedEventBus`] - Exact-key publish/subscribe with snapshot dispatch
//!
//! ## Encoding
//!
//! Messages travel as JSON text frames by default, or as CBOR binary frames
//! when [`Encoding::Cbor`] is selected. Inbound frames are decoded by frame
//! type, see [`codec`].

pub mod bus;
pub mod codec;
pub mod error;
pub mod identity;
pub mod messages;
pub mod types;

pub use bus::{KeyedEventBus, Listener, ListenerId, Listeners};
pub use codec::{decode_frame, encode_frame, from_value, to_value, Encoding, Frame};
pub use error::{CoreError, Result};
pub use identity::{FixedIdentity, IdentityProvider, RandomIdentity};
pub use messages::{Action, MessageFromDb, MessageToDb};
pub use types::{Key, RoomInfo, SequenceNumber, SequenceValue, Value};
