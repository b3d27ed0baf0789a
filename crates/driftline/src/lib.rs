//! # Driftline
//!
//! The unified API for Driftline: real-time state synchronized through a
//! shared, server-ordered log.
//!
//! ## Overview
//!
//! A room on the log service holds any number of keys. Each key is an
//! ordered log of values stamped with server sequence numbers. On top of
//! that log this crate offers:
//!
//! - **Replicated state**: a reducer folded over a key's log, applied
//!   optimistically and compacted once the log grows
//! - **Presence**: ephemeral per-client values with heartbeats and expiry
//! - **Shared values**: one debounced value per key
//! - **Peer sets**: data channels to every other client, negotiated over the
//!   log
//!
//! Where sockets are unavailable, [`HttpConnection`] sends single messages
//! to a room's HTTP endpoint instead.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use driftline::{Room, RoomConfig};
//!
//! # async fn example() -> driftline::Result<()> {
//! let room = Room::websocket(RoomConfig::default());
//! room.connect("wss://example.com/room/abc/connect").await?;
//!
//! let counter = room.reducer(
//!     "counter",
//!     0i64,
//!     |state, delta: &i64| state + delta,
//!     |state| println!("counter is now {state}"),
//! )?;
//! counter.dispatch(1)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `driftline::core` - Keys, sequence values, wire messages, event bus
//! - `driftline::net` - Transports and the reconnecting Connection
//! - `driftline::replica` - Replicated state, presence, shared values
//! - `driftline::rtc` - Signaling, perfect negotiation, peer sets

pub mod error;
pub mod room;

// Re-export component crates
pub use driftline_core as core;
pub use driftline_net as net;
pub use driftline_replica as replica;
pub use driftline_rtc as rtc;

// Re-export main types for convenience
pub use error::{DriftError, Result};
pub use room::{Room, RoomConfig};

// Re-export commonly used types
pub use driftline_core::{
    Action, Encoding, FixedIdentity, IdentityProvider, Key, RandomIdentity, RoomInfo,
    SequenceNumber, SequenceValue, Value,
};
pub use driftline_net::{
    Connection, ConnectionConfig, ConnectionStatus, Delivery, HttpConnection, Subscription,
};
pub use driftline_replica::{
    Compactable, OptimisticReplicator, PresenceBroadcaster, PresenceConfig, PresenceMap,
    Reducer, ReplicatorOptions, StateListener, StateListenerConfig,
};
pub use driftline_rtc::{DataChannelMessage, PeerSetConfig, PeerSetSynchronizer, RtcBackend};
