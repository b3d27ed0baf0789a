//! # Driftline RTC
//!
//! Peer-to-peer data channels negotiated over the Driftline log.
//!
//! ## Components
//!
//! - [`PeerSignalingChannel`] - offers, answers and candidates for one pair,
//!   appended to a per-direction key so late joiners replay them
//! - [`NegotiationCore`] / [`PerfectNegotiationPeer`] - collision-free
//!   offer/answer between two peers
//! - [`PeerSetSynchronizer`] - one peer per client announced in presence,
//!   with escalating failure recovery
//! - [`RtcBackend`] - the engine seam; [`loopback`] runs in-process
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use driftline_core::RandomIdentity;
//! use driftline_net::Connection;
//! use driftline_rtc::{loopback::LoopbackNetwork, PeerSetConfig, PeerSetSynchronizer};
//!
//! # async fn example(connection: Connection) -> driftline_rtc::Result<()> {
//! let network = LoopbackNetwork::new();
//! let peers = PeerSetSynchronizer::new(
//!     &connection,
//!     Arc::new(network.backend()),
//!     Arc::new(RandomIdentity::new()),
//!     PeerSetConfig::default(),
//! )?;
//! peers.on_message(|message| println!("{}: {}", message.sender, message.value));
//! peers.send(&serde_json::json!({"cursor": [3, 4]}))?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod loopback;
pub mod negotiation;
pub mod peer_set;
pub mod signaling;

pub use backend::{
    ChannelEvent, DataChannel, PeerConnectionState, PeerEvent, RtcBackend, RtcPeerConnection,
    SdpKind, SessionDescription, SignalingState,
};
pub use config::PeerSetConfig;
pub use error::{Result, RtcError};
pub use negotiation::{
    DataChannelMessage, NegotiationCore, NegotiationPhase, PeerFailure, PeerNotice, PeerOptions,
    PerfectNegotiationPeer, RecoveryAction, RecoveryHook,
};
pub use peer_set::{escalation, Escalation, PeerSetSynchronizer};
pub use signaling::{
    is_polite, signaling_keys, IceCandidate, PeerSignalingChannel, SignalSink, SignalingMessage,
};
