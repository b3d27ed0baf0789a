//! The RTC engine seam.
//!
//! Negotiation logic is written against these traits; the engine itself
//! (SDP generation, ICE, SCTP) lives behind them. [`crate::loopback`]
//! provides an in-process engine.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::signaling::IceCandidate;

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Offer/answer state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Transport state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events on one data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// Events raised by a peer connection.
pub enum PeerEvent {
    /// The engine wants a new offer/answer exchange.
    NegotiationNeeded,
    /// A local candidate was gathered. `None` ends gathering.
    IceCandidate(Option<IceCandidate>),
    ConnectionState(PeerConnectionState),
    /// The remote side opened a data channel.
    DataChannel {
        channel: Arc<dyn DataChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PeerEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            PeerEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            PeerEvent::DataChannel { channel, .. } => f
                .debug_struct("DataChannel")
                .field("label", &channel.label())
                .finish(),
        }
    }
}

/// Creates peer connections.
#[async_trait]
pub trait RtcBackend: Send + Sync {
    /// Create a connection together with its event stream.
    async fn create_peer_connection(
        &self,
    ) -> Result<(Arc<dyn RtcPeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)>;
}

/// One peer connection.
#[async_trait]
pub trait RtcPeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> PeerConnectionState;

    /// Whether a previously raised negotiation request is still wanted.
    ///
    /// Checked before acting on [`PeerEvent::NegotiationNeeded`]: an
    /// exchange completed in the meantime may already have satisfied it.
    fn is_negotiation_needed(&self) -> bool;

    /// Create and apply the appropriate local description: an offer when
    /// stable, an answer when a remote offer is pending.
    async fn set_local_description(&self) -> Result<SessionDescription>;

    /// Apply a remote description. A remote offer received while a local
    /// offer is pending rolls the local offer back.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Request an ICE restart; the engine raises negotiation-needed.
    fn restart_ice(&self);

    /// Open a data channel. Its events arrive on the returned receiver.
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<(Arc<dyn DataChannel>, mpsc::UnboundedReceiver<ChannelEvent>)>;

    fn close(&self);
}

/// Sending half of a data channel.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    fn send(&self, text: &str) -> Result<()>;
}
