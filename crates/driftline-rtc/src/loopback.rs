//! In-process RTC engine.
//!
//! Peer connections created from the same [`LoopbackNetwork`] find each
//! other through the ids embedded in their session descriptions. Two
//! connections become connected once each holds the other's current
//! description and both are stable; their data channels are then wired
//! together directly.
//!
//! The engine follows the offer/answer state rules closely enough to
//! exercise perfect negotiation: candidates are rejected before a remote
//! description exists, a remote offer rolls back a pending local offer, and
//! negotiation-needed is cleared by any completed exchange.
//!
//! Each [`LoopbackBackend`] acts as one host. An isolated host completes
//! exchanges but its connections fail instead of connecting, the way an
//! unreachable network shows up after ICE.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::backend::{
    ChannelEvent, DataChannel, PeerConnectionState, PeerEvent, RtcBackend, RtcPeerConnection,
    SdpKind, SessionDescription, SignalingState,
};
use crate::error::{Result, RtcError};
use crate::signaling::IceCandidate;

struct Endpoint {
    channel: Arc<LoopbackChannel>,
    linked: bool,
}

struct PeerSlot {
    host: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
    signaling: SignalingState,
    connection: PeerConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    negotiation_needed: bool,
    ice_generation: u32,
    endpoints: Vec<Endpoint>,
    candidates: Vec<IceCandidate>,
    fail_next_local: bool,
}

impl PeerSlot {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn set_connection(&mut self, state: PeerConnectionState) {
        if self.connection != state {
            self.connection = state;
            self.emit(PeerEvent::ConnectionState(state));
        }
    }

    fn request_negotiation(&mut self) {
        if !self.negotiation_needed {
            self.negotiation_needed = true;
            self.emit(PeerEvent::NegotiationNeeded);
        }
    }
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    next_host: u64,
    isolated: HashSet<u64>,
    offers: u64,
    peers: HashMap<u64, PeerSlot>,
}

/// Shared medium for loopback peer connections.
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<NetworkState>,
}

impl fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackNetwork")
            .field("connections", &state.peers.len())
            .field("offers", &state.offers)
            .finish()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A backend creating connections on this network.
    pub fn backend(self: &Arc<Self>) -> LoopbackBackend {
        let host = {
            let mut state = self.state.lock();
            state.next_host += 1;
            state.next_host
        };
        LoopbackBackend {
            network: Arc::clone(self),
            host,
        }
    }

    /// Ids of the open connections, ascending.
    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn connection_state(&self, id: u64) -> Option<PeerConnectionState> {
        self.state.lock().peers.get(&id).map(|slot| slot.connection)
    }

    /// Number of remote candidates accepted by connection `id`.
    pub fn candidates_added(&self, id: u64) -> usize {
        self.state
            .lock()
            .peers
            .get(&id)
            .map_or(0, |slot| slot.candidates.len())
    }

    /// Number of offers created so far.
    pub fn offers_created(&self) -> u64 {
        self.state.lock().offers
    }

    /// Drive connection `id` into the failed state. Every call reports the
    /// failure again, even when the connection already failed.
    pub fn inject_failure(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        match state.peers.get_mut(&id) {
            Some(slot) => {
                debug!(id, "injecting connection failure");
                slot.connection = PeerConnectionState::Failed;
                slot.emit(PeerEvent::ConnectionState(PeerConnectionState::Failed));
                true
            }
            None => false,
        }
    }

    /// Make the next `set_local_description` on connection `id` fail.
    pub fn fail_next_local_description(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        match state.peers.get_mut(&id) {
            Some(slot) => {
                slot.fail_next_local = true;
                true
            }
            None => false,
        }
    }
}

/// [`RtcBackend`] over a [`LoopbackNetwork`].
#[derive(Debug, Clone)]
pub struct LoopbackBackend {
    network: Arc<LoopbackNetwork>,
    host: u64,
}

impl LoopbackBackend {
    pub fn host(&self) -> u64 {
        self.host
    }

    /// Live connections created through this backend.
    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .network
            .state
            .lock()
            .peers
            .iter()
            .filter(|(_, slot)| slot.host == self.host)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Cut this host off (or reconnect it). Exchanges completed while
    /// isolated leave this host's connections failed.
    pub fn set_isolated(&self, isolated: bool) {
        let mut state = self.network.state.lock();
        if isolated {
            state.isolated.insert(self.host);
        } else {
            state.isolated.remove(&self.host);
        }
        debug!(host = self.host, isolated, "loopback host isolation");
    }
}

#[async_trait]
impl RtcBackend for LoopbackBackend {
    async fn create_peer_connection(
        &self,
    ) -> Result<(Arc<dyn RtcPeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.network.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.peers.insert(
                id,
                PeerSlot {
                    host: self.host,
                    events: tx,
                    signaling: SignalingState::Stable,
                    connection: PeerConnectionState::New,
                    local: None,
                    remote: None,
                    negotiation_needed: false,
                    ice_generation: 0,
                    endpoints: Vec::new(),
                    candidates: Vec::new(),
                    fail_next_local: false,
                },
            );
            id
        };
        trace!(id, "loopback connection created");
        let connection = LoopbackPeerConnection {
            id,
            network: Arc::clone(&self.network),
        };
        Ok((Arc::new(connection), rx))
    }
}

/// One loopback peer connection. Closed on drop.
pub struct LoopbackPeerConnection {
    id: u64,
    network: Arc<LoopbackNetwork>,
}

impl fmt::Debug for LoopbackPeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackPeerConnection")
            .field("id", &self.id)
            .finish()
    }
}

impl LoopbackPeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

fn sdp(id: u64, generation: u32, kind: SdpKind) -> String {
    let kind = match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    };
    format!("loopback id={id} gen={generation} {kind}")
}

fn sdp_owner(sdp: &str) -> Option<u64> {
    sdp.split_whitespace()
        .find_map(|token| token.strip_prefix("id="))
        .and_then(|id| id.parse().ok())
}

fn slot_mut(state: &mut NetworkState, id: u64) -> Result<&mut PeerSlot> {
    match state.peers.get_mut(&id) {
        Some(slot) if slot.signaling != SignalingState::Closed => Ok(slot),
        _ => Err(RtcError::Closed),
    }
}

fn same_sdp(a: Option<&SessionDescription>, b: Option<&SessionDescription>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.sdp == b.sdp,
        _ => false,
    }
}

/// Connect `id` with the owner of its remote description if both sides
/// agree on the latest exchange.
fn try_link(state: &mut NetworkState, id: u64) {
    let Some(me) = state.peers.get(&id) else {
        return;
    };
    let Some(other_id) = me.remote.as_ref().and_then(|d| sdp_owner(&d.sdp)) else {
        return;
    };
    let Some(other) = state.peers.get(&other_id) else {
        return;
    };
    let agreed = me.signaling == SignalingState::Stable
        && other.signaling == SignalingState::Stable
        && same_sdp(me.local.as_ref(), other.remote.as_ref())
        && same_sdp(me.remote.as_ref(), other.local.as_ref());
    if !agreed {
        return;
    }

    let cut_off: Vec<u64> = [id, other_id]
        .into_iter()
        .filter(|peer| {
            state
                .peers
                .get(peer)
                .map_or(false, |slot| state.isolated.contains(&slot.host))
        })
        .collect();
    if !cut_off.is_empty() {
        for peer in [id, other_id] {
            if let Some(slot) = state.peers.get_mut(&peer) {
                slot.negotiation_needed = false;
                if cut_off.contains(&peer) {
                    slot.set_connection(PeerConnectionState::Failed);
                }
            }
        }
        debug!(a = id, b = other_id, "loopback exchange completed on isolated host");
        return;
    }

    for (from, to) in [(id, other_id), (other_id, id)] {
        let Some(to_events) = state.peers.get(&to).map(|slot| slot.events.clone()) else {
            continue;
        };
        let Some(slot) = state.peers.get_mut(&from) else {
            continue;
        };
        slot.negotiation_needed = false;
        for endpoint in slot.endpoints.iter_mut().filter(|e| !e.linked) {
            endpoint.linked = true;
            let (channel, events) = endpoint.channel.open_remote_end();
            let _ = to_events.send(PeerEvent::DataChannel { channel, events });
        }
        slot.set_connection(PeerConnectionState::Connected);
    }
    debug!(a = id, b = other_id, "loopback connections linked");
}

#[async_trait]
impl RtcPeerConnection for LoopbackPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        self.network
            .state
            .lock()
            .peers
            .get(&self.id)
            .map_or(SignalingState::Closed, |slot| slot.signaling)
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.network
            .state
            .lock()
            .peers
            .get(&self.id)
            .map_or(PeerConnectionState::Closed, |slot| slot.connection)
    }

    fn is_negotiation_needed(&self) -> bool {
        self.network
            .state
            .lock()
            .peers
            .get(&self.id)
            .map_or(false, |slot| slot.negotiation_needed)
    }

    async fn set_local_description(&self) -> Result<SessionDescription> {
        let mut state = self.network.state.lock();
        let (description, completed) = {
            let slot = slot_mut(&mut state, self.id)?;
            if std::mem::take(&mut slot.fail_next_local) {
                return Err(RtcError::Backend("injected local description failure".into()));
            }
            let generation = slot.ice_generation;
            let (description, completed) = match slot.signaling {
                SignalingState::Stable => {
                    let offer = SessionDescription::offer(sdp(self.id, generation, SdpKind::Offer));
                    slot.signaling = SignalingState::HaveLocalOffer;
                    if slot.connection == PeerConnectionState::New {
                        slot.set_connection(PeerConnectionState::Connecting);
                    }
                    (offer, false)
                }
                SignalingState::HaveLocalOffer => match slot.local.clone() {
                    Some(offer) => (offer, false),
                    None => {
                        return Err(RtcError::InvalidState(
                            "offer pending without description".into(),
                        ))
                    }
                },
                SignalingState::HaveRemoteOffer => {
                    let answer =
                        SessionDescription::answer(sdp(self.id, generation, SdpKind::Answer));
                    slot.signaling = SignalingState::Stable;
                    slot.negotiation_needed = false;
                    if slot.connection == PeerConnectionState::New {
                        slot.set_connection(PeerConnectionState::Connecting);
                    }
                    (answer, true)
                }
                SignalingState::Closed => return Err(RtcError::Closed),
            };
            slot.local = Some(description.clone());
            slot.emit(PeerEvent::IceCandidate(Some(IceCandidate::new(format!(
                "candidate:loopback {} {}",
                self.id, generation
            )))));
            (description, completed)
        };
        if description.kind == SdpKind::Offer {
            state.offers += 1;
        }
        if completed {
            try_link(&mut state, self.id);
        }
        Ok(description)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.network.state.lock();
        let completed = {
            let slot = slot_mut(&mut state, self.id)?;
            match description.kind {
                SdpKind::Offer => {
                    if slot.signaling == SignalingState::HaveLocalOffer {
                        trace!(id = self.id, "rolling back local offer");
                        slot.local = None;
                    }
                    slot.signaling = SignalingState::HaveRemoteOffer;
                    slot.remote = Some(description);
                    false
                }
                SdpKind::Answer => {
                    if slot.signaling != SignalingState::HaveLocalOffer {
                        return Err(RtcError::InvalidState(format!(
                            "answer received in {:?}",
                            slot.signaling
                        )));
                    }
                    slot.signaling = SignalingState::Stable;
                    slot.negotiation_needed = false;
                    slot.remote = Some(description);
                    true
                }
            }
        };
        if completed {
            try_link(&mut state, self.id);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.network.state.lock();
        let slot = slot_mut(&mut state, self.id)?;
        if slot.remote.is_none() {
            return Err(RtcError::InvalidState(
                "candidate received before remote description".into(),
            ));
        }
        slot.candidates.push(candidate);
        Ok(())
    }

    fn restart_ice(&self) {
        let mut state = self.network.state.lock();
        if let Ok(slot) = slot_mut(&mut state, self.id) {
            slot.ice_generation += 1;
            debug!(id = self.id, generation = slot.ice_generation, "ice restart");
            if slot.connection == PeerConnectionState::Failed {
                slot.set_connection(PeerConnectionState::Connecting);
            }
            slot.request_negotiation();
        }
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<(Arc<dyn DataChannel>, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let mut state = self.network.state.lock();
        let slot = slot_mut(&mut state, self.id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(LoopbackChannel::new(label, tx));
        slot.endpoints.push(Endpoint {
            channel: Arc::clone(&channel),
            linked: false,
        });
        // Linked on the next completed exchange.
        slot.request_negotiation();
        Ok((channel, rx))
    }

    fn close(&self) {
        let mut state = self.network.state.lock();
        if let Some(mut slot) = state.peers.remove(&self.id) {
            slot.signaling = SignalingState::Closed;
            for endpoint in &slot.endpoints {
                endpoint.channel.shut();
            }
            slot.set_connection(PeerConnectionState::Closed);
            trace!(id = self.id, "loopback connection closed");
        }
    }
}

impl Drop for LoopbackPeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// One end of a loopback data channel.
pub struct LoopbackChannel {
    label: String,
    open: AtomicBool,
    events: mpsc::UnboundedSender<ChannelEvent>,
    partner: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

impl LoopbackChannel {
    fn new(label: &str, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            events,
            partner: Mutex::new(None),
        }
    }

    /// Open this end and create the matching remote end.
    fn open_remote_end(&self) -> (Arc<dyn DataChannel>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = LoopbackChannel::new(&self.label, tx.clone());
        *remote.partner.lock() = Some(self.events.clone());
        remote.open.store(true, Ordering::SeqCst);

        *self.partner.lock() = Some(tx);
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Open);
        (Arc::new(remote), rx)
    }

    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(partner) = self.partner.lock().take() {
            let _ = partner.send(ChannelEvent::Closed);
        }
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(RtcError::ChannelNotOpen);
        }
        let partner = self.partner.lock();
        match partner.as_ref() {
            Some(partner) if partner.send(ChannelEvent::Message(text.to_string())).is_ok() => {
                Ok(())
            }
            _ => Err(RtcError::ChannelNotOpen),
        }
    }
}
