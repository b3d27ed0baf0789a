//! Perfect negotiation.
//!
//! Both sides of a pair may offer at any time. When offers collide the
//! impolite side ignores the incoming offer and the polite side rolls its own
//! back and answers. Politeness is fixed per pair by comparing ids, so
//! exactly one side yields.
//!
//! [`NegotiationCore`] holds the rules; [`PerfectNegotiationPeer`] drives a
//! core from one task fed by the peer connection's events, the signaling
//! channel and the inbound data channel.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use driftline_net::Connection;

use crate::backend::{
    ChannelEvent, DataChannel, PeerConnectionState, PeerEvent, RtcBackend, RtcPeerConnection,
    SdpKind, SessionDescription, SignalingState,
};
use crate::error::{Result, RtcError};
use crate::signaling::{is_polite, IceCandidate, PeerSignalingChannel, SignalSink, SignalingMessage};

/// Offer/answer rules for one side of a pair.
pub struct NegotiationCore {
    local_id: String,
    remote_id: String,
    polite: bool,
    connection: Arc<dyn RtcPeerConnection>,
    signals: Arc<dyn SignalSink>,
    making_offer: AtomicBool,
    ignore_offer: AtomicBool,
}

impl fmt::Debug for NegotiationCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationCore")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("polite", &self.polite)
            .finish()
    }
}

impl NegotiationCore {
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        connection: Arc<dyn RtcPeerConnection>,
        signals: Arc<dyn SignalSink>,
    ) -> Self {
        let local_id = local_id.into();
        let remote_id = remote_id.into();
        Self {
            polite: is_polite(&local_id, &remote_id),
            local_id,
            remote_id,
            connection,
            signals,
            making_offer: AtomicBool::new(false),
            ignore_offer: AtomicBool::new(false),
        }
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn peer_connection(&self) -> &Arc<dyn RtcPeerConnection> {
        &self.connection
    }

    /// React to a negotiation-needed event.
    ///
    /// Returns whether an offer was sent. Nothing is sent when the request
    /// was already satisfied, or when the local description turned out to be
    /// an answer because a remote offer arrived first.
    pub async fn handle_negotiation_needed(&self) -> Result<bool> {
        if !self.connection.is_negotiation_needed() {
            trace!(remote = %self.remote_id, "negotiation no longer needed");
            return Ok(false);
        }
        self.making_offer.store(true, Ordering::SeqCst);
        let result = self.make_offer().await;
        self.making_offer.store(false, Ordering::SeqCst);
        result
    }

    async fn make_offer(&self) -> Result<bool> {
        let description = self.connection.set_local_description().await?;
        if description.kind != SdpKind::Offer {
            debug!(remote = %self.remote_id, "local description is not an offer; not sending");
            return Ok(false);
        }
        debug!(remote = %self.remote_id, "sending offer");
        self.signals
            .send_signal(&SignalingMessage::Offer { sdp: description.sdp })?;
        Ok(true)
    }

    /// Apply one inbound signaling message.
    pub async fn handle_signal(&self, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::Offer { sdp } => {
                let collision = self.making_offer.load(Ordering::SeqCst)
                    || self.connection.signaling_state() != SignalingState::Stable;
                let ignore = !self.polite && collision;
                self.ignore_offer.store(ignore, Ordering::SeqCst);
                if ignore {
                    debug!(remote = %self.remote_id, "ignoring colliding offer");
                    return Ok(());
                }
                self.connection
                    .set_remote_description(SessionDescription::offer(sdp))
                    .await?;
                let answer = self.connection.set_local_description().await?;
                debug!(remote = %self.remote_id, rollback = collision, "sending answer");
                self.signals
                    .send_signal(&SignalingMessage::Answer { sdp: answer.sdp })
            }
            SignalingMessage::Answer { sdp } => {
                self.connection
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await
            }
            SignalingMessage::Candidate { candidate: None } => Ok(()),
            SignalingMessage::Candidate {
                candidate: Some(candidate),
            } => match self.connection.add_ice_candidate(candidate).await {
                Err(e) if self.ignore_offer.load(Ordering::SeqCst) => {
                    trace!(
                        remote = %self.remote_id,
                        error = %e,
                        "candidate for ignored offer dropped"
                    );
                    Ok(())
                }
                other => other,
            },
        }
    }

    /// Forward a locally gathered candidate.
    pub fn send_candidate(&self, candidate: Option<IceCandidate>) -> Result<()> {
        self.signals
            .send_signal(&SignalingMessage::Candidate { candidate })
    }
}

/// Lifecycle of a [`PerfectNegotiationPeer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

/// A JSON message received from a peer's data channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChannelMessage {
    /// Ephemeral id of the sending peer.
    pub sender: String,
    pub value: serde_json::Value,
    pub received_at: Instant,
}

/// Why a peer connection needs recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFailure {
    /// The transport reported failure.
    Connection,
    /// Applying a description or candidate failed.
    Negotiation(String),
}

impl fmt::Display for PeerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerFailure::Connection => f.write_str("connection failed"),
            PeerFailure::Negotiation(e) => write!(f, "negotiation failed: {e}"),
        }
    }
}

/// What a peer does after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    RestartIce,
    Close,
    /// Leave the connection as is; the hook arranged recovery elsewhere.
    Ignore,
}

/// Decides how a failed peer recovers. Receives the remote id and the
/// peer's serial.
pub type RecoveryHook = Arc<dyn Fn(&str, u64, &PeerFailure) -> RecoveryAction + Send + Sync>;

/// Notifications from a running peer.
#[derive(Debug, Clone)]
pub enum PeerNotice {
    Phase {
        remote_id: String,
        serial: u64,
        phase: NegotiationPhase,
    },
    Message(DataChannelMessage),
}

/// Options for [`PerfectNegotiationPeer::start`].
#[derive(Clone)]
pub struct PeerOptions {
    pub recovery: RecoveryHook,
    pub notices: Option<mpsc::UnboundedSender<PeerNotice>>,
    /// Leading-edge throttle on inbound data channel messages.
    pub throttle: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            recovery: Arc::new(|_, _, _| RecoveryAction::RestartIce),
            notices: None,
            throttle: Duration::ZERO,
        }
    }
}

impl fmt::Debug for PeerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerOptions")
            .field("notices", &self.notices.is_some())
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

struct PeerShared {
    remote_id: String,
    serial: u64,
    phase: Mutex<NegotiationPhase>,
    outbound: Mutex<Option<Arc<dyn DataChannel>>>,
    notices: Option<mpsc::UnboundedSender<PeerNotice>>,
}

impl PeerShared {
    fn notify(&self, notice: PeerNotice) {
        if let Some(notices) = &self.notices {
            let _ = notices.send(notice);
        }
    }

    fn set_phase(&self, phase: NegotiationPhase) {
        {
            let mut current = self.phase.lock();
            if *current == phase || *current == NegotiationPhase::Closed {
                return;
            }
            *current = phase;
        }
        trace!(remote = %self.remote_id, ?phase, "peer phase");
        self.notify(PeerNotice::Phase {
            remote_id: self.remote_id.clone(),
            serial: self.serial,
            phase,
        });
    }

    fn begin_negotiating(&self) {
        let idle = matches!(
            *self.phase.lock(),
            NegotiationPhase::Idle | NegotiationPhase::Failed
        );
        if idle {
            self.set_phase(NegotiationPhase::Negotiating);
        }
    }
}

/// One negotiated connection to a remote peer.
///
/// Opens a data channel labelled with the local id; the remote peer's
/// channel, labelled with its id, is used for sending. Closed on drop.
pub struct PerfectNegotiationPeer {
    local_id: String,
    core: Arc<NegotiationCore>,
    signaling: Arc<PeerSignalingChannel>,
    shared: Arc<PeerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PerfectNegotiationPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerfectNegotiationPeer")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.shared.remote_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl PerfectNegotiationPeer {
    /// Create the peer connection and start negotiating with `remote_id`.
    pub async fn start(
        connection: &Connection,
        backend: &dyn RtcBackend,
        local_id: &str,
        remote_id: &str,
        options: PeerOptions,
    ) -> Result<Self> {
        let (peer_connection, events) = backend.create_peer_connection().await?;
        let (signaling, inbox) = PeerSignalingChannel::open(connection, local_id, remote_id)?;
        let core = Arc::new(NegotiationCore::new(
            local_id,
            remote_id,
            Arc::clone(&peer_connection),
            Arc::clone(&signaling) as Arc<dyn SignalSink>,
        ));
        let (_own, own_events) = peer_connection.create_data_channel(local_id).await?;

        let shared = Arc::new(PeerShared {
            remote_id: remote_id.to_string(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            phase: Mutex::new(NegotiationPhase::Idle),
            outbound: Mutex::new(None),
            notices: options.notices,
        });
        let task = tokio::spawn(run_peer(
            Arc::clone(&core),
            Arc::clone(&shared),
            options.recovery,
            Throttle::new(options.throttle),
            inbox,
            events,
            own_events,
        ));
        debug!(local = local_id, remote = remote_id, polite = core.is_polite(), "peer started");

        Ok(Self {
            local_id: local_id.to_string(),
            core,
            signaling,
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.shared.remote_id
    }

    /// Unique per peer instance.
    pub fn serial(&self) -> u64 {
        self.shared.serial
    }

    pub fn is_polite(&self) -> bool {
        self.core.is_polite()
    }

    pub fn phase(&self) -> NegotiationPhase {
        *self.shared.phase.lock()
    }

    /// Whether the remote peer's channel is open for sending.
    pub fn can_send(&self) -> bool {
        self.shared
            .outbound
            .lock()
            .as_ref()
            .map_or(false, |channel| channel.is_open())
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        let channel = self.shared.outbound.lock().clone();
        match channel {
            Some(channel) => channel.send(text),
            None => Err(RtcError::ChannelNotOpen),
        }
    }

    /// Send a value as JSON.
    pub fn send<T: Serialize>(&self, value: &T) -> Result<()> {
        self.send_text(&serde_json::to_string(value)?)
    }

    pub fn restart_ice(&self) {
        self.core.peer_connection().restart_ice();
    }

    /// Tear down the connection and signaling. Idempotent.
    pub fn close(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        task.abort();
        self.signaling.close();
        self.core.peer_connection().close();
        self.shared.outbound.lock().take();
        *self.shared.phase.lock() = NegotiationPhase::Closed;
        debug!(local = %self.local_id, remote = %self.shared.remote_id, "peer closed");
    }
}

impl Drop for PerfectNegotiationPeer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_peer(
    core: Arc<NegotiationCore>,
    shared: Arc<PeerShared>,
    recovery: RecoveryHook,
    mut throttle: Throttle,
    mut inbox: mpsc::UnboundedReceiver<SignalingMessage>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    mut own_events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    loop {
        tokio::select! {
            biased;
            Some(message) = inbox.recv() => {
                shared.begin_negotiating();
                if let Err(e) = core.handle_signal(message).await {
                    let failure = PeerFailure::Negotiation(e.to_string());
                    if !recover(&core, &shared, &recovery, failure) {
                        break;
                    }
                }
            }
            Some(event) = events.recv() => {
                if !on_peer_event(&core, &shared, &recovery, event).await {
                    break;
                }
            }
            Some(event) = own_events.recv() => match event {
                ChannelEvent::Message(text) => {
                    if throttle.admit(Instant::now()) {
                        deliver(&shared, &text);
                    } else {
                        trace!(remote = %shared.remote_id, "throttled data channel message");
                    }
                }
                ChannelEvent::Open => trace!(remote = %shared.remote_id, "inbound channel open"),
                ChannelEvent::Closed => {
                    trace!(remote = %shared.remote_id, "inbound channel closed")
                }
            },
            else => break,
        }
    }
    trace!(remote = %shared.remote_id, "peer task finished");
}

/// Returns false when the peer should stop.
async fn on_peer_event(
    core: &NegotiationCore,
    shared: &PeerShared,
    recovery: &RecoveryHook,
    event: PeerEvent,
) -> bool {
    match event {
        PeerEvent::NegotiationNeeded => {
            shared.begin_negotiating();
            if let Err(e) = core.handle_negotiation_needed().await {
                return recover(core, shared, recovery, PeerFailure::Negotiation(e.to_string()));
            }
        }
        PeerEvent::IceCandidate(candidate) => {
            if let Err(e) = core.send_candidate(candidate) {
                warn!(remote = %shared.remote_id, error = %e, "candidate not sent");
            }
        }
        PeerEvent::ConnectionState(state) => match state {
            PeerConnectionState::Connected => shared.set_phase(NegotiationPhase::Connected),
            PeerConnectionState::Failed => {
                return recover(core, shared, recovery, PeerFailure::Connection);
            }
            PeerConnectionState::Closed => return false,
            other => trace!(remote = %shared.remote_id, state = ?other, "connection state"),
        },
        PeerEvent::DataChannel { channel, .. } => {
            if channel.label() == shared.remote_id {
                *shared.outbound.lock() = Some(channel);
            } else {
                debug!(
                    remote = %shared.remote_id,
                    label = channel.label(),
                    "unexpected data channel"
                );
            }
        }
    }
    true
}

fn recover(
    core: &NegotiationCore,
    shared: &PeerShared,
    recovery: &RecoveryHook,
    failure: PeerFailure,
) -> bool {
    shared.set_phase(NegotiationPhase::Failed);
    match recovery(&shared.remote_id, shared.serial, &failure) {
        RecoveryAction::RestartIce => {
            debug!(remote = %shared.remote_id, %failure, "restarting ice");
            core.peer_connection().restart_ice();
            true
        }
        RecoveryAction::Close => {
            debug!(remote = %shared.remote_id, %failure, "closing failed peer");
            core.peer_connection().close();
            shared.set_phase(NegotiationPhase::Closed);
            false
        }
        RecoveryAction::Ignore => true,
    }
}

/// Lets one message through, then shuts for `period`.
#[derive(Debug)]
struct Throttle {
    period: Duration,
    open_at: Option<Instant>,
}

impl Throttle {
    fn new(period: Duration) -> Self {
        Self {
            period,
            open_at: None,
        }
    }

    fn admit(&mut self, now: Instant) -> bool {
        if self.period.is_zero() {
            return true;
        }
        match self.open_at {
            Some(open_at) if now < open_at => false,
            _ => {
                self.open_at = Some(now + self.period);
                true
            }
        }
    }
}

fn deliver(shared: &PeerShared, text: &str) {
    match serde_json::from_str(text) {
        Ok(value) => shared.notify(PeerNotice::Message(DataChannelMessage {
            sender: shared.remote_id.clone(),
            value,
            received_at: Instant::now(),
        })),
        Err(e) => warn!(remote = %shared.remote_id, error = %e, "data channel message is not json"),
    }
}
