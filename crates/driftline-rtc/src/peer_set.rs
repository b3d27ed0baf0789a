//! A full mesh of peers discovered through presence.
//!
//! Every client announces an ephemeral id through presence and keeps one
//! [`PerfectNegotiationPeer`] per id announced by someone else. Peers that
//! disappear from presence are closed.
//!
//! Failures are counted per remote id and escalate:
//!
//! | failures          | response                                   |
//! |-------------------|--------------------------------------------|
//! | below threshold   | restart ICE on the existing connection     |
//! | at threshold      | take a new ephemeral id and rebuild peers  |
//! | above threshold   | close the peer until it announces a new id |
//!
//! A successful connection resets the count.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use driftline_core::{IdentityProvider, Listener, ListenerId, Listeners};
use driftline_net::Connection;
use driftline_replica::{PresenceBroadcaster, PresenceMap};

use crate::backend::RtcBackend;
use crate::config::PeerSetConfig;
use crate::error::Result;
use crate::negotiation::{
    DataChannelMessage, NegotiationPhase, PeerFailure, PeerNotice, PeerOptions,
    PerfectNegotiationPeer, RecoveryAction,
};

/// Response to a peer's failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    RestartIce,
    RotateIdentity,
    Abandon,
}

/// Map a failure count to its response.
pub fn escalation(failures: u32, threshold: u32) -> Escalation {
    if failures < threshold {
        Escalation::RestartIce
    } else if failures == threshold {
        Escalation::RotateIdentity
    } else {
        Escalation::Abandon
    }
}

enum Control {
    Presence(BTreeSet<String>),
    Escalate {
        remote_id: String,
        serial: u64,
        step: Escalation,
    },
    Rotate,
}

struct SetState {
    local_id: String,
    desired: BTreeSet<String>,
    peers: HashMap<String, PerfectNegotiationPeer>,
    abandoned: HashSet<String>,
    closed: bool,
}

struct SetInner {
    connection: Connection,
    backend: Arc<dyn RtcBackend>,
    identity: Arc<dyn IdentityProvider>,
    config: PeerSetConfig,
    state: Mutex<SetState>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
    listeners: Listeners<DataChannelMessage>,
    control: mpsc::UnboundedSender<Control>,
    notices: mpsc::UnboundedSender<PeerNotice>,
    presence: Mutex<Option<PresenceBroadcaster<String>>>,
}

/// Keeps a data channel open to every other client in the room.
pub struct PeerSetSynchronizer {
    inner: Arc<SetInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PeerSetSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PeerSetSynchronizer")
            .field("local_id", &state.local_id)
            .field("peers", &state.peers.len())
            .finish()
    }
}

impl PeerSetSynchronizer {
    /// Announce a fresh ephemeral id and start connecting to everyone else.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        connection: &Connection,
        backend: Arc<dyn RtcBackend>,
        identity: Arc<dyn IdentityProvider>,
        config: PeerSetConfig,
    ) -> Result<Self> {
        let local_id = identity.next_ephemeral_id();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SetInner {
            connection: connection.clone(),
            backend,
            identity: Arc::clone(&identity),
            config: config.clone(),
            state: Mutex::new(SetState {
                local_id: local_id.clone(),
                desired: BTreeSet::new(),
                peers: HashMap::new(),
                abandoned: HashSet::new(),
                closed: false,
            }),
            failures: Arc::new(Mutex::new(HashMap::new())),
            listeners: Listeners::new(),
            control: control_tx.clone(),
            notices: notice_tx,
            presence: Mutex::new(None),
        });

        let presence = PresenceBroadcaster::new(
            connection,
            identity.client_id(),
            local_id.clone(),
            config.presence,
            move |peers: &PresenceMap<String>| {
                let ids = peers
                    .values()
                    .map(|entry| entry.value.clone())
                    .filter(|id| !id.is_empty())
                    .collect();
                let _ = control_tx.send(Control::Presence(ids));
            },
        )?;
        *inner.presence.lock() = Some(presence);

        let task = tokio::spawn(control_loop(Arc::downgrade(&inner), control_rx, notice_rx));
        info!(local = %local_id, "peer set started");
        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    /// The ephemeral id currently announced.
    pub fn local_id(&self) -> String {
        self.inner.state.lock().local_id.clone()
    }

    /// Remote ids with a peer record, sorted.
    pub fn peers(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut ids: Vec<String> = state.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remote ids whose connection is up, sorted.
    pub fn connected_peers(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut ids: Vec<String> = state
            .peers
            .iter()
            .filter(|(_, peer)| peer.phase() == NegotiationPhase::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Consecutive failures recorded for a remote id.
    pub fn failures(&self, remote_id: &str) -> u32 {
        self.inner
            .failures
            .lock()
            .get(remote_id)
            .copied()
            .unwrap_or(0)
    }

    /// Send a value as JSON to every peer with an open channel.
    ///
    /// Returns the number of peers it was sent to.
    pub fn send<T: Serialize>(&self, value: &T) -> Result<usize> {
        let text = serde_json::to_string(value)?;
        let state = self.inner.state.lock();
        let mut sent = 0;
        for (remote_id, peer) in &state.peers {
            if !peer.can_send() {
                continue;
            }
            match peer.send_text(&text) {
                Ok(()) => sent += 1,
                Err(e) => debug!(remote = %remote_id, error = %e, "send skipped"),
            }
        }
        Ok(sent)
    }

    /// Register a listener for data channel messages.
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DataChannelMessage) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(listener) as Listener<DataChannelMessage>)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Take a new ephemeral id and rebuild every peer.
    pub fn refresh_identity(&self) {
        let _ = self.inner.control.send(Control::Rotate);
    }

    /// Close every peer and stop announcing. Idempotent.
    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let peers: Vec<PerfectNegotiationPeer> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            peer.close();
        }
        if let Some(presence) = self.inner.presence.lock().take() {
            presence.destroy();
        }
        self.inner.listeners.clear();
        debug!("peer set closed");
    }
}

impl Drop for PeerSetSynchronizer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn control_loop(
    weak: Weak<SetInner>,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut notices: mpsc::UnboundedReceiver<PeerNotice>,
) {
    loop {
        let next = tokio::select! {
            Some(notice) = notices.recv() => Err(notice),
            Some(command) = control.recv() => Ok(command),
            else => break,
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match next {
            Err(notice) => inner.on_notice(notice),
            Ok(Control::Presence(ids)) => {
                inner.state.lock().desired = ids;
                inner.reconcile().await;
            }
            Ok(Control::Escalate {
                remote_id,
                serial,
                step,
            }) => inner.escalate(&remote_id, serial, step).await,
            Ok(Control::Rotate) => inner.rotate_identity().await,
        }
    }
}

impl SetInner {
    fn peer_options(&self) -> PeerOptions {
        let failures = Arc::clone(&self.failures);
        let control = self.control.clone();
        let threshold = self.config.failure_threshold;
        let recovery = move |remote_id: &str, serial: u64, failure: &PeerFailure| {
            let count = {
                let mut failures = failures.lock();
                let count = failures.entry(remote_id.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            warn!(remote = remote_id, failures = count, %failure, "peer failed");
            match escalation(count, threshold) {
                Escalation::RestartIce => RecoveryAction::RestartIce,
                step => {
                    let _ = control.send(Control::Escalate {
                        remote_id: remote_id.to_string(),
                        serial,
                        step,
                    });
                    RecoveryAction::Ignore
                }
            }
        };
        PeerOptions {
            recovery: Arc::new(recovery),
            notices: Some(self.notices.clone()),
            throttle: self.config.throttle,
        }
    }

    fn on_notice(&self, notice: PeerNotice) {
        match notice {
            PeerNotice::Message(message) => {
                self.listeners.dispatch(&message);
            }
            PeerNotice::Phase {
                remote_id,
                serial,
                phase,
            } => {
                if !self.is_current(&remote_id, serial) {
                    return;
                }
                if phase == NegotiationPhase::Connected {
                    info!(remote = %remote_id, "peer connected");
                    self.failures.lock().remove(&remote_id);
                }
            }
        }
    }

    fn is_current(&self, remote_id: &str, serial: u64) -> bool {
        self.state
            .lock()
            .peers
            .get(remote_id)
            .map_or(false, |peer| peer.serial() == serial)
    }

    /// Close peers no longer announced and start peers for new ids.
    async fn reconcile(&self) {
        let (local_id, stale, fresh) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let SetState {
                local_id,
                desired,
                peers,
                abandoned,
                ..
            } = &mut *state;
            abandoned.retain(|id| desired.contains(id));
            let gone: Vec<String> = peers
                .keys()
                .filter(|id| !desired.contains(*id))
                .cloned()
                .collect();
            let stale: Vec<PerfectNegotiationPeer> =
                gone.iter().filter_map(|id| peers.remove(id)).collect();
            let fresh: Vec<String> = desired
                .iter()
                .filter(|id| {
                    id.as_str() != local_id.as_str()
                        && !peers.contains_key(*id)
                        && !abandoned.contains(*id)
                })
                .cloned()
                .collect();
            (local_id.clone(), stale, fresh)
        };

        for peer in stale {
            debug!(remote = peer.remote_id(), "peer left");
            peer.close();
        }

        for remote_id in fresh {
            let started = PerfectNegotiationPeer::start(
                &self.connection,
                self.backend.as_ref(),
                &local_id,
                &remote_id,
                self.peer_options(),
            )
            .await;
            let peer = match started {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(remote = %remote_id, error = %e, "peer not started");
                    continue;
                }
            };
            let mut state = self.state.lock();
            let wanted = !state.closed
                && state.local_id == local_id
                && state.desired.contains(&remote_id)
                && !state.peers.contains_key(&remote_id);
            if wanted {
                state.peers.insert(remote_id, peer);
            } else {
                drop(state);
                peer.close();
            }
        }
    }

    async fn escalate(&self, remote_id: &str, serial: u64, step: Escalation) {
        if !self.is_current(remote_id, serial) {
            return;
        }
        match step {
            Escalation::RestartIce => {
                if let Some(peer) = self.state.lock().peers.get(remote_id) {
                    peer.restart_ice();
                }
            }
            Escalation::RotateIdentity => {
                info!(remote = %remote_id, "repeated failures; taking a new id");
                self.rotate_identity().await;
            }
            Escalation::Abandon => {
                let peer = {
                    let mut state = self.state.lock();
                    state.abandoned.insert(remote_id.to_string());
                    state.peers.remove(remote_id)
                };
                if let Some(peer) = peer {
                    warn!(remote = %remote_id, "giving up on peer until it changes id");
                    peer.close();
                }
            }
        }
    }

    async fn rotate_identity(&self) {
        let new_id = self.identity.next_ephemeral_id();
        let peers: Vec<PerfectNegotiationPeer> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            debug!(old = %state.local_id, new = %new_id, "rotating ephemeral id");
            state.local_id = new_id.clone();
            state.peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            peer.close();
        }
        {
            let presence = self.presence.lock();
            if let Some(presence) = presence.as_ref() {
                presence.set_value(new_id);
            }
        }
        self.reconcile().await;
    }
}
