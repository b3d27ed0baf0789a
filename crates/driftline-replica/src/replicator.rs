//! Optimistic replication with compaction.
//!
//! An [`OptimisticReplicator`] mirrors one key's log into a folded state.
//! Remote entries are applied in sequence order and anything at or below the
//! confirmed sequence number is ignored, which makes replays after a
//! reconnect harmless.
//!
//! In optimistic mode, dispatched actions are also kept in a pending queue
//! and the local state is always `fold(confirmed, pending)`. The server echo
//! of our own action pops it from the queue; a foreign action rebases the
//! pending queue on the new confirmed state.
//!
//! Each pending action remembers the socket it was sent on. When a replay
//! arrives on a later socket, pending actions from earlier sockets were lost
//! with their socket and are sent again, after anything already queued.
//!
//! When the server reports that the key retains more entries than the
//! configured threshold, the replicator asks it to compact everything up to
//! the confirmed sequence number into one packed baseline.
//!
//! Callbacks run outside the state lock. Every change gets a revision number
//! and a callback never sees an older revision after a newer one.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, trace, warn};

use driftline_core::{
    from_value, to_value, Action, IdentityProvider, Key, Listener, ListenerId, SequenceNumber,
    SequenceValue, Value,
};
use driftline_net::{Connection, Replayed, SubscribeOptions, Subscription};

use crate::compactable::{fold_actions, Compactable, ReplicaPayload};
use crate::config::ReplicatorOptions;
use crate::error::{ReplicaError, Result};

/// Snapshot of a replicator's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedState<S> {
    /// State folded from every confirmed entry.
    pub confirmed_state: S,
    /// Sequence number of the last confirmed entry.
    pub confirmed_seq: SequenceNumber,
    /// Confirmed state plus unconfirmed local actions.
    pub local_state: S,
}

type Callback<S> = Box<dyn Fn(&S) + Send + Sync>;

/// An unconfirmed action and the socket that carries it.
struct PendingAction<A> {
    action: A,
    socket: u64,
}

struct ReplicaState<C: Compactable> {
    confirmed_state: C::State,
    confirmed_seq: SequenceNumber,
    local_state: C::State,
    pending: VecDeque<PendingAction<C::Action>>,
    last_compacted: SequenceNumber,
    /// Bumped for every local state handed to the callback.
    revision: u64,
    destroyed: bool,
}

impl<C: Compactable> ReplicaState<C> {
    fn notify(&mut self) -> (u64, C::State) {
        self.revision += 1;
        (self.revision, self.local_state.clone())
    }
}

struct ReplicaInner<C: Compactable> {
    compactable: C,
    connection: Connection,
    key: Key,
    sender: String,
    options: ReplicatorOptions,
    state: Mutex<ReplicaState<C>>,
    callback: Callback<C::State>,
    /// Newest revision handed to the callback.
    delivered: ReentrantMutex<Cell<u64>>,
    subscription: Mutex<Option<Subscription>>,
    replay_listener: Mutex<Option<ListenerId>>,
}

/// Replicates a [`Compactable`] through one key.
pub struct OptimisticReplicator<C: Compactable> {
    inner: Arc<ReplicaInner<C>>,
}

impl<C: Compactable> fmt::Debug for OptimisticReplicator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("OptimisticReplicator")
            .field("key", &self.inner.key)
            .field("sender", &self.inner.sender)
            .field("confirmed_seq", &state.confirmed_seq)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl<C: Compactable> OptimisticReplicator<C> {
    /// Create a replicator and subscribe it to `key` with full replay.
    ///
    /// `callback` receives the local state whenever it changes.
    pub fn new<F>(
        connection: &Connection,
        key: impl Into<Key>,
        compactable: C,
        identity: &dyn IdentityProvider,
        options: ReplicatorOptions,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(&C::State) + Send + Sync + 'static,
    {
        let initial = compactable.initial_state();
        let inner = Arc::new(ReplicaInner {
            key: key.into(),
            sender: identity.next_ephemeral_id(),
            connection: connection.clone(),
            options,
            state: Mutex::new(ReplicaState {
                confirmed_state: initial.clone(),
                confirmed_seq: SequenceNumber::ZERO,
                local_state: initial,
                pending: VecDeque::new(),
                last_compacted: SequenceNumber::ZERO,
                revision: 0,
                destroyed: false,
            }),
            compactable,
            callback: Box::new(callback),
            delivered: ReentrantMutex::new(Cell::new(0)),
            subscription: Mutex::new(None),
            replay_listener: Mutex::new(None),
        });

        let on_replay = Arc::downgrade(&inner);
        let replay_listener = connection.on_replay(&inner.key, move |replayed| {
            if let Some(inner) = on_replay.upgrade() {
                inner.on_replay(replayed);
            }
        });
        *inner.replay_listener.lock() = Some(replay_listener);

        let on_value = Arc::downgrade(&inner);
        let on_size = Arc::downgrade(&inner);
        let subscription = connection.subscribe_with(
            &inner.key,
            Arc::new(move |value: &SequenceValue| {
                if let Some(inner) = on_value.upgrade() {
                    inner.on_remote_value(value);
                }
            }),
            Some(Arc::new(move |size: &usize| {
                if let Some(inner) = on_size.upgrade() {
                    inner.on_size(*size);
                }
            }) as Listener<usize>),
            SubscribeOptions::default(),
        )?;
        *inner.subscription.lock() = Some(subscription);

        debug!(key = %inner.key, sender = %inner.sender, "replicator subscribed");
        Ok(Self { inner })
    }

    /// Apply an action.
    ///
    /// The action is always sent as an append. In optimistic mode the local
    /// state and callback are updated right away, without waiting for the
    /// server.
    pub fn dispatch(&self, action: C::Action) -> Result<()> {
        let inner = &self.inner;
        let payload = inner.apply_payload(&action)?;

        let optimistic_state = {
            let mut state = inner.state.lock();
            if state.destroyed {
                return Err(ReplicaError::Destroyed);
            }
            let delivery = inner.connection.push(&inner.key, payload, Action::Append)?;
            if inner.compactable.optimistic() {
                state.local_state = inner
                    .compactable
                    .apply_action(state.local_state.clone(), &action);
                state.pending.push_back(PendingAction {
                    action,
                    socket: delivery.socket(),
                });
                Some(state.notify())
            } else {
                None
            }
        };
        if let Some((revision, local)) = optimistic_state {
            inner.deliver(revision, &local);
        }
        Ok(())
    }

    /// Apply one entry of the key's log.
    pub fn on_remote_value(&self, value: &SequenceValue) {
        self.inner.on_remote_value(value);
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ReplicatedState<C::State> {
        let state = self.inner.state.lock();
        ReplicatedState {
            confirmed_state: state.confirmed_state.clone(),
            confirmed_seq: state.confirmed_seq,
            local_state: state.local_state.clone(),
        }
    }

    /// The local state.
    pub fn local_state(&self) -> C::State {
        self.inner.state.lock().local_state.clone()
    }

    /// Sequence number of the last confirmed entry.
    pub fn confirmed_seq(&self) -> SequenceNumber {
        self.inner.state.lock().confirmed_seq
    }

    /// Number of local actions not yet confirmed.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Tag attached to actions sent by this replicator.
    pub fn sender(&self) -> &str {
        &self.inner.sender
    }

    /// The replicated key.
    pub fn key(&self) -> &Key {
        &self.inner.key
    }

    /// Unsubscribe. The callback is never invoked afterwards. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl<C: Compactable> Drop for OptimisticReplicator<C> {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<C: Compactable> ReplicaInner<C> {
    fn apply_payload(&self, action: &C::Action) -> Result<Value> {
        Ok(to_value(&ReplicaPayload::Apply {
            apply: action.clone(),
            i: self.sender.clone(),
        })?)
    }

    /// Hand `local` to the callback unless a newer revision got there first.
    fn deliver(&self, revision: u64, local: &C::State) {
        let delivered = self.delivered.lock();
        if revision <= delivered.get() {
            trace!(key = %self.key, revision, "skipping stale callback");
            return;
        }
        delivered.set(revision);
        (self.callback)(local);
    }

    fn on_remote_value(&self, value: &SequenceValue) {
        let payload: ReplicaPayload<C::Action> = match from_value(&value.value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %self.key, seq = %value.seq, error = %e, "unknown replica payload");
                return;
            }
        };

        let notify = {
            let mut state = self.state.lock();
            if state.destroyed || value.seq <= state.confirmed_seq {
                trace!(key = %self.key, seq = %value.seq, "ignoring already applied entry");
                return;
            }

            let own = match payload {
                ReplicaPayload::Reset { reset } => {
                    let baseline = match self.compactable.unpack_state(&reset) {
                        Ok(baseline) => baseline,
                        Err(e) => {
                            warn!(key = %self.key, seq = %value.seq, error = %e, "bad baseline");
                            return;
                        }
                    };
                    debug!(key = %self.key, seq = %value.seq, "baseline applied");
                    state.confirmed_state = baseline;
                    false
                }
                ReplicaPayload::Apply { apply, i } => {
                    let confirmed = std::mem::replace(
                        &mut state.confirmed_state,
                        self.compactable.initial_state(),
                    );
                    state.confirmed_state = self.compactable.apply_action(confirmed, &apply);
                    i == self.sender
                }
            };
            state.confirmed_seq = value.seq;

            if self.compactable.optimistic() {
                if own {
                    state.pending.pop_front();
                }
                state.local_state = self.rebase(&state);
            } else {
                state.local_state = state.confirmed_state.clone();
            }

            if own && self.compactable.optimistic() {
                None
            } else {
                Some(state.notify())
            }
        };

        if let Some((revision, local)) = notify {
            self.deliver(revision, &local);
        }
    }

    fn rebase(&self, state: &ReplicaState<C>) -> C::State {
        fold_actions(
            &self.compactable,
            state.confirmed_state.clone(),
            state.pending.iter().map(|pending| &pending.action),
        )
    }

    /// Send again every pending action whose socket closed before the
    /// server saw it.
    fn on_replay(&self, replayed: &Replayed) {
        let notify = {
            let mut state = self.state.lock();
            if state.destroyed || !self.compactable.optimistic() {
                return;
            }
            let (lost, kept): (VecDeque<_>, VecDeque<_>) = state
                .pending
                .drain(..)
                .partition(|pending| pending.socket < replayed.socket);
            state.pending = kept;
            if lost.is_empty() {
                return;
            }
            warn!(
                key = %self.key,
                lost = lost.len(),
                socket = replayed.socket,
                "resending actions lost in flight"
            );
            for PendingAction { action, .. } in lost {
                let sent = self.apply_payload(&action).and_then(|payload| {
                    Ok(self.connection.push(&self.key, payload, Action::Append)?)
                });
                match sent {
                    Ok(delivery) => state.pending.push_back(PendingAction {
                        action,
                        socket: delivery.socket(),
                    }),
                    Err(e) => warn!(key = %self.key, error = %e, "dropping unsendable action"),
                }
            }
            state.local_state = self.rebase(&state);
            state.notify()
        };
        self.deliver(notify.0, &notify.1);
    }

    fn on_size(&self, size: usize) {
        if size <= self.options.size_threshold {
            return;
        }
        let (seq, packed) = {
            let mut state = self.state.lock();
            if state.destroyed
                || state.confirmed_seq.is_zero()
                || state.confirmed_seq == state.last_compacted
            {
                return;
            }
            let packed = match self.compactable.pack_state(&state.confirmed_state) {
                Ok(packed) => packed,
                Err(e) => {
                    warn!(key = %self.key, error = %e, "cannot pack state for compaction");
                    return;
                }
            };
            state.last_compacted = state.confirmed_seq;
            (state.confirmed_seq, packed)
        };

        info!(key = %self.key, seq = %seq, size, "requesting compaction");
        let payload = match to_value(&ReplicaPayload::<C::Action>::Reset { reset: packed }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %self.key, error = %e, "cannot encode compaction");
                return;
            }
        };
        if let Err(e) = self
            .connection
            .push(&self.key, payload, Action::Compact { seq })
        {
            warn!(key = %self.key, error = %e, "compaction not sent");
        }
    }

    fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        if let Some(subscription) = self.subscription.lock().take() {
            self.connection.unsubscribe(&subscription);
        }
        if let Some(id) = self.replay_listener.lock().take() {
            self.connection.remove_replay_listener(&self.key, id);
        }
        debug!(key = %self.key, "replicator destroyed");
    }
}
