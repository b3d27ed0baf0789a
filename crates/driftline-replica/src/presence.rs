//! Ephemeral presence.
//!
//! A [`PresenceBroadcaster`] relays this client's value on a shared key and
//! aggregates the values relayed by everyone else. Relayed values are never
//! retained by the server, so liveness is entirely inferred here: a peer that
//! has not been heard from for twice the heartbeat period is dropped.
//!
//! Sending policy:
//! - the current value is sent immediately on start;
//! - a changed value is sent no sooner than `min_interval` after the
//!   previous send, and several changes inside that window coalesce into one
//!   send carrying the latest value;
//! - without changes the value is resent every `max_interval`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use driftline_core::{from_value, to_value, Action, Key, SequenceValue};
use driftline_net::{Connection, SubscribeOptions, Subscription};

use crate::config::PresenceConfig;
use crate::error::Result;

/// Wire shape of one presence relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage<T> {
    pub client: String,
    pub value: T,
}

/// Last known value of one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry<T> {
    pub client_id: String,
    pub value: T,
    pub last_seen: Instant,
}

/// Peers by client id.
pub type PresenceMap<T> = HashMap<String, PresenceEntry<T>>;

type PresenceCallback<T> = Box<dyn Fn(&PresenceMap<T>) + Send + Sync>;

struct PresenceState<T> {
    value: T,
    dirty: bool,
    peers: PresenceMap<T>,
    destroyed: bool,
}

struct PresenceInner<T> {
    connection: Connection,
    key: Key,
    client_id: String,
    config: PresenceConfig,
    state: Mutex<PresenceState<T>>,
    changed: Arc<Notify>,
    callback: PresenceCallback<T>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<Subscription>>,
}

/// Broadcasts this client's presence and tracks everyone else's.
pub struct PresenceBroadcaster<T> {
    inner: Arc<PresenceInner<T>>,
}

impl<T> fmt::Debug for PresenceBroadcaster<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceBroadcaster")
            .field("key", &self.inner.key)
            .field("client_id", &self.inner.client_id)
            .field("peers", &self.inner.state.lock().peers.len())
            .finish()
    }
}

impl<T> PresenceBroadcaster<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start broadcasting `initial` as `client_id`.
    ///
    /// Must be called within a tokio runtime. `callback` receives the peer
    /// map whenever a peer is heard from or expires.
    pub fn new<F>(
        connection: &Connection,
        client_id: impl Into<String>,
        initial: T,
        config: PresenceConfig,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(&PresenceMap<T>) + Send + Sync + 'static,
    {
        let inner = Arc::new(PresenceInner {
            connection: connection.clone(),
            key: Key::new(config.key.clone()),
            client_id: client_id.into(),
            config,
            state: Mutex::new(PresenceState {
                value: initial,
                dirty: false,
                peers: HashMap::new(),
                destroyed: false,
            }),
            changed: Arc::new(Notify::new()),
            callback: Box::new(callback),
            tasks: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = connection.subscribe_with(
            &inner.key,
            Arc::new(move |value: &SequenceValue| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_relay(value);
                }
            }),
            None,
            SubscribeOptions { replay: false },
        )?;
        *inner.subscription.lock() = Some(subscription);

        let broadcast = tokio::spawn(broadcast_loop(
            Arc::downgrade(&inner),
            Arc::clone(&inner.changed),
            inner.config.min_interval,
            inner.config.max_interval,
        ));
        let sweep = tokio::spawn(sweep_loop(
            Arc::downgrade(&inner),
            inner.config.max_interval,
        ));
        inner.tasks.lock().extend([broadcast, sweep]);

        debug!(key = %inner.key, client = %inner.client_id, "presence started");
        Ok(Self { inner })
    }

    /// Replace this client's value. Unchanged values are ignored.
    pub fn set_value(&self, value: T) {
        let notify = {
            let mut state = self.inner.state.lock();
            if state.destroyed || state.value == value {
                return;
            }
            state.value = value;
            let was_dirty = state.dirty;
            state.dirty = true;
            !was_dirty
        };
        if notify {
            self.inner.changed.notify_one();
        }
    }

    /// This client's current value.
    pub fn value(&self) -> T {
        self.inner.state.lock().value.clone()
    }

    /// Snapshot of the known peers.
    pub fn peers(&self) -> PresenceMap<T> {
        self.inner.state.lock().peers.clone()
    }

    /// The id this client announces itself as.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Stop broadcasting and tracking. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl<T> Drop for PresenceBroadcaster<T> {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<T> PresenceInner<T> {
    fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.peers.clear();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(subscription) = self.subscription.lock().take() {
            self.connection.unsubscribe(&subscription);
        }
        debug!(key = %self.key, "presence stopped");
    }
}

impl<T> PresenceInner<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn send_current(&self) {
        let message = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.dirty = false;
            PresenceMessage {
                client: self.client_id.clone(),
                value: state.value.clone(),
            }
        };
        let value = match to_value(&message) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %self.key, error = %e, "cannot encode presence");
                return;
            }
        };
        trace!(key = %self.key, "relaying presence");
        if let Err(e) = self.connection.push(&self.key, value, Action::Relay) {
            warn!(key = %self.key, error = %e, "presence not sent");
        }
    }

    fn on_relay(&self, relayed: &SequenceValue) {
        let message: PresenceMessage<T> = match from_value(&relayed.value) {
            Ok(message) => message,
            Err(e) => {
                debug!(key = %self.key, error = %e, "ignoring malformed presence");
                return;
            }
        };
        if message.client == self.client_id {
            return;
        }

        let snapshot = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.peers.insert(
                message.client.clone(),
                PresenceEntry {
                    client_id: message.client,
                    value: message.value,
                    last_seen: Instant::now(),
                },
            );
            state.peers.clone()
        };
        (self.callback)(&snapshot);
    }

    fn sweep(&self) {
        let expiry = self.config.expiry();
        let snapshot = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            let now = Instant::now();
            let before = state.peers.len();
            state
                .peers
                .retain(|_, entry| now.duration_since(entry.last_seen) <= expiry);
            let expired = before - state.peers.len();
            if expired == 0 {
                return;
            }
            debug!(key = %self.key, expired, "presence entries expired");
            state.peers.clone()
        };
        (self.callback)(&snapshot);
    }
}

async fn broadcast_loop<T>(
    weak: Weak<PresenceInner<T>>,
    changed: Arc<Notify>,
    min_interval: Duration,
    max_interval: Duration,
) where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    loop {
        match weak.upgrade() {
            Some(inner) => inner.send_current(),
            None => return,
        }
        let sent_at = Instant::now();
        tokio::select! {
            _ = changed.notified() => {
                tokio::time::sleep_until(sent_at + min_interval).await;
            }
            _ = tokio::time::sleep_until(sent_at + max_interval) => {}
        }
    }
}

async fn sweep_loop<T>(weak: Weak<PresenceInner<T>>, period: Duration)
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match weak.upgrade() {
            Some(inner) => inner.sweep(),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftline_core::{
        decode_frame, encode_frame, Encoding, MessageFromDb, MessageToDb, SequenceNumber, Value,
    };
    use driftline_net::memory::{MemoryNetwork, ServerSocket};
    use driftline_net::ConnectionConfig;

    async fn connected() -> (Connection, ServerSocket) {
        let network = MemoryNetwork::new();
        let mut accepted = network.listen();
        let conn = Connection::new(Arc::new(network.connector()), ConnectionConfig::default());
        conn.connect("mem://room", Encoding::Json).await.unwrap();
        let server = accepted.recv().await.unwrap();
        (conn, server)
    }

    /// Next relayed presence value and the time it arrived.
    async fn next_relay(server: &mut ServerSocket) -> (String, Instant) {
        let frame = server.recv().await.unwrap();
        let at = Instant::now();
        match decode_frame::<MessageToDb>(&frame).unwrap() {
            MessageToDb::Push {
                value,
                action: Action::Relay,
                ..
            } => {
                let message: PresenceMessage<String> = from_value(&value).unwrap();
                (message.value, at)
            }
            other => panic!("expected relay, got {:?}", other),
        }
    }

    fn relay_from(server: &ServerSocket, client: &str, value: &str, seq: u64) {
        let value = to_value(&PresenceMessage {
            client: client.to_string(),
            value: value.to_string(),
        })
        .unwrap();
        let push = MessageFromDb::Push {
            key: Key::from("__presence"),
            value,
            seq: SequenceNumber(seq),
        };
        assert!(server.send(encode_frame(&push, Encoding::Json).unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_and_heartbeat() {
        let (conn, mut server) = connected().await;
        let start = Instant::now();
        let presence = PresenceBroadcaster::new(
            &conn,
            "me",
            "a".to_string(),
            PresenceConfig::default(),
            |_| {},
        )
        .unwrap();

        let (value, at) = next_relay(&mut server).await;
        assert_eq!(value, "a");
        assert_eq!(at - start, Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(5)).await;
        presence.set_value("b".to_string());
        let (value, at) = next_relay(&mut server).await;
        assert_eq!(value, "b");
        assert_eq!(at - start, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(5)).await;
        presence.set_value("c".to_string());
        presence.set_value("d".to_string());
        let (value, at) = next_relay(&mut server).await;
        assert_eq!(value, "d");
        assert_eq!(at - start, Duration::from_millis(40));

        let (value, at) = next_relay(&mut server).await;
        assert_eq!(value, "d");
        assert_eq!(at - start, Duration::from_millis(1040));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_value_is_not_resent_early() {
        let (conn, mut server) = connected().await;
        let start = Instant::now();
        let presence = PresenceBroadcaster::new(
            &conn,
            "me",
            "a".to_string(),
            PresenceConfig::default(),
            |_| {},
        )
        .unwrap();
        next_relay(&mut server).await;

        presence.set_value("a".to_string());
        let (_, at) = next_relay(&mut server).await;
        assert_eq!(at - start, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_peers_and_ignores_self() {
        let (conn, server) = connected().await;
        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let presence = PresenceBroadcaster::new(
            &conn,
            "me",
            "mine".to_string(),
            PresenceConfig::default(),
            move |peers: &PresenceMap<String>| {
                let mut ids: Vec<String> = peers.keys().cloned().collect();
                ids.sort();
                sink.lock().push(ids);
            },
        )
        .unwrap();

        relay_from(&server, "me", "echo", 1);
        relay_from(&server, "bob", "hi", 2);
        relay_from(&server, "amy", "yo", 3);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(
            *seen.lock(),
            vec![vec!["bob".to_string()], vec!["amy".to_string(), "bob".to_string()]]
        );
        assert_eq!(presence.peers()["amy"].value, "yo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_expires() {
        let (conn, server) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let presence = PresenceBroadcaster::new(
            &conn,
            "me",
            Value::Null,
            PresenceConfig::default(),
            move |peers: &PresenceMap<Value>| sink.lock().push(peers.len()),
        )
        .unwrap();

        let value = to_value(&PresenceMessage {
            client: "bob".to_string(),
            value: Value::Bool(true),
        })
        .unwrap();
        let push = MessageFromDb::Push {
            key: Key::from("__presence"),
            value,
            seq: SequenceNumber(1),
        };
        assert!(server.send(encode_frame(&push, Encoding::Json).unwrap()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(presence.peers().len(), 1);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(presence.peers().len(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(presence.peers().is_empty());
        assert_eq!(*seen.lock(), vec![1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_everything() {
        let (conn, mut server) = connected().await;
        let calls = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&calls);
        let presence = PresenceBroadcaster::new(
            &conn,
            "me",
            "a".to_string(),
            PresenceConfig::default(),
            move |_: &PresenceMap<String>| *sink.lock() += 1,
        )
        .unwrap();
        next_relay(&mut server).await;

        presence.destroy();
        presence.destroy();
        relay_from(&server, "bob", "hi", 1);

        let more = tokio::time::timeout(Duration::from_secs(5), server.recv()).await;
        assert!(more.is_err());
        assert_eq!(*calls.lock(), 0);
    }
}
