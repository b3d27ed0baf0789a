//! A single shared value.
//!
//! Every write replaces the key's log, so a new subscriber replays exactly
//! one entry. Writes are rate limited: the first write in a quiet period is
//! sent immediately; writes inside the following debounce window are
//! collapsed into one trailing send of the latest value.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use driftline_core::{from_value, to_value, Action, Key, SequenceNumber, SequenceValue};
use driftline_net::{Connection, Subscription};

use crate::config::StateListenerConfig;
use crate::error::Result;

type StateCallback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct ListenerState<T> {
    current: Option<T>,
    latest_local: Option<T>,
    last_sent: Option<Instant>,
    trailing: Option<JoinHandle<()>>,
    last_seq: SequenceNumber,
    destroyed: bool,
}

struct StateInner<T> {
    connection: Connection,
    key: Key,
    config: StateListenerConfig,
    state: Mutex<ListenerState<T>>,
    callback: StateCallback<T>,
    subscription: Mutex<Option<Subscription>>,
}

/// Shares one value through a key.
pub struct StateListener<T> {
    inner: Arc<StateInner<T>>,
}

impl<T> fmt::Debug for StateListener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateListener")
            .field("key", &self.inner.key)
            .field("last_seq", &self.inner.state.lock().last_seq)
            .finish()
    }
}

impl<T> StateListener<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Subscribe to `key`. `callback` receives every value, local or remote.
    pub fn new<F>(
        connection: &Connection,
        key: impl Into<Key>,
        config: StateListenerConfig,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let inner = Arc::new(StateInner {
            connection: connection.clone(),
            key: key.into(),
            config,
            state: Mutex::new(ListenerState {
                current: None,
                latest_local: None,
                last_sent: None,
                trailing: None,
                last_seq: SequenceNumber::ZERO,
                destroyed: false,
            }),
            callback: Box::new(callback),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = connection.subscribe(&inner.key, move |value| {
            if let Some(inner) = weak.upgrade() {
                inner.on_remote_value(value);
            }
        })?;
        *inner.subscription.lock() = Some(subscription);
        Ok(Self { inner })
    }

    /// Set the value locally and share it.
    ///
    /// The callback runs immediately. Ignored once destroyed. Must be called
    /// within a tokio runtime.
    pub fn set_state_optimistic(&self, value: T) {
        let inner = &self.inner;
        let shown = value.clone();

        let send_now = {
            let mut state = inner.state.lock();
            if state.destroyed {
                return;
            }
            state.current = Some(value.clone());
            let now = Instant::now();
            let window_open = state
                .last_sent
                .map_or(false, |sent| now.duration_since(sent) < inner.config.debounce);
            if window_open {
                state.latest_local = Some(value);
                if state.trailing.is_none() {
                    let due = state
                        .last_sent
                        .map_or(now, |sent| sent + inner.config.debounce);
                    state.trailing = Some(tokio::spawn(trailing_send(Arc::downgrade(inner), due)));
                }
                None
            } else {
                if let Some(trailing) = state.trailing.take() {
                    trailing.abort();
                }
                state.latest_local = None;
                state.last_sent = Some(now);
                Some(value)
            }
        };

        (inner.callback)(&shown);
        if let Some(value) = send_now {
            inner.send(&value);
        }
    }

    /// The most recent value, local or remote.
    pub fn get(&self) -> Option<T> {
        self.inner.state.lock().current.clone()
    }

    /// Stop listening and cancel any pending send. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl<T> Drop for StateListener<T> {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<T> StateInner<T> {
    fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            if let Some(trailing) = state.trailing.take() {
                trailing.abort();
            }
        }
        if let Some(subscription) = self.subscription.lock().take() {
            self.connection.unsubscribe(&subscription);
        }
    }
}

impl<T> StateInner<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn send(&self, value: &T) {
        let result = to_value(value)
            .map_err(|e| e.to_string())
            .and_then(|v| {
                self.connection
                    .push(&self.key, v, Action::Replace)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!(key = %self.key, error = %e, "state not sent");
        }
    }

    fn on_remote_value(&self, remote: &SequenceValue) {
        let value: T = match from_value(&remote.value) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %self.key, seq = %remote.seq, error = %e, "unexpected state payload");
                return;
            }
        };
        {
            let mut state = self.state.lock();
            if state.destroyed || remote.seq <= state.last_seq {
                return;
            }
            state.last_seq = remote.seq;
            state.current = Some(value.clone());
        }
        (self.callback)(&value);
    }
}

async fn trailing_send<T>(weak: Weak<StateInner<T>>, due: Instant)
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    tokio::time::sleep_until(due).await;
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let value = {
        let mut state = inner.state.lock();
        state.trailing = None;
        if state.destroyed {
            return;
        }
        state.last_sent = Some(Instant::now());
        state.latest_local.take()
    };
    if let Some(value) = value {
        debug!(key = %inner.key, "trailing state send");
        inner.send(&value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftline_core::{decode_frame, encode_frame, Encoding, MessageFromDb, MessageToDb, Value};
    use driftline_net::memory::{MemoryNetwork, ServerSocket};
    use driftline_net::ConnectionConfig;
    use std::time::Duration;

    async fn connected() -> (Connection, ServerSocket) {
        let network = MemoryNetwork::new();
        let mut accepted = network.listen();
        let conn = Connection::new(Arc::new(network.connector()), ConnectionConfig::default());
        conn.connect("mem://room", Encoding::Json).await.unwrap();
        let server = accepted.recv().await.unwrap();
        (conn, server)
    }

    async fn next_replace(server: &mut ServerSocket) -> (i64, Instant) {
        loop {
            let frame = server.recv().await.unwrap();
            let at = Instant::now();
            if let MessageToDb::Push {
                value,
                action: Action::Replace,
                ..
            } = decode_frame(&frame).unwrap()
            {
                return (from_value(&value).unwrap(), at);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_leading_and_trailing_sends() {
        let (conn, mut server) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let shared = StateListener::new(
            &conn,
            "slider",
            StateListenerConfig::default(),
            move |v: &i64| sink.lock().push(*v),
        )
        .unwrap();
        let start = Instant::now();

        shared.set_state_optimistic(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        shared.set_state_optimistic(2);
        shared.set_state_optimistic(3);

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(shared.get(), Some(3));

        let (value, at) = next_replace(&mut server).await;
        assert_eq!((value, at - start), (1, Duration::ZERO));
        let (value, at) = next_replace(&mut server).await;
        assert_eq!((value, at - start), (3, Duration::from_millis(50)));

        let more =
            tokio::time::timeout(Duration::from_millis(200), next_replace(&mut server)).await;
        assert!(more.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_values_reach_callback_once() {
        let (conn, server) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _shared = StateListener::new(
            &conn,
            "slider",
            StateListenerConfig::default(),
            move |v: &i64| sink.lock().push(*v),
        )
        .unwrap();

        let init = MessageFromDb::Init {
            key: Key::from("slider"),
            data: Vec::new(),
        };
        assert!(server.send(encode_frame(&init, Encoding::Json).unwrap()));
        for seq in [4u64, 4, 5] {
            let push = MessageFromDb::Push {
                key: Key::from("slider"),
                value: Value::Integer((seq as i64 * 10).into()),
                seq: SequenceNumber(seq),
            };
            assert!(server.send(encode_frame(&push, Encoding::Json).unwrap()));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(*seen.lock(), vec![40, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_trailing_send() {
        let (conn, mut server) = connected().await;
        let shared =
            StateListener::new(&conn, "slider", StateListenerConfig::default(), |_: &i64| {})
                .unwrap();

        shared.set_state_optimistic(1);
        shared.set_state_optimistic(2);
        next_replace(&mut server).await;
        shared.destroy();

        let more =
            tokio::time::timeout(Duration::from_millis(200), next_replace(&mut server)).await;
        assert!(more.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroyed_listener_ignores_local_writes() {
        let (conn, mut server) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let shared = StateListener::new(
            &conn,
            "slider",
            StateListenerConfig::default(),
            move |v: &i64| sink.lock().push(*v),
        )
        .unwrap();

        shared.destroy();
        shared.set_state_optimistic(7);

        assert!(seen.lock().is_empty());
        assert_eq!(shared.get(), None);
        let sent =
            tokio::time::timeout(Duration::from_millis(200), next_replace(&mut server)).await;
        assert!(sent.is_err());
    }
}
