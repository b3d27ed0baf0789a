//! Reconnecting connection to the log service.
//!
//! A [`Connection`] owns one socket at a time, an in-order outbound queue,
//! and the per-key subscription registry. While the socket is not open,
//! outbound messages are queued; once it opens, the queue is flushed in FIFO
//! order before any later message can be sent. When the socket closes, a
//! reconnect is scheduled after [`ConnectionConfig::reconnect_delay`] and
//! keeps being retried until [`Connection::disconnect`] is called.
//!
//! Inbound frames are decoded by frame type and delivered to subscribers of
//! the message's key. Live pushes for a key whose replay is still in flight
//! are held back and released after the replay. After a reconnect every
//! replaying subscription asks for a full replay again, so subscribers see
//! history from seq zero and must filter values they have already applied.
//!
//! Sockets are numbered from one in the order they open. [`Connection::send`]
//! reports the socket a message went out on (or will go out on), and
//! [`Connection::on_replay`] reports which socket a replay arrived on. A
//! message sent on an earlier socket whose effect is missing from a later
//! replay never reached the server.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use driftline_core::{
    decode_frame, encode_frame, Action, Encoding, Frame, Key, KeyedEventBus, Listener,
    ListenerId, Listeners, MessageFromDb, MessageToDb, RoomInfo, SequenceNumber, SequenceValue,
    Value,
};

use crate::config::ConnectionConfig;
use crate::error::{NetError, Result};
use crate::latency::PendingPing;
use crate::transport::{Connector, SocketEvent, SocketHandle};
use crate::websocket::WebSocketConnector;

/// Whether the socket is currently open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Where [`Connection::send`] put a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the open socket with this number.
    Sent { socket: u64 },
    /// Queued; flushed when the socket with this number opens.
    Queued { socket: u64 },
}

impl Delivery {
    /// Number of the socket that carries the message.
    pub fn socket(&self) -> u64 {
        match self {
            Delivery::Sent { socket } | Delivery::Queued { socket } => *socket,
        }
    }
}

/// A replay finished dispatching for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replayed {
    /// Number of the socket the replay arrived on.
    pub socket: u64,
    /// Seq of the last replayed entry, if the log was not empty.
    pub last_seq: Option<SequenceNumber>,
}

/// Options for [`Connection::subscribe_with`].
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// Request the key's full history from seq zero.
    pub replay: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { replay: true }
    }
}

/// Handle returned by a subscribe call, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    key: Key,
    value_id: ListenerId,
    size_id: Option<ListenerId>,
    replay: bool,
}

impl Subscription {
    /// The subscribed key.
    pub fn key(&self) -> &Key {
        &self.key
    }
}

#[derive(Debug, Clone)]
struct Target {
    url: String,
    encoding: Encoding,
}

struct State {
    status: ConnectionStatus,
    target: Option<Target>,
    queue: VecDeque<MessageToDb>,
    socket: Option<mpsc::UnboundedSender<Frame>>,
    /// Bumped every time a socket is installed; stale reader tasks compare
    /// against it and stand down.
    generation: u64,
    /// Number of sockets opened so far.
    opened: u64,
    reconnect: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    replay_keys: HashMap<Key, usize>,
    /// Keys with a `get` in flight on the current socket. Live pushes for
    /// them are held back until the replay arrives.
    awaiting_init: HashMap<Key, AwaitingInit>,
    ping: Option<PendingPing>,
    closed: bool,
}

#[derive(Default)]
struct AwaitingInit {
    outstanding: usize,
    held: Vec<SequenceValue>,
}

impl State {
    fn note_sent(&mut self, message: &MessageToDb) {
        if let MessageToDb::Get { key, .. } = message {
            self.awaiting_init.entry(key.clone()).or_default().outstanding += 1;
        }
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    state: parking_lot::Mutex<State>,
    values: KeyedEventBus<SequenceValue>,
    sizes: KeyedEventBus<usize>,
    replays: KeyedEventBus<Replayed>,
    messages: Listeners<MessageFromDb>,
    statuses: Listeners<ConnectionStatus>,
}

/// A shared, reconnecting connection. Cloning is cheap and every clone
/// refers to the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Connection")
            .field("status", &state.status)
            .field("queued", &state.queue.len())
            .field("generation", &state.generation)
            .finish()
    }
}

impl Connection {
    /// Create a disconnected connection that opens sockets with `connector`.
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state: parking_lot::Mutex::new(State {
                    status: ConnectionStatus::Disconnected,
                    target: None,
                    queue: VecDeque::new(),
                    socket: None,
                    generation: 0,
                    opened: 0,
                    reconnect: None,
                    reader: None,
                    replay_keys: HashMap::new(),
                    awaiting_init: HashMap::new(),
                    ping: None,
                    closed: false,
                }),
                values: KeyedEventBus::new(),
                sizes: KeyedEventBus::new(),
                replays: KeyedEventBus::new(),
                messages: Listeners::new(),
                statuses: Listeners::new(),
            }),
        }
    }

    /// Create a connection over WebSockets.
    pub fn websocket(config: ConnectionConfig) -> Self {
        Self::new(Arc::new(WebSocketConnector::new()), config)
    }

    /// Open a socket to `url`.
    ///
    /// Any existing socket is replaced. Resolves once the new socket is open
    /// and the outbound queue has been flushed. If the socket fails to open
    /// the error is returned and a reconnect is scheduled regardless.
    pub async fn connect(&self, url: impl Into<String>, encoding: Encoding) -> Result<()> {
        let target = Target {
            url: url.into(),
            encoding,
        };
        {
            let mut state = self.inner.state.lock();
            state.closed = false;
            state.target = Some(target.clone());
            if let Some(reconnect) = state.reconnect.take() {
                reconnect.abort();
            }
        }

        match Inner::open(&self.inner, &target).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(url = %target.url, error = %e, "connect failed");
                let mut state = self.inner.state.lock();
                if !state.closed {
                    Inner::schedule_reconnect(&self.inner, &mut state);
                }
                Err(e)
            }
        }
    }

    /// Open a socket to a room's endpoint using the configured encoding.
    pub async fn connect_room(&self, room: &RoomInfo) -> Result<()> {
        self.connect(room.socket_url.clone(), self.inner.config.encoding)
            .await
    }

    /// Close the socket for good.
    ///
    /// Suppresses further reconnects, discards queued messages, and removes
    /// every subscription. A later [`connect`](Self::connect) starts afresh.
    pub fn disconnect(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            if let Some(reconnect) = state.reconnect.take() {
                reconnect.abort();
            }
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            state.socket = None;
            state.queue.clear();
            state.replay_keys.clear();
            state.awaiting_init.clear();
            state.ping = None;
            state.generation += 1;
            let changed = state.status.is_connected();
            state.status = ConnectionStatus::Disconnected;
            changed
        };
        self.inner.values.clear();
        self.inner.sizes.clear();
        self.inner.replays.clear();
        info!("disconnected");
        if changed {
            self.inner.statuses.dispatch(&ConnectionStatus::Disconnected);
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Number of messages waiting for the socket to open.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Send a message, or queue it if the socket is not open.
    pub fn send(&self, message: MessageToDb) -> Result<Delivery> {
        let mut state = self.inner.state.lock();
        if state.status.is_connected() {
            if let (Some(socket), Some(target)) = (&state.socket, &state.target) {
                let frame = encode_frame(&message, target.encoding)?;
                if socket.send(frame).is_ok() {
                    trace!(key = ?message.key(), socket = state.opened, "sent");
                    state.note_sent(&message);
                    return Ok(Delivery::Sent {
                        socket: state.opened,
                    });
                }
            }
        }
        trace!(key = ?message.key(), queued = state.queue.len() + 1, "queued");
        state.queue.push_back(message);
        Ok(Delivery::Queued {
            socket: state.opened + 1,
        })
    }

    /// Push a value to a key.
    pub fn push(&self, key: &Key, value: Value, action: Action) -> Result<Delivery> {
        self.send(MessageToDb::push(key.clone(), value, action))
    }

    /// Number of sockets opened so far. The open socket, if any, carries
    /// this number.
    pub fn sockets_opened(&self) -> u64 {
        self.inner.state.lock().opened
    }

    /// Subscribe to a key with full replay.
    pub fn subscribe<F>(&self, key: &Key, listener: F) -> Result<Subscription>
    where
        F: Fn(&SequenceValue) + Send + Sync + 'static,
    {
        self.subscribe_with(key, Arc::new(listener), None, SubscribeOptions::default())
    }

    /// Subscribe to a key.
    ///
    /// `size_listener` receives the number of entries the server retains for
    /// the key. Unless `options.replay` is false a `get` from seq zero is
    /// sent, and the replayed values reach the listener in order before any
    /// later live value.
    pub fn subscribe_with(
        &self,
        key: &Key,
        listener: Listener<SequenceValue>,
        size_listener: Option<Listener<usize>>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let value_id = self.inner.values.subscribe(key, listener);
        let size_id = size_listener.map(|l| self.inner.sizes.subscribe(key, l));
        if options.replay {
            *self
                .inner
                .state
                .lock()
                .replay_keys
                .entry(key.clone())
                .or_default() += 1;
            self.send(MessageToDb::get(key.clone()))?;
        }
        debug!(key = %key, replay = options.replay, "subscribed");
        Ok(Subscription {
            key: key.clone(),
            value_id,
            size_id,
            replay: options.replay,
        })
    }

    /// Remove a subscription. Returns false if it was already removed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let removed = self
            .inner
            .values
            .unsubscribe(&subscription.key, subscription.value_id);
        if let Some(size_id) = subscription.size_id {
            self.inner.sizes.unsubscribe(&subscription.key, size_id);
        }
        if removed && subscription.replay {
            let mut state = self.inner.state.lock();
            if let Some(count) = state.replay_keys.get_mut(&subscription.key) {
                *count -= 1;
                if *count == 0 {
                    state.replay_keys.remove(&subscription.key);
                }
            }
        }
        if removed {
            debug!(key = %subscription.key, "unsubscribed");
        }
        removed
    }

    /// Observe the end of each replay of `key`, after its values (and any
    /// pushes held back during it) have been dispatched.
    pub fn on_replay<F>(&self, key: &Key, listener: F) -> ListenerId
    where
        F: Fn(&Replayed) + Send + Sync + 'static,
    {
        self.inner.replays.subscribe(key, Arc::new(listener))
    }

    /// Remove a listener added with [`on_replay`](Self::on_replay).
    pub fn remove_replay_listener(&self, key: &Key, id: ListenerId) -> bool {
        self.inner.replays.unsubscribe(key, id)
    }

    /// Observe every decoded inbound message before per-key dispatch.
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MessageFromDb) + Send + Sync + 'static,
    {
        self.inner.messages.add(Arc::new(listener))
    }

    /// Observe status transitions.
    pub fn on_status<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.statuses.add(Arc::new(listener))
    }

    /// Remove a listener added with [`on_message`](Self::on_message) or
    /// [`on_status`](Self::on_status).
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.messages.remove(id) || self.inner.statuses.remove(id)
    }

    /// Measure one round trip to the server.
    ///
    /// A call made while a ping is outstanding shares that ping's result.
    pub async fn test_latency(&self) -> Result<Duration> {
        let waiter = {
            let mut state = self.inner.state.lock();
            if !state.status.is_connected() {
                return Err(NetError::NotConnected);
            }
            match &state.ping {
                Some(ping) => ping.waiter(),
                None => {
                    let ping = PendingPing::start(rand::random());
                    let waiter = ping.waiter();
                    let request = MessageToDb::Ping {
                        nonce: Some(ping.nonce()),
                    };
                    let encoding = state
                        .target
                        .as_ref()
                        .map(|t| t.encoding)
                        .unwrap_or_default();
                    let frame = encode_frame(&request, encoding)?;
                    let sent = state
                        .socket
                        .as_ref()
                        .map(|socket| socket.send(frame).is_ok())
                        .unwrap_or(false);
                    if !sent {
                        return Err(NetError::NotConnected);
                    }
                    state.ping = Some(ping);
                    waiter
                }
            }
        };
        waiter.wait().await
    }
}

impl Inner {
    async fn open(self: &Arc<Self>, target: &Target) -> Result<()> {
        let url = target.encoding.apply_to_url(&target.url);
        debug!(url = %url, "opening socket");
        let SocketHandle { sender, events } = self.connector.connect(&url).await?;

        let (flushed, generation) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NetError::Closed);
            }
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            // Detach rather than abort: this may be running on the reconnect task.
            state.reconnect.take();
            state.generation += 1;
            state.opened += 1;
            let generation = state.generation;

            let mut outbound: Vec<MessageToDb> = Vec::new();
            if state.opened > 1 {
                let mut keys: Vec<&Key> = state.replay_keys.keys().collect();
                keys.sort();
                for key in keys {
                    let already_queued = state.queue.iter().any(
                        |m| matches!(m, MessageToDb::Get { key: queued, .. } if queued == key),
                    );
                    if !already_queued {
                        outbound.push(MessageToDb::get(key.clone()));
                    }
                }
            }
            outbound.extend(state.queue.drain(..));

            state.awaiting_init.clear();
            let mut flushed = 0;
            for message in &outbound {
                match encode_frame(message, target.encoding) {
                    Ok(frame) => {
                        if sender.send(frame).is_ok() {
                            state.note_sent(message);
                            flushed += 1;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping unencodable message"),
                }
            }

            state.socket = Some(sender);
            state.status = ConnectionStatus::Connected;
            state.reader = Some(tokio::spawn(read_loop(
                Arc::downgrade(self),
                generation,
                events,
            )));
            (flushed, generation)
        };

        info!(url = %target.url, generation, flushed, "connected");
        self.statuses.dispatch(&ConnectionStatus::Connected);
        Ok(())
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut State) {
        let Some(target) = state.target.clone() else {
            return;
        };
        let delay = self.config.reconnect_delay;
        let weak = Arc::downgrade(self);
        info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        if let Some(previous) = state.reconnect.take() {
            previous.abort();
        }
        state.reconnect = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.state.lock().closed {
                    return;
                }
                match inner.open(&target).await {
                    Ok(()) => return,
                    Err(NetError::Closed) => return,
                    Err(e) => warn!(error = %e, "reconnect failed, retrying"),
                }
            }
        }));
    }

    fn handle_frame(&self, frame: &Frame) {
        let message: MessageFromDb = match decode_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "dropping undecodable frame");
                return;
            }
        };

        self.messages.dispatch(&message);

        match message {
            MessageFromDb::Push { key, value, seq } => {
                let value = SequenceValue { value, seq };
                {
                    let mut state = self.state.lock();
                    if let Some(awaiting) = state.awaiting_init.get_mut(&key) {
                        trace!(key = %key, seq = seq.0, "holding push until init");
                        awaiting.held.push(value);
                        return;
                    }
                }
                self.values.dispatch(&key, &value);
            }
            MessageFromDb::Init { key, data } => {
                let (held, socket) = {
                    let mut state = self.state.lock();
                    let socket = state.opened;
                    let pending = &mut state.awaiting_init;
                    let held = match pending.get_mut(&key) {
                        Some(awaiting) if awaiting.outstanding > 1 => {
                            awaiting.outstanding -= 1;
                            std::mem::take(&mut awaiting.held)
                        }
                        Some(_) => pending
                            .remove(&key)
                            .map(|awaiting| awaiting.held)
                            .unwrap_or_default(),
                        None => Vec::new(),
                    };
                    (held, socket)
                };
                trace!(key = %key, entries = data.len(), held = held.len(), "init");
                let replayed = data.last().map(|value| value.seq);
                for value in &data {
                    self.values.dispatch(&key, value);
                }
                for value in held
                    .iter()
                    .filter(|value| replayed.map_or(true, |last| value.seq > last))
                {
                    self.values.dispatch(&key, value);
                }
                self.replays.dispatch(
                    &key,
                    &Replayed {
                        socket,
                        last_seq: replayed,
                    },
                );
            }
            MessageFromDb::StreamSize { key, size } => {
                self.sizes.dispatch(&key, &size);
            }
            MessageFromDb::Pong { nonce } => {
                let ping = {
                    let mut state = self.state.lock();
                    let answered = state.ping.as_ref().map_or(false, |p| p.matches(nonce));
                    if answered {
                        state.ping.take()
                    } else {
                        None
                    }
                };
                if let Some(ping) = ping {
                    let elapsed = ping.complete();
                    debug!(latency_ms = elapsed.as_millis() as u64, "pong");
                }
            }
            MessageFromDb::Error { message } => {
                warn!(message = %message, "server error");
            }
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        let changed = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.reader.take();
            state.socket = None;
            state.awaiting_init.clear();
            state.ping = None;
            let changed = state.status.is_connected();
            state.status = ConnectionStatus::Disconnected;
            if !state.closed {
                Inner::schedule_reconnect(self, &mut state);
            }
            changed
        };
        match reason {
            Some(reason) => warn!(error = %reason, "socket failed"),
            None => info!("socket closed"),
        }
        if changed {
            self.statuses.dispatch(&ConnectionStatus::Disconnected);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(reconnect) = state.reconnect.take() {
            reconnect.abort();
        }
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    weak: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
) {
    loop {
        let event = events.recv().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            Some(SocketEvent::Frame(frame)) => {
                if inner.state.lock().generation != generation {
                    return;
                }
                inner.handle_frame(&frame);
            }
            Some(SocketEvent::Error(reason)) => {
                inner.handle_close(generation, Some(reason));
                return;
            }
            Some(SocketEvent::Closed) | None => {
                inner.handle_close(generation, None);
                return;
            }
        }
    }
}
