//! An in-memory log server.
//!
//! [`MockServer`] accepts sockets from a [`MemoryNetwork`] and implements
//! the log service contract for every room:
//!
//! - one sequence counter per room, shared by all keys;
//! - `append` retains, `replace` clears then retains, `relay` is delivered
//!   but never retained;
//! - every push with a new sequence number is broadcast to all sockets in
//!   the room, pusher included;
//! - after an `append` leaves more than one entry, the pusher alone receives
//!   `stream_size`;
//! - `compact{seq}` drops entries up to `seq` and retains the pushed value
//!   as the baseline at `seq`, without a new sequence number and without a
//!   broadcast. A compaction at or below the current baseline is ignored;
//! - `get{seq}` answers with `init` holding the entries after `seq`.
//!
//! The room is the last path segment of the socket URL; a `cbor=true` query
//! selects binary replies.
//!
//! [`MockServer::lose_next_push`] makes the server discard a push and hang
//! up on its sender, the way a socket dying mid-write looks to the client.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use driftline_core::codec::CBOR_QUERY_PARAM;
use driftline_core::{
    decode_frame, encode_frame, Action, Encoding, Frame, Key, MessageFromDb, MessageToDb,
    SequenceNumber, SequenceValue,
};
use driftline_net::memory::{MemoryConnector, MemoryNetwork, ServerSocket, ServerWriter};
use driftline_net::{Connection, ConnectionConfig};

struct Client {
    writer: ServerWriter,
    encoding: Encoding,
}

impl Client {
    fn send(&self, message: &MessageFromDb) {
        match encode_frame(message, self.encoding) {
            Ok(frame) => {
                self.writer.send(frame);
            }
            Err(e) => warn!(error = %e, "reply not encoded"),
        }
    }
}

#[derive(Default)]
struct Room {
    next_seq: u64,
    logs: HashMap<Key, Vec<SequenceValue>>,
    baselines: HashMap<Key, SequenceNumber>,
    clients: HashMap<u64, Client>,
}

impl Room {
    fn assign_seq(&mut self) -> SequenceNumber {
        self.next_seq += 1;
        SequenceNumber(self.next_seq)
    }

    fn broadcast(&self, message: &MessageFromDb) {
        for client in self.clients.values() {
            client.send(message);
        }
    }
}

#[derive(Default)]
struct ServerState {
    rooms: HashMap<String, Room>,
    received: Vec<(String, MessageToDb)>,
    /// Pushes still to be discarded.
    lose_pushes: usize,
}

/// What to do with a socket after one of its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    HangUp,
}

/// In-memory implementation of the log service.
pub struct MockServer {
    network: Arc<MemoryNetwork>,
    state: Arc<Mutex<ServerState>>,
    acceptor: JoinHandle<()>,
}

impl fmt::Debug for MockServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockServer")
            .field("rooms", &state.rooms.len())
            .field("received", &state.received.len())
            .finish()
    }
}

impl MockServer {
    /// Start a server on a fresh network. Must be called within a tokio
    /// runtime.
    pub fn start() -> Self {
        Self::with_network(MemoryNetwork::new())
    }

    /// Start a server accepting sockets from `network`.
    pub fn with_network(network: Arc<MemoryNetwork>) -> Self {
        let state = Arc::new(Mutex::new(ServerState::default()));
        let accepted = network.listen();
        let acceptor = tokio::spawn(accept_loop(accepted, Arc::clone(&state)));
        Self {
            network,
            state,
            acceptor,
        }
    }

    /// Socket URL for a room.
    pub fn url(room: &str) -> String {
        format!("mem://driftline/{room}")
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    pub fn connector(&self) -> MemoryConnector {
        self.network.connector()
    }

    /// A new, not yet connected client.
    pub fn client(&self, config: ConnectionConfig) -> Connection {
        Connection::new(Arc::new(self.connector()), config)
    }

    /// Retained entries of a key.
    pub fn log(&self, room: &str, key: &str) -> Vec<SequenceValue> {
        self.state
            .lock()
            .rooms
            .get(room)
            .and_then(|r| r.logs.get(&Key::from(key)))
            .cloned()
            .unwrap_or_default()
    }

    /// Every message received so far, with the room it was sent to.
    pub fn received(&self) -> Vec<(String, MessageToDb)> {
        self.state.lock().received.clone()
    }

    /// Number of pushes received for a key.
    pub fn pushes(&self, key: &str) -> usize {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(_, m)| matches!(m, MessageToDb::Push { key: k, .. } if k.as_str() == key))
            .count()
    }

    /// Sockets currently attached to a room.
    pub fn clients(&self, room: &str) -> usize {
        self.state
            .lock()
            .rooms
            .get(room)
            .map_or(0, |r| r.clients.len())
    }

    /// Close every live socket. Returns the number closed.
    pub fn drop_all(&self) -> usize {
        let closed = self.network.drop_all();
        let mut state = self.state.lock();
        for room in state.rooms.values_mut() {
            room.clients.clear();
        }
        debug!(closed, "dropped all sockets");
        closed
    }

    /// Refuse (or accept again) new sockets.
    pub fn set_refusing(&self, refusing: bool) {
        self.network.set_refusing(refusing);
    }

    /// Discard the next push from any client and close that client's
    /// socket without replying. Anything else the client already wrote to
    /// the socket is discarded too.
    pub fn lose_next_push(&self) {
        self.state.lock().lose_pushes += 1;
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.network.drop_all();
    }
}

/// Room name and reply encoding for a socket URL.
pub fn parse_socket_url(url: &str) -> (String, Encoding) {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };
    let room = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let cbor = query.map_or(false, |q| q.split('&').any(|p| p == CBOR_QUERY_PARAM));
    let encoding = if cbor { Encoding::Cbor } else { Encoding::Json };
    (room, encoding)
}

async fn accept_loop(
    mut accepted: mpsc::UnboundedReceiver<ServerSocket>,
    state: Arc<Mutex<ServerState>>,
) {
    while let Some(socket) = accepted.recv().await {
        let (room, encoding) = parse_socket_url(socket.url());
        trace!(socket = socket.id(), %room, ?encoding, "socket accepted");
        state.lock().rooms.entry(room.clone()).or_default().clients.insert(
            socket.id(),
            Client {
                writer: socket.writer(),
                encoding,
            },
        );
        tokio::spawn(serve_socket(socket, room, encoding, Arc::clone(&state)));
    }
}

async fn serve_socket(
    mut socket: ServerSocket,
    room: String,
    encoding: Encoding,
    state: Arc<Mutex<ServerState>>,
) {
    let id = socket.id();
    let reply_to = Client {
        writer: socket.writer(),
        encoding,
    };
    while let Some(frame) = socket.recv().await {
        if handle_frame(&state, &room, &reply_to, &frame) == Flow::HangUp {
            debug!(socket = id, "push lost; hanging up");
            socket.close();
            break;
        }
    }
    if let Some(joined) = state.lock().rooms.get_mut(&room) {
        joined.clients.remove(&id);
    }
    trace!(socket = id, "socket finished");
}

fn handle_frame(
    state: &Mutex<ServerState>,
    room_name: &str,
    reply_to: &Client,
    frame: &Frame,
) -> Flow {
    let message: MessageToDb = match decode_frame(frame) {
        Ok(message) => message,
        Err(e) => {
            reply_to.send(&MessageFromDb::Error {
                message: format!("unreadable message: {e}"),
            });
            return Flow::Continue;
        }
    };

    let mut state = state.lock();
    if state.lose_pushes > 0 && matches!(message, MessageToDb::Push { .. }) {
        state.lose_pushes -= 1;
        return Flow::HangUp;
    }
    state.received.push((room_name.to_string(), message.clone()));
    let room = state.rooms.entry(room_name.to_string()).or_default();

    match message {
        MessageToDb::Push { key, value, action } => match action {
            Action::Append => {
                let seq = room.assign_seq();
                let log = room.logs.entry(key.clone()).or_default();
                log.push(SequenceValue::new(value.clone(), seq));
                let size = log.len();
                room.broadcast(&MessageFromDb::Push {
                    key: key.clone(),
                    value,
                    seq,
                });
                if size > 1 {
                    reply_to.send(&MessageFromDb::StreamSize { key, size });
                }
            }
            Action::Replace => {
                let seq = room.assign_seq();
                room.logs
                    .insert(key.clone(), vec![SequenceValue::new(value.clone(), seq)]);
                room.broadcast(&MessageFromDb::Push { key, value, seq });
            }
            Action::Relay => {
                let seq = room.assign_seq();
                room.broadcast(&MessageFromDb::Push { key, value, seq });
            }
            Action::Compact { seq } => {
                let baseline = room.baselines.get(&key).copied().unwrap_or(SequenceNumber::ZERO);
                if seq <= baseline {
                    debug!(%key, %seq, %baseline, "stale compaction ignored");
                    return Flow::Continue;
                }
                let log = room.logs.entry(key.clone()).or_default();
                log.retain(|entry| entry.seq > seq);
                log.insert(0, SequenceValue::new(value, seq));
                room.baselines.insert(key.clone(), seq);
                debug!(%key, %seq, retained = log.len(), "log compacted");
            }
        },
        MessageToDb::Get { key, seq } => {
            let data = room
                .logs
                .get(&key)
                .map(|log| log.iter().filter(|entry| entry.seq > seq).cloned().collect())
                .unwrap_or_default();
            reply_to.send(&MessageFromDb::Init { key, data });
        }
        MessageToDb::Ping { nonce } => reply_to.send(&MessageFromDb::Pong { nonce }),
    }
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators;
    use driftline_core::{to_value, Value};
    use driftline_net::Connector;
    use proptest::prelude::*;

    struct RawClient {
        sender: mpsc::UnboundedSender<Frame>,
        events: mpsc::UnboundedReceiver<driftline_net::SocketEvent>,
    }

    impl RawClient {
        async fn open(server: &MockServer, url: &str) -> Self {
            let handle = server.connector().connect(url).await.unwrap();
            Self {
                sender: handle.sender,
                events: handle.events,
            }
        }

        fn send(&self, message: &MessageToDb) {
            self.sender
                .send(encode_frame(message, Encoding::Json).unwrap())
                .unwrap();
        }

        async fn next(&mut self) -> MessageFromDb {
            match self.events.recv().await.unwrap() {
                driftline_net::SocketEvent::Frame(frame) => decode_frame(&frame).unwrap(),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    fn int(n: i64) -> Value {
        Value::Integer(n.into())
    }

    #[test]
    fn test_parse_socket_url() {
        assert_eq!(
            parse_socket_url("mem://driftline/lobby"),
            ("lobby".to_string(), Encoding::Json)
        );
        assert_eq!(
            parse_socket_url("ws://host/room/abc/connect/?x=1&cbor=true"),
            ("connect".to_string(), Encoding::Cbor)
        );
    }

    #[tokio::test]
    async fn test_append_broadcast_and_stream_size() {
        let server = MockServer::start();
        let url = MockServer::url("r");
        let mut a = RawClient::open(&server, &url).await;
        let mut b = RawClient::open(&server, &url).await;

        a.send(&MessageToDb::push("k", int(1), Action::Append));
        assert!(matches!(a.next().await, MessageFromDb::Push { seq: SequenceNumber(1), .. }));
        assert!(matches!(b.next().await, MessageFromDb::Push { seq: SequenceNumber(1), .. }));

        a.send(&MessageToDb::push("k", int(2), Action::Append));
        assert!(matches!(a.next().await, MessageFromDb::Push { seq: SequenceNumber(2), .. }));
        assert_eq!(
            a.next().await,
            MessageFromDb::StreamSize {
                key: Key::from("k"),
                size: 2
            }
        );
        assert!(matches!(b.next().await, MessageFromDb::Push { seq: SequenceNumber(2), .. }));
        assert_eq!(server.log("r", "k").len(), 2);
    }

    #[tokio::test]
    async fn test_relay_and_replace() {
        let server = MockServer::start();
        let mut a = RawClient::open(&server, &MockServer::url("r")).await;

        a.send(&MessageToDb::push("p", int(7), Action::Relay));
        assert!(matches!(a.next().await, MessageFromDb::Push { seq: SequenceNumber(1), .. }));
        assert!(server.log("r", "p").is_empty());

        a.send(&MessageToDb::push("s", int(1), Action::Append));
        a.send(&MessageToDb::push("s", int(2), Action::Replace));
        a.next().await;
        a.next().await;
        assert_eq!(server.log("r", "s"), vec![SequenceValue::new(int(2), 3u64)]);
    }

    #[tokio::test]
    async fn test_compaction_and_get() {
        let server = MockServer::start();
        let mut a = RawClient::open(&server, &MockServer::url("r")).await;
        for n in 1..=4 {
            a.send(&MessageToDb::push("k", int(n), Action::Append));
        }
        a.send(&MessageToDb::push(
            "k",
            to_value(&"snapshot").unwrap(),
            Action::Compact {
                seq: SequenceNumber(3),
            },
        ));
        a.send(&MessageToDb::Get {
            key: Key::from("k"),
            seq: SequenceNumber::ZERO,
        });

        let init = loop {
            if let MessageFromDb::Init { data, .. } = a.next().await {
                break data;
            }
        };
        assert_eq!(
            init,
            vec![
                SequenceValue::new(to_value(&"snapshot").unwrap(), 3u64),
                SequenceValue::new(int(4), 4u64),
            ]
        );

        // A later compaction at an older seq changes nothing.
        a.send(&MessageToDb::push(
            "k",
            int(0),
            Action::Compact {
                seq: SequenceNumber(2),
            },
        ));
        a.send(&MessageToDb::Get {
            key: Key::from("k"),
            seq: SequenceNumber(3),
        });
        let init = loop {
            if let MessageFromDb::Init { data, .. } = a.next().await {
                break data;
            }
        };
        assert_eq!(init, vec![SequenceValue::new(int(4), 4u64)]);
    }

    #[tokio::test]
    async fn test_ping_and_bad_frame() {
        let server = MockServer::start();
        let mut a = RawClient::open(&server, &MockServer::url("r")).await;
        a.send(&MessageToDb::Ping { nonce: Some(5) });
        assert_eq!(a.next().await, MessageFromDb::Pong { nonce: Some(5) });

        a.sender.send(Frame::Text("{nope".into())).unwrap();
        assert!(matches!(a.next().await, MessageFromDb::Error { .. }));
    }

    #[tokio::test]
    async fn test_cbor_clients_get_binary_replies() {
        let server = MockServer::start();
        let url = Encoding::Cbor.apply_to_url(&MockServer::url("r"));
        let mut a = RawClient::open(&server, &url).await;
        a.send(&MessageToDb::Ping { nonce: None });
        match a.events.recv().await.unwrap() {
            driftline_net::SocketEvent::Frame(frame) => assert!(matches!(frame, Frame::Binary(_))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lost_push_hangs_up_on_sender() {
        let server = MockServer::start();
        let url = MockServer::url("r");
        let mut a = RawClient::open(&server, &url).await;
        let mut b = RawClient::open(&server, &url).await;

        server.lose_next_push();
        a.send(&MessageToDb::push("k", int(1), Action::Append));
        assert!(matches!(
            a.events.recv().await,
            Some(driftline_net::SocketEvent::Closed)
        ));
        assert!(server.log("r", "k").is_empty());
        assert_eq!(server.pushes("k"), 0);

        b.send(&MessageToDb::push("k", int(2), Action::Append));
        assert!(matches!(b.next().await, MessageFromDb::Push { seq: SequenceNumber(1), .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_broadcasts_are_sequenced_and_relays_never_retained(
            pushes in prop::collection::vec((generators::key(), generators::action()), 1..24)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (seqs, retained) = runtime.block_on(async {
                let server = MockServer::start();
                let mut a = RawClient::open(&server, &MockServer::url("r")).await;
                for (n, (key, action)) in pushes.iter().enumerate() {
                    a.send(&MessageToDb::push(key.clone(), int(n as i64), *action));
                }
                a.send(&MessageToDb::Ping { nonce: Some(0) });

                let mut seqs = Vec::new();
                loop {
                    match a.next().await {
                        MessageFromDb::Push { seq, .. } => seqs.push(seq),
                        MessageFromDb::Pong { .. } => break,
                        _ => {}
                    }
                }
                let mut retained = Vec::new();
                for key in pushes.iter().map(|(key, _)| key) {
                    retained.extend(server.log("r", key.as_str()).into_iter().map(|e| e.value));
                }
                (seqs, retained)
            });

            let broadcast = pushes
                .iter()
                .filter(|(_, action)| !matches!(action, Action::Compact { .. }))
                .count();
            prop_assert_eq!(seqs.len(), broadcast);
            prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            for (n, (_, action)) in pushes.iter().enumerate() {
                if *action == Action::Relay {
                    prop_assert!(!retained.contains(&int(n as i64)));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let server = MockServer::start();
        let mut a = RawClient::open(&server, &MockServer::url("one")).await;
        let mut b = RawClient::open(&server, &MockServer::url("two")).await;

        a.send(&MessageToDb::push("k", int(1), Action::Append));
        b.send(&MessageToDb::push("k", int(1), Action::Append));
        assert!(matches!(a.next().await, MessageFromDb::Push { seq: SequenceNumber(1), .. }));
        assert!(matches!(b.next().await, MessageFromDb::Push { seq: SequenceNumber(1), .. }));
        assert_eq!(server.pushes("k"), 2);
    }
}
