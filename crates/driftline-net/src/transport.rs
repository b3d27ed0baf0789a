//! Transport abstraction for connections.
//!
//! A [`Connector`] opens one duplex socket and hands back a [`SocketHandle`]:
//! outbound frames go into an unbounded channel, inbound frames and the
//! terminal close/error event come out of another. Dropping the outbound
//! sender closes the socket.

use async_trait::async_trait;
use tokio::sync::mpsc;

use driftline_core::Frame;

use crate::error::Result;

/// Something that happened on an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A frame arrived.
    Frame(Frame),
    /// The socket closed.
    Closed,
    /// The socket failed. No further events follow.
    Error(String),
}

/// The two halves of an open socket.
#[derive(Debug)]
pub struct SocketHandle {
    /// Outbound frames, in order.
    pub sender: mpsc::UnboundedSender<Frame>,
    /// Inbound frames followed by at most one terminal event.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `url`. Resolves once the socket is open.
    async fn connect(&self, url: &str) -> Result<SocketHandle>;
}

/// An in-memory network for testing.
///
/// Connectors created from a [`MemoryNetwork`] deliver each new socket to
/// whoever called [`MemoryNetwork::listen`], as a [`ServerSocket`].
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::error::NetError;

    /// The server end of an in-memory socket.
    #[derive(Debug)]
    pub struct ServerSocket {
        id: u64,
        url: String,
        incoming: mpsc::UnboundedReceiver<Frame>,
        outgoing: mpsc::UnboundedSender<SocketEvent>,
    }

    impl ServerSocket {
        /// Network-unique id of this socket.
        pub fn id(&self) -> u64 {
            self.id
        }

        /// The URL the client connected to.
        pub fn url(&self) -> &str {
            &self.url
        }

        /// Next frame from the client, or `None` once the client closed.
        pub async fn recv(&mut self) -> Option<Frame> {
            self.incoming.recv().await
        }

        /// A cloneable handle for writing to the client.
        pub fn writer(&self) -> ServerWriter {
            ServerWriter {
                outgoing: self.outgoing.clone(),
            }
        }

        /// Send a frame to the client. Returns false if the client is gone.
        pub fn send(&self, frame: Frame) -> bool {
            self.outgoing.send(SocketEvent::Frame(frame)).is_ok()
        }

        /// Close the socket from the server side.
        pub fn close(&self) {
            let _ = self.outgoing.send(SocketEvent::Closed);
        }
    }

    /// Write half of a [`ServerSocket`].
    #[derive(Debug, Clone)]
    pub struct ServerWriter {
        outgoing: mpsc::UnboundedSender<SocketEvent>,
    }

    impl ServerWriter {
        /// Send a frame to the client. Returns false if the client is gone.
        pub fn send(&self, frame: Frame) -> bool {
            self.outgoing.send(SocketEvent::Frame(frame)).is_ok()
        }

        /// Whether the client has gone away.
        pub fn is_closed(&self) -> bool {
            self.outgoing.is_closed()
        }
    }

    /// Shared state for the in-memory network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        acceptor: Mutex<Option<mpsc::UnboundedSender<ServerSocket>>>,
        live: Mutex<HashMap<u64, mpsc::UnboundedSender<SocketEvent>>>,
        refusing: AtomicBool,
        next_id: AtomicU64,
    }

    impl MemoryNetwork {
        /// Create a new network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Start accepting sockets. Replaces any previous listener.
        pub fn listen(&self) -> mpsc::UnboundedReceiver<ServerSocket> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.acceptor.lock() = Some(tx);
            rx
        }

        /// Create a connector that opens sockets on this network.
        pub fn connector(self: &Arc<Self>) -> MemoryConnector {
            MemoryConnector {
                network: Arc::clone(self),
            }
        }

        /// Refuse (or accept again) new sockets.
        pub fn set_refusing(&self, refusing: bool) {
            self.refusing.store(refusing, Ordering::SeqCst);
        }

        /// Close every live socket from the network side.
        ///
        /// Returns the number of sockets closed.
        pub fn drop_all(&self) -> usize {
            let live: Vec<_> = self.live.lock().drain().collect();
            let mut closed = 0;
            for (_, outgoing) in live {
                if outgoing.send(SocketEvent::Closed).is_ok() {
                    closed += 1;
                }
            }
            closed
        }

        /// Number of sockets whose client end is still open.
        pub fn live_connections(&self) -> usize {
            let mut live = self.live.lock();
            live.retain(|_, outgoing| !outgoing.is_closed());
            live.len()
        }

        fn open(&self, url: &str) -> Result<SocketHandle> {
            if self.refusing.load(Ordering::SeqCst) {
                return Err(NetError::Transport("connection refused".into()));
            }

            let (client_tx, server_rx) = mpsc::unbounded_channel();
            let (server_tx, client_rx) = mpsc::unbounded_channel();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let socket = ServerSocket {
                id,
                url: url.to_string(),
                incoming: server_rx,
                outgoing: server_tx.clone(),
            };

            let acceptor = self.acceptor.lock();
            let accepted = acceptor
                .as_ref()
                .map(|acceptor| acceptor.send(socket).is_ok())
                .unwrap_or(false);
            if !accepted {
                return Err(NetError::Transport("no listener".into()));
            }
            drop(acceptor);

            self.live.lock().insert(id, server_tx);
            Ok(SocketHandle {
                sender: client_tx,
                events: client_rx,
            })
        }
    }

    /// Connector for a [`MemoryNetwork`].
    #[derive(Clone)]
    pub struct MemoryConnector {
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &str) -> Result<SocketHandle> {
            self.network.open(url)
        }
    }
}
