//! # Driftline Net
//!
//! Transport and connection layer for Driftline.
//!
//! A [`Connection`] keeps one socket open to the log service, queues
//! messages while the socket is down, reconnects after a fixed delay, and
//! dispatches inbound values to per-key subscribers. Sockets are opened by a
//! [`Connector`]: [`WebSocketConnector`] for real servers, or
//! [`memory::MemoryNetwork`] for tests. [`HttpConnection`] delivers single
//! messages over HTTP where sockets are unavailable.

pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod transport;
pub mod websocket;

mod latency;

pub use config::ConnectionConfig;
pub use connection::{
    Connection, ConnectionStatus, Delivery, Replayed, SubscribeOptions, Subscription,
};
pub use error::{NetError, Result};
pub use http::HttpConnection;
pub use transport::{memory, Connector, SocketEvent, SocketHandle};
pub use websocket::WebSocketConnector;
