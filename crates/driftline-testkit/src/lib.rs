//! # Driftline Testkit
//!
//! Testing utilities for Driftline.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **MockServer**: an in-memory log server speaking the wire protocol over
//!   the in-memory transport, with outage simulation
//! - **Fixtures**: connected clients, identities, a reference counter
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Mock Server
//!
//! ```rust,no_run
//! use driftline_testkit::{connected_client, MockServer};
//!
//! # async fn example() {
//! let server = MockServer::start();
//! let client = connected_client(&server, "lobby").await;
//! server.drop_all(); // the client reconnects after its delay
//! # }
//! ```

pub mod fixtures;
pub mod generators;
pub mod server;

pub use fixtures::{
    connected_client, connected_clients, counter, identities, init_tracing, wait_until,
    CounterAction,
};
pub use server::{parse_socket_url, MockServer};
