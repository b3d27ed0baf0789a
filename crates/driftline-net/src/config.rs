//! Connection configuration.

use std::time::Duration;

use driftline_core::Encoding;

/// Configuration for a [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Delay before reopening a socket that closed or failed to open.
    pub reconnect_delay: Duration,
    /// Encoding used by [`Connection::connect_room`](crate::Connection::connect_room).
    pub encoding: Encoding,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            encoding: Encoding::Json,
        }
    }
}
