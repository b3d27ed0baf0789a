//! Peer set configuration.

use std::time::Duration;

use driftline_replica::PresenceConfig;

/// Configuration for a [`PeerSetSynchronizer`](crate::PeerSetSynchronizer).
#[derive(Debug, Clone)]
pub struct PeerSetConfig {
    /// Consecutive failures with one peer at which this client takes a new
    /// ephemeral id. Fewer failures restart ICE; more close the peer.
    pub failure_threshold: u32,
    /// Minimum spacing between data channel messages delivered from one
    /// peer. The first message of a window is delivered and the rest of
    /// the window is dropped. Zero delivers everything.
    pub throttle: Duration,
    /// Presence used to announce ephemeral ids.
    pub presence: PresenceConfig,
}

impl PeerSetConfig {
    /// Throttle inbound data channel messages, and announce presence no
    /// more often than the same period.
    pub fn with_throttle(mut self, period: Duration) -> Self {
        self.throttle = period;
        self.presence.min_interval = period;
        self
    }
}

impl Default for PeerSetConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            throttle: Duration::ZERO,
            presence: PresenceConfig::default(),
        }
    }
}
