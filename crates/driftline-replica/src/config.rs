//! Configuration for replicated state.

use std::time::Duration;

/// Options for an [`OptimisticReplicator`](crate::OptimisticReplicator).
#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
    /// Retained log length above which a compaction is requested.
    pub size_threshold: usize,
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        Self { size_threshold: 30 }
    }
}

/// Configuration for a [`PresenceBroadcaster`](crate::PresenceBroadcaster).
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Key presence messages are relayed on.
    pub key: String,
    /// Minimum time between two sends caused by value changes.
    pub min_interval: Duration,
    /// Heartbeat period. Peers not heard from for twice this long expire.
    pub max_interval: Duration,
}

impl PresenceConfig {
    /// Age after which a peer's entry is dropped.
    pub fn expiry(&self) -> Duration {
        self.max_interval * 2
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            key: "__presence".to_string(),
            min_interval: Duration::from_millis(20),
            max_interval: Duration::from_millis(1000),
        }
    }
}

/// Configuration for a [`StateListener`](crate::StateListener).
#[derive(Debug, Clone)]
pub struct StateListenerConfig {
    /// At most one send per window; later values in the window are sent at
    /// its end.
    pub debounce: Duration,
}

impl Default for StateListenerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
        }
    }
}
