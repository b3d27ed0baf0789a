//! The Room: one connection shared by every synchronized object.
//!
//! A Room owns the [`Connection`] to a room on the log service and this
//! client's identity, and hands out replicated state, presence, shared
//! values and peer sets bound to that connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use driftline_core::{Encoding, IdentityProvider, Key, RandomIdentity, RoomInfo};
use driftline_net::{Connection, ConnectionConfig, ConnectionStatus, Connector};
use driftline_replica::{
    Compactable, OptimisticReplicator, PresenceBroadcaster, PresenceConfig, PresenceMap, Reducer,
    ReplicatorOptions, StateListener, StateListenerConfig,
};
use driftline_rtc::{PeerSetConfig, PeerSetSynchronizer, RtcBackend};

use crate::error::Result;

/// Configuration for a [`Room`].
#[derive(Debug, Clone, Default)]
pub struct RoomConfig {
    /// Reconnect delay and wire encoding.
    pub connection: ConnectionConfig,
    /// Compaction threshold for replicated state.
    pub replicator: ReplicatorOptions,
    /// Presence key and intervals.
    pub presence: PresenceConfig,
    /// Debounce window for shared values.
    pub state: StateListenerConfig,
    /// Failure escalation for peer sets.
    pub peers: PeerSetConfig,
}

/// A connection to one room plus this client's identity.
pub struct Room {
    connection: Connection,
    identity: Arc<dyn IdentityProvider>,
    config: RoomConfig,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("client_id", &self.identity.client_id())
            .field("status", &self.connection.status())
            .finish()
    }
}

impl Room {
    /// Create a room over WebSockets with a random identity.
    pub fn websocket(config: RoomConfig) -> Self {
        let connection = Connection::websocket(config.connection.clone());
        Self::with_connection(connection, Arc::new(RandomIdentity::new()), config)
    }

    /// Create a room over a custom transport.
    pub fn new(
        connector: Arc<dyn Connector>,
        identity: Arc<dyn IdentityProvider>,
        config: RoomConfig,
    ) -> Self {
        let connection = Connection::new(connector, config.connection.clone());
        Self::with_connection(connection, identity, config)
    }

    /// Wrap an existing connection.
    pub fn with_connection(
        connection: Connection,
        identity: Arc<dyn IdentityProvider>,
        config: RoomConfig,
    ) -> Self {
        Self {
            connection,
            identity,
            config,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────────

    /// Open the socket with the configured encoding.
    pub async fn connect(&self, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        info!(client = %self.identity.client_id(), %url, "joining room");
        self.connection
            .connect(url, self.config.connection.encoding)
            .await?;
        Ok(())
    }

    /// Open the socket described by a room record.
    pub async fn connect_room(&self, room: &RoomInfo) -> Result<()> {
        self.connection.connect_room(room).await?;
        Ok(())
    }

    /// Open the socket with an explicit encoding.
    pub async fn connect_with(&self, url: impl Into<String>, encoding: Encoding) -> Result<()> {
        self.connection.connect(url, encoding).await?;
        Ok(())
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Round-trip time to the server.
    pub async fn test_latency(&self) -> Result<Duration> {
        Ok(self.connection.test_latency().await?)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn client_id(&self) -> String {
        self.identity.client_id()
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Synchronized objects
    // ─────────────────────────────────────────────────────────────────────────

    /// Replicate `compactable` through `key`.
    pub fn replicator<C, F>(
        &self,
        key: impl Into<Key>,
        compactable: C,
        callback: F,
    ) -> Result<OptimisticReplicator<C>>
    where
        C: Compactable,
        F: Fn(&C::State) + Send + Sync + 'static,
    {
        Ok(OptimisticReplicator::new(
            &self.connection,
            key,
            compactable,
            self.identity.as_ref(),
            self.config.replicator.clone(),
            callback,
        )?)
    }

    /// Replicate a state folded by `reduce`.
    pub fn reducer<S, A, R, F>(
        &self,
        key: impl Into<Key>,
        initial: S,
        reduce: R,
        callback: F,
    ) -> Result<OptimisticReplicator<Reducer<S, A>>>
    where
        S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        A: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Fn(S, &A) -> S + Send + Sync + 'static,
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.replicator(key, Reducer::new(initial, reduce), callback)
    }

    /// Announce `initial` as this client's presence.
    pub fn presence<T, F>(&self, initial: T, callback: F) -> Result<PresenceBroadcaster<T>>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(&PresenceMap<T>) + Send + Sync + 'static,
    {
        Ok(PresenceBroadcaster::new(
            &self.connection,
            self.identity.client_id(),
            initial,
            self.config.presence.clone(),
            callback,
        )?)
    }

    /// Share one value through `key`.
    pub fn shared_state<T, F>(&self, key: impl Into<Key>, callback: F) -> Result<StateListener<T>>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        Ok(StateListener::new(
            &self.connection,
            key,
            self.config.state.clone(),
            callback,
        )?)
    }

    /// Connect to every other client announcing itself in this room.
    pub fn peers(&self, backend: Arc<dyn RtcBackend>) -> Result<PeerSetSynchronizer> {
        Ok(PeerSetSynchronizer::new(
            &self.connection,
            backend,
            Arc::clone(&self.identity),
            self.config.peers.clone(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_constants() {
        let config = RoomConfig::default();
        assert_eq!(config.connection.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.connection.encoding, Encoding::Json);
        assert_eq!(config.replicator.size_threshold, 30);
        assert_eq!(config.presence.key, "__presence");
        assert_eq!(config.presence.min_interval, Duration::from_millis(20));
        assert_eq!(config.presence.max_interval, Duration::from_millis(1000));
        assert_eq!(config.state.debounce, Duration::from_millis(50));
        assert_eq!(config.peers.failure_threshold, 3);
    }

    #[tokio::test]
    async fn test_latency_requires_connection() {
        let room = Room::websocket(RoomConfig::default());
        assert_eq!(room.status(), ConnectionStatus::Disconnected);
        assert!(room.test_latency().await.is_err());
    }
}
