//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use driftline_core::{Encoding, FixedIdentity};
use driftline_net::{Connection, ConnectionConfig};
use driftline_replica::Reducer;

use crate::server::MockServer;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A client of `server` connected to `room`.
pub async fn connected_client(server: &MockServer, room: &str) -> Connection {
    let connection = server.client(ConnectionConfig::default());
    connection
        .connect(MockServer::url(room), Encoding::Json)
        .await
        .expect("mock server accepts connections");
    connection
}

/// `count` clients of `server` connected to `room`.
pub async fn connected_clients(server: &MockServer, room: &str, count: usize) -> Vec<Connection> {
    let mut clients = Vec::with_capacity(count);
    for _ in 0..count {
        clients.push(connected_client(server, room).await);
    }
    clients
}

/// Identities named `client-0`, `client-1`, ... for multi-party tests.
pub fn identities(count: usize) -> Vec<FixedIdentity> {
    (0..count)
        .map(|i| FixedIdentity::new(format!("client-{i}")))
        .collect()
}

/// Poll `condition` every 10ms until it holds or ten seconds pass.
///
/// Meant for tests with paused time, where the wait costs nothing.
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Actions of the counter used throughout the tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterAction {
    Add(i64),
    Double,
    Reset,
}

/// An optimistic counter. `Double` makes action order observable.
pub fn counter() -> Reducer<i64, CounterAction> {
    Reducer::new(0, |state, action: &CounterAction| match action {
        CounterAction::Add(n) => state + n,
        CounterAction::Double => state * 2,
        CounterAction::Reset => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftline_replica::fold_actions;

    #[test]
    fn test_counter_is_order_sensitive() {
        let counter = counter();
        let a = [CounterAction::Add(1), CounterAction::Double];
        let b = [CounterAction::Double, CounterAction::Add(1)];
        assert_eq!(fold_actions(&counter, 0, &a), 2);
        assert_eq!(fold_actions(&counter, 0, &b), 1);
    }

    #[test]
    fn test_identities_are_distinct() {
        use driftline_core::IdentityProvider;
        let ids: Vec<String> = identities(3).iter().map(|i| i.client_id()).collect();
        assert_eq!(ids, vec!["client-0", "client-1", "client-2"]);
    }

    #[tokio::test]
    async fn test_connected_clients_share_a_room() {
        let server = MockServer::start();
        let _clients = connected_clients(&server, "lobby", 2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.clients("lobby"), 2);
        assert_eq!(server.clients("elsewhere"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_gives_up() {
        let start = tokio::time::Instant::now();
        assert!(!wait_until(|| false).await);
        assert!(start.elapsed() >= Duration::from_secs(10));

        let mut polls = 0;
        assert!(
            wait_until(|| {
                polls += 1;
                polls == 3
            })
            .await
        );
    }
}
