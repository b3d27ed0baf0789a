//! Peer sets negotiated over the in-memory log server with the loopback
//! backend.

use std::sync::Arc;
use std::time::Duration;

use driftline::rtc::loopback::{LoopbackBackend, LoopbackNetwork};
use driftline::{
    DataChannelMessage, FixedIdentity, PeerSetConfig, PeerSetSynchronizer, Room, RoomConfig,
};
use driftline_testkit::{init_tracing, wait_until, MockServer};
use parking_lot::Mutex;
use serde_json::json;

async fn join(server: &MockServer, client: &str) -> Room {
    join_with(server, client, RoomConfig::default()).await
}

async fn join_with(server: &MockServer, client: &str, config: RoomConfig) -> Room {
    let room = Room::new(
        Arc::new(server.connector()),
        Arc::new(FixedIdentity::new(client)),
        config,
    );
    room.connect(MockServer::url("call")).await.unwrap();
    room
}

fn linked(a: &PeerSetSynchronizer, b: &PeerSetSynchronizer) -> bool {
    a.connected_peers() == vec![b.local_id()] && b.connected_peers() == vec![a.local_id()]
}

#[tokio::test(start_paused = true)]
async fn test_peers_connect_and_exchange_messages() {
    init_tracing();
    let server = MockServer::start();
    let network = LoopbackNetwork::new();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let a = alice.peers(Arc::new(network.backend())).unwrap();
    let b = bob.peers(Arc::new(network.backend())).unwrap();
    assert!(wait_until(|| linked(&a, &b)).await);
    assert_eq!(network.connection_ids().len(), 2);

    let inbox: Arc<Mutex<Vec<DataChannelMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    b.on_message(move |message| sink.lock().push(message.clone()));

    let mut sent = 0;
    assert!(
        wait_until(|| {
            if sent == 0 {
                sent = a.send(&json!({ "hello": "bob" })).unwrap();
            }
            !inbox.lock().is_empty()
        })
        .await
    );
    assert_eq!(sent, 1);

    let received = inbox.lock()[0].clone();
    assert_eq!(received.sender, a.local_id());
    assert_eq!(received.value, json!({ "hello": "bob" }));

    // The signaling log holds the whole exchange for late subscribers.
    let (inbound, _) = driftline::rtc::signaling_keys(&b.local_id(), &a.local_id());
    assert!(!server.log("call", inbound.as_str()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_peer_is_dropped_when_presence_expires() {
    init_tracing();
    let server = MockServer::start();
    let network = LoopbackNetwork::new();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let a = alice.peers(Arc::new(network.backend())).unwrap();
    let b = bob.peers(Arc::new(network.backend())).unwrap();
    assert!(wait_until(|| linked(&a, &b)).await);

    b.close();
    b.close();
    assert!(wait_until(|| a.peers().is_empty()).await);
    assert!(a.connected_peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refreshed_identity_reconnects_under_new_id() {
    init_tracing();
    let server = MockServer::start();
    let network = LoopbackNetwork::new();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let a = alice.peers(Arc::new(network.backend())).unwrap();
    let b = bob.peers(Arc::new(network.backend())).unwrap();
    assert!(wait_until(|| linked(&a, &b)).await);

    let old = a.local_id();
    a.refresh_identity();
    assert!(wait_until(|| a.local_id() != old).await);
    assert!(wait_until(|| linked(&a, &b)).await);
    assert_eq!(b.peers(), vec![a.local_id()]);
}

#[tokio::test(start_paused = true)]
async fn test_ice_restart_recovers_a_single_failure() {
    init_tracing();
    let server = MockServer::start();
    let network = LoopbackNetwork::new();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let a = alice.peers(Arc::new(network.backend())).unwrap();
    let b = bob.peers(Arc::new(network.backend())).unwrap();
    assert!(wait_until(|| linked(&a, &b)).await);
    let (a_id, b_id) = (a.local_id(), b.local_id());
    let offers = network.offers_created();

    let ids = network.connection_ids();
    assert!(network.inject_failure(ids[0]));
    assert!(wait_until(|| network.offers_created() > offers).await);
    assert!(wait_until(|| linked(&a, &b)).await);

    assert!(wait_until(|| a.failures(&b_id) == 0 && b.failures(&a_id) == 0).await);
    assert_eq!((a.local_id(), b.local_id()), (a_id, b_id));
    assert_eq!(network.connection_ids(), ids);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_rotate_identity() {
    init_tracing();
    let server = MockServer::start();
    let network = LoopbackNetwork::new();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let a = alice.peers(Arc::new(network.backend())).unwrap();
    let b = bob.peers(Arc::new(network.backend())).unwrap();
    assert!(wait_until(|| linked(&a, &b)).await);
    let before = (a.local_id(), b.local_id());

    let id = network.connection_ids()[0];
    for _ in 0..3 {
        assert!(network.inject_failure(id));
    }

    assert!(wait_until(|| (a.local_id(), b.local_id()) != before).await);
    let rotated = usize::from(a.local_id() != before.0) + usize::from(b.local_id() != before.1);
    assert_eq!(rotated, 1);
    assert!(wait_until(|| linked(&a, &b)).await);
    assert!(network.connection_state(id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_peer_is_abandoned_until_it_changes_id() {
    init_tracing();
    let server = MockServer::start();
    let network = LoopbackNetwork::new();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let cut = Arc::new(network.backend());
    let a = alice.peers(Arc::<LoopbackBackend>::clone(&cut)).unwrap();
    let b = bob.peers(Arc::new(network.backend())).unwrap();
    assert!(wait_until(|| linked(&a, &b)).await);
    let (a_id, b_id) = (a.local_id(), b.local_id());

    // From here on alice's connections fail after every exchange.
    cut.set_isolated(true);
    for id in cut.connection_ids() {
        assert!(network.inject_failure(id));
    }

    assert!(wait_until(|| a.local_id() != a_id).await);
    assert!(wait_until(|| a.peers().is_empty() && a.failures(&b_id) > 3).await);
    assert_eq!(b.local_id(), b_id);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(a.peers().is_empty());
    assert!(a.connected_peers().is_empty());
    assert!(cut.connection_ids().is_empty());

    // A new id from the abandoned side is a new peer.
    cut.set_isolated(false);
    b.refresh_identity();
    assert!(wait_until(|| b.local_id() != b_id).await);
    assert!(wait_until(|| linked(&a, &b)).await);
    assert_eq!(a.failures(&b.local_id()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_peer_drops_messages_inside_the_window() {
    init_tracing();
    let server = MockServer::start();
    let network = LoopbackNetwork::new();
    let alice = join(&server, "alice").await;
    let config = RoomConfig {
        peers: PeerSetConfig::default().with_throttle(Duration::from_secs(1)),
        ..RoomConfig::default()
    };
    let bob = join_with(&server, "bob", config).await;

    let a = alice.peers(Arc::new(network.backend())).unwrap();
    let b = bob.peers(Arc::new(network.backend())).unwrap();
    assert!(wait_until(|| linked(&a, &b)).await);

    let inbox: Arc<Mutex<Vec<DataChannelMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    b.on_message(move |message| sink.lock().push(message.clone()));

    let mut sent = 0;
    assert!(
        wait_until(|| {
            if sent == 0 {
                sent = a.send(&json!("first")).unwrap();
            }
            !inbox.lock().is_empty()
        })
        .await
    );
    for n in 0..4 {
        a.send(&json!(n)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(inbox.lock().len(), 1);
    assert_eq!(inbox.lock()[0].value, json!("first"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    a.send(&json!("late")).unwrap();
    assert!(wait_until(|| inbox.lock().len() == 2).await);
    assert_eq!(inbox.lock()[1].value, json!("late"));
}
