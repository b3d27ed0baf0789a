//! Replicated state against the in-memory log server.

use std::sync::Arc;
use std::time::Duration;

use driftline::{ConnectionStatus, FixedIdentity, Room, RoomConfig, SequenceNumber};
use driftline_testkit::{counter, init_tracing, wait_until, CounterAction, MockServer};
use parking_lot::Mutex;

async fn join(server: &MockServer, client: &str) -> Room {
    let room = Room::new(
        Arc::new(server.connector()),
        Arc::new(FixedIdentity::new(client)),
        RoomConfig::default(),
    );
    room.connect(MockServer::url("board")).await.unwrap();
    room
}

#[tokio::test(start_paused = true)]
async fn test_clients_converge_on_server_order() {
    init_tracing();
    let server = MockServer::start();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let a = alice.replicator("counter", counter(), |_| {}).unwrap();
    let b = bob.replicator("counter", counter(), |_| {}).unwrap();

    a.dispatch(CounterAction::Add(1)).unwrap();
    b.dispatch(CounterAction::Double).unwrap();
    a.dispatch(CounterAction::Add(3)).unwrap();

    assert!(
        wait_until(|| {
            a.confirmed_seq() == SequenceNumber(3) && b.confirmed_seq() == SequenceNumber(3)
        })
        .await
    );
    assert_eq!(a.pending(), 0);
    assert_eq!(b.pending(), 0);
    assert_eq!(a.state(), b.state());
    assert_eq!(a.local_state(), a.state().confirmed_state);
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_state_is_visible_before_confirmation() {
    init_tracing();
    let server = MockServer::start();
    let alice = join(&server, "alice").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let a = alice
        .replicator("counter", counter(), move |state| sink.lock().push(*state))
        .unwrap();

    a.dispatch(CounterAction::Add(5)).unwrap();
    assert_eq!(a.local_state(), 5);
    assert_eq!(a.state().confirmed_state, 0);
    assert_eq!(a.pending(), 1);

    assert!(wait_until(|| a.pending() == 0).await);
    assert_eq!(a.state().confirmed_state, 5);
    assert_eq!(seen.lock().first(), Some(&5));
}

#[tokio::test(start_paused = true)]
async fn test_long_log_is_compacted_and_replayed_to_late_joiner() {
    init_tracing();
    let server = MockServer::start();
    let alice = join(&server, "alice").await;
    let a = alice.replicator("counter", counter(), |_| {}).unwrap();

    for _ in 0..40 {
        a.dispatch(CounterAction::Add(1)).unwrap();
    }
    assert!(wait_until(|| a.confirmed_seq() == SequenceNumber(40)).await);
    assert!(wait_until(|| server.log("board", "counter").len() < 40).await);
    assert!(server
        .received()
        .iter()
        .any(|(_, message)| matches!(
            message,
            driftline::core::MessageToDb::Push {
                action: driftline::Action::Compact { .. },
                ..
            }
        )));

    let carol = join(&server, "carol").await;
    let c = carol.replicator("counter", counter(), |_| {}).unwrap();
    assert!(wait_until(|| c.local_state() == 40).await);
    assert_eq!(c.confirmed_seq(), SequenceNumber(40));
    assert_eq!(c.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_actions_queued_during_outage_are_delivered_after_reconnect() {
    init_tracing();
    let server = MockServer::start();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;
    let a = alice.replicator("counter", counter(), |_| {}).unwrap();
    let b = bob.replicator("counter", counter(), |_| {}).unwrap();

    a.dispatch(CounterAction::Add(2)).unwrap();
    assert!(wait_until(|| b.local_state() == 2).await);

    server.drop_all();
    assert!(wait_until(|| alice.status() == ConnectionStatus::Disconnected).await);

    a.dispatch(CounterAction::Double).unwrap();
    assert_eq!(a.local_state(), 4);
    assert_eq!(b.local_state(), 2);
    assert!(alice.connection().queued() > 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(wait_until(|| alice.status() == ConnectionStatus::Connected).await);
    assert!(wait_until(|| a.pending() == 0 && b.local_state() == 4).await);
    assert_eq!(a.state(), b.state());
    assert_eq!(server.log("board", "counter").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_push_lost_in_flight_is_sent_again_after_reconnect() {
    init_tracing();
    let server = MockServer::start();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;
    let a = alice.replicator("counter", counter(), |_| {}).unwrap();
    let b = bob.replicator("counter", counter(), |_| {}).unwrap();

    a.dispatch(CounterAction::Add(2)).unwrap();
    assert!(wait_until(|| a.pending() == 0 && b.local_state() == 2).await);

    server.lose_next_push();
    a.dispatch(CounterAction::Add(3)).unwrap();
    assert!(wait_until(|| alice.status() == ConnectionStatus::Disconnected).await);
    assert_eq!(a.local_state(), 5);
    assert_eq!(a.pending(), 1);
    assert_eq!(server.log("board", "counter").len(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(wait_until(|| alice.status() == ConnectionStatus::Connected).await);
    assert!(wait_until(|| a.pending() == 0 && b.local_state() == 5).await);
    assert_eq!(a.state(), b.state());
    assert_eq!(server.log("board", "counter").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shared_state_reaches_other_clients() {
    init_tracing();
    let server = MockServer::start();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let slider_a = alice.shared_state("slider", |_: &i64| {}).unwrap();
    let slider_b = bob
        .shared_state("slider", move |v: &i64| sink.lock().push(*v))
        .unwrap();

    slider_a.set_state_optimistic(1);
    slider_a.set_state_optimistic(2);
    slider_a.set_state_optimistic(3);

    assert!(wait_until(|| slider_b.get() == Some(3)).await);
    assert_eq!(seen.lock().last(), Some(&3));
    assert_eq!(server.log("board", "slider").len(), 1);
}
