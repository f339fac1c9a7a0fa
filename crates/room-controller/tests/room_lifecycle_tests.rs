//! Room lifecycle integration tests.
//!
//! Drives full signaling sessions against a real worker pool and registry
//! through the `TestRig` harness.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use rc_test_utils::{MockDirectory, ResponseExt, SessionStatus, TestRig};
use common::types::RoomKey;
use room_controller::signaling::protocol::ServerEvent;

fn key(raw: &str) -> RoomKey {
    RoomKey::parse(raw).unwrap()
}

fn classroom() -> MockDirectory {
    MockDirectory::new()
        .with_room("R1", "c1", SessionStatus::Live)
        .with_room("R2", "c2", SessionStatus::Live)
        .with_enrollment("B", "c1")
        .with_enrollment("C", "c1")
        .with_enrollment("B", "c2")
}

/// Capacity 2: instructor A and student B get in, C is turned away, the
/// room survives B leaving and disappears when A leaves.
#[tokio::test]
async fn test_two_seat_room_lifecycle() {
    let rig = TestRig::builder()
        .directory(classroom())
        .room_capacity(2)
        .build();
    let mut a = rig.instructor("A");
    let mut b = rig.student("B");
    let mut c = rig.student("C");

    let joined = a.join("R1").await.assert_ok();
    assert_eq!(joined["existingPeers"].as_array().unwrap().len(), 0);
    assert_eq!(joined["peerId"], a.peer_id());

    let joined = b.join("R1").await.assert_ok();
    let existing = joined["existingPeers"].as_array().unwrap();
    assert_eq!(existing.len(), 1);
    assert_eq!(existing[0]["participantId"], "A");
    assert_eq!(existing[0]["role"], "instructor");

    match a.event_named("peerJoined").await {
        ServerEvent::PeerJoined(peer) => assert_eq!(peer.participant_id.as_str(), "B"),
        other => panic!("unexpected event {other:?}"),
    }

    c.join("R1").await.assert_code("room_full");
    assert!(!c.session().is_member(&key("R1")));

    b.leave("R1").await.assert_ok();
    match a.event_named("peerLeft").await {
        ServerEvent::PeerLeft(left) => {
            assert_eq!(left.participant_id.as_str(), "B");
            assert_eq!(left.peer_id, b.peer_id());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(rig.room_exists("R1").await);

    a.leave("R1").await.assert_ok();
    assert!(rig.room_closed("R1").await);
    assert_eq!(rig.metrics().room_count(), 0);
    assert_eq!(rig.metrics().peer_count(), 0);

    // The rejected client never joined, so it has nothing to leave
    c.leave("R1").await.assert_code("not_found");
}

#[tokio::test]
async fn test_concurrent_first_joins_share_one_room() {
    let rig = TestRig::builder().directory(classroom()).build();
    let mut clients = vec![
        rig.instructor("A"),
        rig.student("B"),
        rig.student("C"),
        rig.instructor("D"),
    ];

    let joins = clients.iter_mut().map(|client| client.join("R1"));
    let responses = futures_util::future::join_all(joins).await;
    for response in responses {
        response.assert_ok();
    }

    assert_eq!(rig.room_count().await, 1);
    let room = rig
        .registry()
        .get(key("R1"))
        .await
        .unwrap()
        .expect("room exists");
    assert_eq!(room.get_state().await.unwrap().peers.len(), 4);
}

#[tokio::test]
async fn test_room_is_recreated_fresh_after_teardown() {
    let rig = TestRig::builder().directory(classroom()).build();
    let mut a = rig.instructor("A");

    a.join("R1").await.assert_ok();
    let first = rig
        .registry()
        .get(key("R1"))
        .await
        .unwrap()
        .unwrap()
        .instance_id();
    a.leave("R1").await.assert_ok();
    assert!(rig.room_closed("R1").await);

    let mut b = rig.student("B");
    let joined = b.join("R1").await.assert_ok();
    assert_eq!(joined["existingPeers"].as_array().unwrap().len(), 0);
    let second = rig
        .registry()
        .get(key("R1"))
        .await
        .unwrap()
        .unwrap()
        .instance_id();
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_disconnect_leaves_every_room() {
    let rig = TestRig::builder().directory(classroom()).build();
    let mut b = rig.student("B");
    let mut a = rig.instructor("A");

    b.join("R1").await.assert_ok();
    b.join("R2").await.assert_ok();
    a.join("R1").await.assert_ok();
    assert_eq!(rig.room_count().await, 2);

    let b_peer = b.peer_id();
    b.close().await;

    match a.event_named("peerLeft").await {
        ServerEvent::PeerLeft(left) => assert_eq!(left.peer_id, b_peer),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(rig.room_exists("R1").await);
    assert!(rig.room_closed("R2").await);
    assert_eq!(rig.metrics().peer_count(), 1);
}

#[tokio::test]
async fn test_same_participant_on_two_connections() {
    let rig = TestRig::builder().directory(classroom()).build();
    let mut laptop = rig.student("B");
    let mut phone = rig.student("B");

    laptop.join("R1").await.assert_ok();
    let joined = phone.join("R1").await.assert_ok();
    let existing = joined["existingPeers"].as_array().unwrap();
    assert_eq!(existing.len(), 1);
    assert_eq!(existing[0]["peerId"], laptop.peer_id());

    // A second join on the same connection is refused
    phone.join("R1").await.assert_code("conflict");
}

#[tokio::test]
async fn test_registry_shutdown_closes_rooms() {
    let rig = TestRig::builder().directory(classroom()).build();
    let mut a = rig.instructor("A");
    a.join("R1").await.assert_ok();

    rig.registry()
        .shutdown(std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(rig.metrics().room_count(), 0);

    let mut b = rig.student("B");
    b.join("R1").await.assert_code("internal");
}
