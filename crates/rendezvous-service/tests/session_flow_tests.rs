//! End-to-end room lifecycle through the dispatcher: match, chat,
//! continuation votes and room endings.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use rendezvous_service::models::{EntryMode, MatchPreference, UserStatus, Vote};
use rendezvous_service::protocol::{ClientEvent, ServerEvent};
use rendezvous_service::store::Store;
use rendezvous_test_utils::{TestHarness, TestUser};

#[tokio::test(start_paused = true)]
async fn test_chat_pair_exchanges_messages() {
    let harness = TestHarness::new();
    let (mut alice, mut bob, room_id) = harness.paired(EntryMode::Chat).await;

    alice
        .send(ClientEvent::Message {
            content: "hello there".to_string(),
        })
        .await;

    for client in [&mut alice, &mut bob] {
        let event = client
            .expect(|e| matches!(e, ServerEvent::Message { .. }))
            .await;
        assert!(matches!(
            event,
            ServerEvent::Message { room_id: r, ref content, .. } if r == room_id && content == "hello there"
        ));
    }

    bob.send(ClientEvent::Typing).await;
    let typing = alice
        .expect(|e| matches!(e, ServerEvent::Typing { .. }))
        .await;
    assert!(matches!(typing, ServerEvent::Typing { user_id, .. } if user_id == bob.user_id()));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_incompatible_preferences_stay_queued() {
    let harness = TestHarness::new();
    let alice = harness.insert(TestUser::new("alice").gender("f").prefers("m"));
    let carol = harness.insert(TestUser::new("carol").gender("f").prefers("m"));
    let mut a = harness.client(&alice).await;
    let mut c = harness.client(&carol).await;

    for client in [&mut a, &mut c] {
        client
            .send(ClientEvent::Search {
                mode: EntryMode::Chat,
                preference: MatchPreference::SameMode,
            })
            .await;
        client
            .expect(|e| matches!(e, ServerEvent::SearchQueued { .. }))
            .await;
    }

    assert!(a.drain().is_empty());
    assert!(c.drain().is_empty());
    assert_eq!(harness.hub.queue().len(), 2);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_end_room_closes_both_connections_and_resets_presence() {
    let harness = TestHarness::new();
    let (mut alice, mut bob, room_id) = harness.paired(EntryMode::Chat).await;

    alice.send(ClientEvent::EndRoom).await;

    for client in [&mut alice, &mut bob] {
        let ended = client
            .expect(|e| matches!(e, ServerEvent::RoomEnded { .. }))
            .await;
        assert!(matches!(
            ended,
            ServerEvent::RoomEnded { room_id: r, ref reason } if r == room_id && reason == "user_ended"
        ));
        client.expect_closed().await;
    }

    let room = harness.store.get_room(room_id).await.unwrap().unwrap();
    assert!(room.end_time.is_some());
    for user_id in [alice.user_id(), bob.user_id()] {
        let user = harness.store.get_user(user_id).await.unwrap().unwrap();
        assert_eq!(user.status, UserStatus::Idle);
        assert_eq!(user.current_room_id, None);
    }

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_mutual_yes_keeps_room() {
    let harness = TestHarness::new();
    let (mut alice, mut bob, room_id) = harness.paired(EntryMode::Chat).await;

    alice
        .send(ClientEvent::StartCountdown { duration: Some(2) })
        .await;
    for client in [&mut alice, &mut bob] {
        client
            .expect(|e| matches!(e, ServerEvent::CountdownStart { duration: 2, .. }))
            .await;
        client
            .expect(|e| matches!(e, ServerEvent::NotificationShow { .. }))
            .await;
    }

    alice
        .send(ClientEvent::ContinuationResponse { response: Vote::Yes })
        .await;
    alice
        .expect(|e| matches!(e, ServerEvent::ContinuationWaiting { .. }))
        .await;
    bob.send(ClientEvent::ContinuationResponse { response: Vote::Yes })
        .await;

    for client in [&mut alice, &mut bob] {
        client
            .expect(|e| matches!(e, ServerEvent::RoomKept { room_id: r } if *r == room_id))
            .await;
    }

    let room = harness.store.get_room(room_id).await.unwrap().unwrap();
    assert!(room.keep_active);
    assert!(room.end_time.is_none());
    assert!(!harness.hub.negotiator().is_active(room_id));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_vote_ends_room_but_keeps_connections() {
    let harness = TestHarness::new();
    let (mut alice, mut bob, room_id) = harness.paired(EntryMode::Chat).await;

    alice
        .send(ClientEvent::StartCountdown { duration: Some(1) })
        .await;
    bob.expect(|e| matches!(e, ServerEvent::NotificationShow { .. }))
        .await;
    bob.send(ClientEvent::ContinuationResponse { response: Vote::No })
        .await;

    for client in [&mut alice, &mut bob] {
        client
            .expect(
                |e| matches!(e, ServerEvent::RoomEnded { reason, .. } if reason == "declined"),
            )
            .await;
    }
    assert!(alice.is_alive());
    assert!(bob.is_alive());
    assert!(!harness.hub.registry().is_in_room(room_id, alice.user_id()));

    // Back in the lobby, both can search again.
    alice
        .send(ClientEvent::Search {
            mode: EntryMode::Chat,
            preference: MatchPreference::SameMode,
        })
        .await;
    alice
        .expect(|e| matches!(e, ServerEvent::SearchQueued { .. }))
        .await;

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_vote_times_out() {
    let harness = TestHarness::new();
    let (mut alice, mut bob, room_id) = harness.paired(EntryMode::Chat).await;

    alice
        .send(ClientEvent::StartCountdown { duration: Some(1) })
        .await;
    alice
        .send(ClientEvent::StartCountdown { duration: Some(1) })
        .await;
    assert_eq!(alice.expect_error().await, "INVALID_STATE");

    for client in [&mut alice, &mut bob] {
        client
            .expect(|e| matches!(e, ServerEvent::RoomEnded { reason, .. } if reason == "timeout"))
            .await;
    }

    let room = harness.store.get_room(room_id).await.unwrap().unwrap();
    assert!(room.end_time.is_some());
    assert!(!room.keep_active);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_partner_disconnect_leaves_room_recoverable() {
    let harness = TestHarness::new();
    let (alice, mut bob, room_id) = harness.paired(EntryMode::Chat).await;
    let alice_id = alice.user_id();

    alice.disconnect().await;

    assert!(!harness.hub.registry().has_live_channel(alice_id));
    assert!(harness.hub.registry().is_in_room(room_id, bob.user_id()));
    let stored = harness.store.get_user(alice_id).await.unwrap().unwrap();
    assert_eq!(stored.current_room_id, Some(room_id));

    bob.send(ClientEvent::Message {
        content: "still here".to_string(),
    })
    .await;
    bob.expect(|e| matches!(e, ServerEvent::Message { .. })).await;

    harness.shutdown().await;
}
