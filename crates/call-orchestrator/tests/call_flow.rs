//! End-to-end tests for matchmaking and call session flow.
//!
//! Drives the registry through its public handle the way a transport
//! layer would, and verifies the cross-component guarantees:
//! - level pairing preference and queue-order tie-breaks
//! - queue deadlines vs. match claims
//! - group accumulation, activation, and the post-activation join door
//! - signaling order and mute/relay interleaving
//! - no user ever lands in two sessions at once

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::collections::HashMap;
use std::time::Duration;

use call_orchestrator::{
    CallError, CallKind, Config, Level, RegistryHandle, SessionEvent, SessionStatus,
};
use tokio::sync::mpsc::Receiver;

async fn recv_event(events: &mut Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn expect_matched(events: &mut Receiver<SessionEvent>) -> (String, Vec<String>) {
    match recv_event(events).await {
        SessionEvent::Matched {
            session_id, peers, ..
        } => (session_id, peers.into_iter().map(|p| p.user_id).collect()),
        other => panic!("expected Matched, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_level_preference_over_queue_order() {
    let registry = RegistryHandle::new(Config::default());

    // A (beginner) waits, C (advanced) arrives second, B (beginner) third.
    // B pairs with A despite C having waited longer; C never cross-pairs
    // at the default scan depth and times out instead.
    let mut a = registry.connect("a").await.unwrap();
    let mut c = registry.connect("c").await.unwrap();
    let mut b = registry.connect("b").await.unwrap();

    registry
        .enqueue("a", CallKind::OneOnOne, Level::Beginner, None)
        .await
        .unwrap();
    registry
        .enqueue("c", CallKind::OneOnOne, Level::Advanced, None)
        .await
        .unwrap();
    registry
        .enqueue("b", CallKind::OneOnOne, Level::Beginner, None)
        .await
        .unwrap();

    let (session_a, peers_a) = expect_matched(&mut a.events).await;
    let (session_b, peers_b) = expect_matched(&mut b.events).await;
    assert_eq!(session_a, session_b);
    assert_eq!(peers_a, vec!["b".to_string()]);
    assert_eq!(peers_b, vec!["a".to_string()]);

    tokio::time::advance(Duration::from_secs(121)).await;

    match recv_event(&mut c.events).await {
        SessionEvent::MatchTimeout => {}
        other => panic!("expected MatchTimeout for c, got {other:?}"),
    }

    registry.cancel();
}

#[tokio::test]
async fn test_truncated_scan_falls_back_to_cross_level() {
    // With a scan window of 1 and two differently-leveled entries, no
    // same-level pair exists in the window, so the two longest-waiting
    // entries pair across levels.
    let config = Config {
        level_scan_depth: 1,
        ..Config::default()
    };
    let registry = RegistryHandle::new(config);

    let mut x = registry.connect("x").await.unwrap();
    let mut y = registry.connect("y").await.unwrap();

    registry
        .enqueue("x", CallKind::OneOnOne, Level::Beginner, None)
        .await
        .unwrap();
    registry
        .enqueue("y", CallKind::OneOnOne, Level::Advanced, None)
        .await
        .unwrap();

    let (session_x, peers_x) = expect_matched(&mut x.events).await;
    let (session_y, _) = expect_matched(&mut y.events).await;
    assert_eq!(session_x, session_y);
    assert_eq!(peers_x, vec!["y".to_string()]);

    registry.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_group_accumulates_activates_and_closes_the_door() {
    let registry = RegistryHandle::new(Config::default());

    let mut founders = Vec::new();
    for name in ["g1", "g2", "g3"] {
        let conn = registry.connect(name).await.unwrap();
        registry
            .enqueue(name, CallKind::Group, Level::Intermediate, Some("travel".to_string()))
            .await
            .unwrap();
        founders.push(conn);
    }

    // Everyone lands in the same waiting session
    let mut session_ids = Vec::new();
    for conn in &mut founders {
        let (session_id, _) = expect_matched(&mut conn.events).await;
        session_ids.push(session_id);
    }
    assert!(session_ids.windows(2).all(|w| w[0] == w[1]));
    let session_id = session_ids.remove(0);

    let state = registry.session_state(&session_id).await.unwrap();
    assert_eq!(state.status, SessionStatus::Waiting);

    // Wait deadline passes with three members: the session activates
    tokio::time::advance(Duration::from_secs(31)).await;
    tokio::task::yield_now().await;

    let state = registry.session_state(&session_id).await.unwrap();
    assert_eq!(state.status, SessionStatus::Active);
    assert_eq!(state.peers.len(), 3);

    // An activated group never offers another slot
    let _late = registry.connect("late").await.unwrap();
    let result = registry.join(&session_id, "late").await;
    assert!(matches!(result, Err(CallError::SessionFull)));

    registry.cancel();
}

#[tokio::test]
async fn test_group_activates_immediately_at_capacity() {
    let registry = RegistryHandle::new(Config::default());

    let mut members = Vec::new();
    for name in ["m1", "m2", "m3", "m4"] {
        let conn = registry.connect(name).await.unwrap();
        registry
            .enqueue(name, CallKind::Group, Level::Beginner, None)
            .await
            .unwrap();
        members.push(conn);
    }

    let (session_id, _) = expect_matched(&mut members.first_mut().unwrap().events).await;

    let state = registry.session_state(&session_id).await.unwrap();
    assert_eq!(state.status, SessionStatus::Active);
    assert_eq!(state.peers.len(), 4);

    registry.cancel();
}

#[tokio::test]
async fn test_signals_arrive_in_send_order_after_matched() {
    let registry = RegistryHandle::new(Config::default());
    let mut alice = registry.connect("alice").await.unwrap();
    let mut bob = registry.connect("bob").await.unwrap();

    registry
        .enqueue("alice", CallKind::Free, Level::Beginner, None)
        .await
        .unwrap();
    registry
        .enqueue("bob", CallKind::Free, Level::Beginner, None)
        .await
        .unwrap();

    let (session_id, _) = expect_matched(&mut alice.events).await;

    for seq in 1..=3 {
        registry
            .relay(
                &session_id,
                "alice",
                Some("bob".to_string()),
                serde_json::json!({"seq": seq}),
            )
            .await
            .unwrap();
    }

    // Bob's Matched precedes every signal, and the signals keep alice's
    // send order
    let (bob_session, _) = expect_matched(&mut bob.events).await;
    assert_eq!(bob_session, session_id);

    for expected in 1..=3 {
        match recv_event(&mut bob.events).await {
            SessionEvent::Signal {
                from_user_id,
                payload,
            } => {
                assert_eq!(from_user_id, "alice");
                assert_eq!(payload["seq"], expected);
            }
            other => panic!("expected Signal, got {other:?}"),
        }
    }

    registry.cancel();
}

#[tokio::test]
async fn test_mute_interleaves_with_signals_without_reorder() {
    let registry = RegistryHandle::new(Config::default());
    let mut alice = registry.connect("alice").await.unwrap();
    let mut bob = registry.connect("bob").await.unwrap();

    registry
        .enqueue("alice", CallKind::Free, Level::Beginner, None)
        .await
        .unwrap();
    registry
        .enqueue("bob", CallKind::Free, Level::Beginner, None)
        .await
        .unwrap();
    let (session_id, _) = expect_matched(&mut alice.events).await;
    let _ = expect_matched(&mut bob.events).await;

    registry
        .relay(&session_id, "alice", None, serde_json::json!({"seq": 1}))
        .await
        .unwrap();
    registry.set_muted(&session_id, "alice", true).await.unwrap();
    registry
        .relay(&session_id, "alice", None, serde_json::json!({"seq": 2}))
        .await
        .unwrap();

    match recv_event(&mut bob.events).await {
        SessionEvent::Signal { payload, .. } => assert_eq!(payload["seq"], 1),
        other => panic!("expected Signal 1, got {other:?}"),
    }
    match recv_event(&mut bob.events).await {
        SessionEvent::MuteChanged { user_id, muted } => {
            assert_eq!(user_id, "alice");
            assert!(muted);
        }
        other => panic!("expected MuteChanged, got {other:?}"),
    }
    match recv_event(&mut bob.events).await {
        SessionEvent::Signal { payload, .. } => assert_eq!(payload["seq"], 2),
        other => panic!("expected Signal 2, got {other:?}"),
    }

    registry.cancel();
}

#[tokio::test]
async fn test_no_user_lands_in_two_sessions() {
    let registry = RegistryHandle::new(Config::default());

    let names: Vec<String> = (0..6).map(|i| format!("user-{i}")).collect();
    let mut connections = Vec::new();
    for name in &names {
        connections.push((name.clone(), registry.connect(name.clone()).await.unwrap()));
    }

    // Enqueue everyone concurrently through cloned handles
    let mut joins = Vec::new();
    for name in &names {
        let handle = registry.clone();
        let name = name.clone();
        joins.push(tokio::spawn(async move {
            handle
                .enqueue(name, CallKind::OneOnOne, Level::Beginner, None)
                .await
        }));
    }
    for join in joins {
        join.await.unwrap().unwrap();
    }

    // Each user gets exactly one Matched, and sessions partition the users
    let mut session_members: HashMap<String, Vec<String>> = HashMap::new();
    for (name, conn) in &mut connections {
        let (session_id, peers) = expect_matched(&mut conn.events).await;
        assert_eq!(peers.len(), 1, "{name} should have exactly one peer");
        session_members
            .entry(session_id)
            .or_default()
            .push(name.clone());

        // No second Matched in flight
        let extra = tokio::time::timeout(Duration::from_millis(50), conn.events.recv()).await;
        assert!(extra.is_err(), "{name} received a second event");
    }

    assert_eq!(session_members.len(), 3);
    for members in session_members.values() {
        assert_eq!(members.len(), 2);
    }

    let status = registry.status().await.unwrap();
    assert_eq!(status.sessions, 3);
    assert_eq!(status.queued, 0);

    registry.cancel();
}

#[tokio::test]
async fn test_leave_ends_pair_exactly_once() {
    let registry = RegistryHandle::new(Config::default());
    let mut alice = registry.connect("alice").await.unwrap();
    let mut bob = registry.connect("bob").await.unwrap();

    registry
        .enqueue("alice", CallKind::Topic, Level::Beginner, Some("food".to_string()))
        .await
        .unwrap();
    registry
        .enqueue("bob", CallKind::Topic, Level::Beginner, Some("food".to_string()))
        .await
        .unwrap();
    let (session_id, _) = expect_matched(&mut alice.events).await;
    let _ = expect_matched(&mut bob.events).await;

    registry.leave(&session_id, "alice").await.unwrap();

    match recv_event(&mut bob.events).await {
        SessionEvent::PeerLeft { user_id } => assert_eq!(user_id, "alice"),
        other => panic!("expected PeerLeft, got {other:?}"),
    }
    match recv_event(&mut bob.events).await {
        SessionEvent::SessionEnded { session_id: ended } => assert_eq!(ended, session_id),
        other => panic!("expected SessionEnded, got {other:?}"),
    }

    // Exactly one SessionEnded: bob's channel is quiet afterwards and the
    // session is gone
    let extra = tokio::time::timeout(Duration::from_millis(50), bob.events.recv()).await;
    assert!(extra.is_err());
    assert!(matches!(
        registry.session_state(&session_id).await,
        Err(CallError::SessionNotFound)
    ));

    // Both users are free to match again
    registry
        .enqueue("alice", CallKind::Free, Level::Beginner, None)
        .await
        .unwrap();
    registry
        .enqueue("bob", CallKind::Free, Level::Beginner, None)
        .await
        .unwrap();
    let _ = expect_matched(&mut alice.events).await;

    registry.cancel();
}

#[tokio::test]
async fn test_topic_calls_only_pair_on_shared_topic() {
    let registry = RegistryHandle::new(Config::default());
    let mut food = registry.connect("food-fan").await.unwrap();
    let _music = registry.connect("music-fan").await.unwrap();
    let mut food2 = registry.connect("food-fan-2").await.unwrap();

    registry
        .enqueue(
            "food-fan",
            CallKind::Topic,
            Level::Beginner,
            Some("food".to_string()),
        )
        .await
        .unwrap();
    registry
        .enqueue(
            "music-fan",
            CallKind::Topic,
            Level::Beginner,
            Some("music".to_string()),
        )
        .await
        .unwrap();
    registry
        .enqueue(
            "food-fan-2",
            CallKind::Topic,
            Level::Beginner,
            Some("food".to_string()),
        )
        .await
        .unwrap();

    let (_, peers) = expect_matched(&mut food.events).await;
    assert_eq!(peers, vec!["food-fan-2".to_string()]);
    let _ = expect_matched(&mut food2.events).await;

    let status = registry.status().await.unwrap();
    assert_eq!(status.queued, 1, "music-fan stays queued");

    registry.cancel();
}
