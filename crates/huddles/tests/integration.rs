mod common;

use common::*;
use futures_util::SinkExt;
use huddle_common::Envelope;
use huddles::registry::ConnectionState;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

const QUIET: Duration = Duration::from_millis(200);

fn joined_id(envelope: Envelope) -> String {
    match envelope {
        Envelope::ParticipantJoined { participant } => participant.id,
        other => panic!("expected participant-joined, got {other:?}"),
    }
}

#[tokio::test]
async fn roster_and_join_announcements() {
    let (addr, _state) = start_server().await;

    let mut a = TestClient::connect(&addr).await;
    assert!(a.roster.is_empty());

    let mut b = TestClient::connect(&addr).await;
    assert_eq!(b.roster.len(), 1);
    assert_eq!(b.roster[0].id, a.id);
    assert_eq!(b.roster[0].name, "User 1");
    assert_eq!(joined_id(a.recv_envelope().await), b.id);

    let c = TestClient::connect(&addr).await;
    let ids: Vec<_> = c.roster.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
    assert_eq!(joined_id(a.recv_envelope().await), c.id);
    assert_eq!(joined_id(b.recv_envelope().await), c.id);

    assert_ne!(a.id, b.id);
    assert_ne!(b.id, c.id);
}

#[tokio::test]
async fn offer_fans_out_to_everyone_but_sender() {
    let (addr, _state) = start_server().await;
    let mut a = TestClient::connect(&addr).await;
    let mut b = TestClient::connect(&addr).await;
    a.recv_envelope().await;
    let mut c = TestClient::connect(&addr).await;
    a.recv_envelope().await;
    b.recv_envelope().await;

    a.send_json(json!({"type": "offer", "offer": {"type": "offer", "sdp": "v=0"}}))
        .await;

    for peer in [&mut b, &mut c] {
        let raw = peer.recv_raw().await;
        assert_eq!(raw["type"], "offer");
        assert_eq!(raw["senderId"], a.id.as_str());
        assert_eq!(raw["offer"]["sdp"], "v=0");
    }
    a.expect_silence(QUIET).await;
}

#[tokio::test]
async fn targeted_signalling_reaches_only_target() {
    let (addr, _state) = start_server().await;
    let mut a = TestClient::connect(&addr).await;
    let mut b = TestClient::connect(&addr).await;
    a.recv_envelope().await;
    let mut c = TestClient::connect(&addr).await;
    a.recv_envelope().await;
    b.recv_envelope().await;

    a.send_json(json!({
        "type": "ice-candidate",
        "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host"},
        "target": c.id,
    }))
    .await;

    let raw = c.recv_raw().await;
    assert_eq!(raw["type"], "ice-candidate");
    assert_eq!(raw["senderId"], a.id.as_str());
    b.expect_silence(QUIET).await;

    a.send_json(json!({"type": "answer", "answer": {}, "target": "nobody"}))
        .await;
    b.expect_silence(QUIET).await;
    c.expect_silence(QUIET).await;
    a.expect_silence(QUIET).await;
}

#[tokio::test]
async fn chat_sender_is_stamped_by_relay() {
    let (addr, _state) = start_server().await;
    let mut a = TestClient::connect_with_query(&addr, "?name=Ada").await;
    let mut b = TestClient::connect(&addr).await;
    a.recv_envelope().await;

    a.send_json(json!({
        "type": "chat",
        "text": "hello",
        "sender": "Mallory",
        "senderId": "forged",
    }))
    .await;

    match b.recv_envelope().await {
        Envelope::Chat {
            text,
            sender,
            sender_id,
        } => {
            assert_eq!(text, "hello");
            assert_eq!(sender.as_deref(), Some("Ada"));
            assert_eq!(sender_id.as_deref(), Some(a.id.as_str()));
        }
        other => panic!("expected chat, got {other:?}"),
    }
    a.expect_silence(QUIET).await;
}

#[tokio::test]
async fn invalid_messages_get_error_and_connection_survives() {
    let (addr, _state) = start_server().await;
    let mut a = TestClient::connect(&addr).await;
    let mut b = TestClient::connect(&addr).await;
    a.recv_envelope().await;

    a.send_text("not json".to_string()).await;
    assert!(matches!(a.recv_envelope().await, Envelope::Error { .. }));

    a.send_json(json!({"type": "participant-list", "participants": []}))
        .await;
    assert!(matches!(a.recv_envelope().await, Envelope::Error { .. }));

    a.send_json(json!({"type": "chat", "text": 5})).await;
    assert!(matches!(a.recv_envelope().await, Envelope::Error { .. }));

    a.ws_tx.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert!(matches!(a.recv_envelope().await, Envelope::Error { .. }));

    b.expect_silence(QUIET).await;

    a.send_json(json!({"type": "chat", "text": "still here"})).await;
    let raw = b.recv_raw().await;
    assert_eq!(raw["text"], "still here");
}

#[tokio::test]
async fn leave_then_resume_within_grace_keeps_identity() {
    let (addr, state) = start_server_with_grace(5_000).await;
    let a = TestClient::connect(&addr).await;
    let mut b = TestClient::connect(&addr).await;
    let (a_id, token) = (a.id.clone(), a.session_token.clone());

    a.close().await;
    match b.recv_envelope().await {
        Envelope::ParticipantLeft { participant_id } => assert_eq!(participant_id, a_id),
        other => panic!("expected participant-left, got {other:?}"),
    }
    assert_eq!(state.registry.state_of(&a_id), ConnectionState::GracePeriod);

    let a2 = TestClient::resume(&addr, &token).await;
    assert_eq!(a2.id, a_id);
    assert_eq!(a2.session_token, token);
    assert_eq!(a2.roster.len(), 1);
    assert_eq!(a2.roster[0].id, b.id);

    match b.recv_envelope().await {
        Envelope::ParticipantJoined { participant } => {
            assert_eq!(participant.id, a_id);
            assert_eq!(participant.name, "User 1");
        }
        other => panic!("expected participant-joined, got {other:?}"),
    }
    assert_eq!(state.registry.state_of(&a_id), ConnectionState::Connected);
}

#[tokio::test]
async fn resume_after_grace_gets_new_identity() {
    let (addr, state) = start_server_with_grace(100).await;
    let a = TestClient::connect(&addr).await;
    let mut b = TestClient::connect(&addr).await;
    let (a_id, token) = (a.id.clone(), a.session_token.clone());

    a.close().await;
    assert!(matches!(
        b.recv_envelope().await,
        Envelope::ParticipantLeft { .. }
    ));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(state.registry.state_of(&a_id), ConnectionState::Removed);

    let a2 = TestClient::resume(&addr, &token).await;
    assert_ne!(a2.id, a_id);
    assert_ne!(a2.session_token, token);
    assert_eq!(joined_id(b.recv_envelope().await), a2.id);
}

#[tokio::test]
async fn takeover_closes_previous_connection() {
    let (addr, _state) = start_server().await;
    let mut a = TestClient::connect(&addr).await;
    let mut b = TestClient::connect(&addr).await;
    a.recv_envelope().await;

    let a2 = TestClient::resume(&addr, &a.session_token).await;
    assert_eq!(a2.id, a.id);
    assert!(a.closed_within(Duration::from_secs(2)).await);
    b.expect_silence(QUIET).await;
}

#[tokio::test]
async fn rate_limited_messages_get_error() {
    let (addr, _state) = start_server_with(|c| c.msg_rate = 2).await;
    let mut a = TestClient::connect(&addr).await;
    let mut b = TestClient::connect(&addr).await;
    a.recv_envelope().await;

    for i in 0..2 {
        a.send_json(json!({"type": "chat", "text": format!("m{i}")})).await;
        b.recv_raw().await;
    }
    a.send_json(json!({"type": "chat", "text": "too many"})).await;
    assert_eq!(a.recv_envelope().await, Envelope::error("rate limited"));
    b.expect_silence(QUIET).await;
}

#[tokio::test]
async fn roster_converges_after_churn() {
    let (addr, state) = start_server().await;
    let a = TestClient::connect(&addr).await;
    let b = TestClient::connect(&addr).await;
    let c = TestClient::connect(&addr).await;
    let b_id = b.id.clone();
    b.close().await;
    tokio::time::sleep(QUIET).await;

    let d = TestClient::connect(&addr).await;
    let ids: Vec<_> = d.roster.iter().map(|p| p.id.clone()).collect();
    assert_eq!(ids, vec![a.id.clone(), c.id.clone()]);
    assert!(!ids.contains(&b_id));

    let visible: Vec<_> = state
        .registry
        .visible_roster()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(visible, vec![a.id, c.id, d.id]);
}

#[tokio::test]
async fn shutdown_clears_registry_and_closes_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(huddles::ServerState::new(test_config(addr)));
    let (shutdown_tx, _) = tokio::sync::watch::channel(());

    let server = tokio::spawn(huddles::run_with_shutdown(
        listener,
        state.clone(),
        shutdown_tx.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut a = TestClient::connect(&addr).await;
    assert_eq!(state.registry.len(), 1);

    shutdown_tx.send(()).unwrap();
    assert!(a.closed_within(Duration::from_secs(2)).await);
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn shutdown_after_finished_connections_returns_promptly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(huddles::ServerState::new(test_config(addr)));
    let (shutdown_tx, _) = tokio::sync::watch::channel(());

    let server = tokio::spawn(huddles::run_with_shutdown(
        listener,
        state.clone(),
        shutdown_tx.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..3 {
        TestClient::connect(&addr).await.close().await;
    }
    tokio::time::sleep(QUIET).await;
    assert_eq!(state.active_connections.load(std::sync::atomic::Ordering::Relaxed), 0);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("drain should not wait on finished connections")
        .unwrap()
        .unwrap();
}
