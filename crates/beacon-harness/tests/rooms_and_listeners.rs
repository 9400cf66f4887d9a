//! Room replay and listener survival across reconnects.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use beacon_client::{CloseReason, RoomKind};
use beacon_core::Envelope;
use beacon_harness::{SimTransport, SwappableCredential, realtime, wait_until};
use serde_json::json;

fn counter() -> (Arc<AtomicUsize>, impl Fn(&serde_json::Value) + Send + Sync + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler = {
        let hits = Arc::clone(&hits);
        move |_: &serde_json::Value| {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    };
    (hits, handler)
}

#[tokio::test(start_paused = true)]
async fn rooms_joined_before_connecting_are_sent_on_connect() {
    let transport = SimTransport::new();
    let credentials = SwappableCredential::new("sess=abc");
    let rt = realtime(&transport, &credentials);

    rt.join_room(RoomKind::Post, "p1");
    rt.join_room(RoomKind::Post, "p1");
    rt.join_room(RoomKind::Conversation, "c1");
    rt.join_room(RoomKind::Conversation, "c2");
    assert!(transport.sent().is_empty());

    rt.connect().await.unwrap();
    assert!(wait_until(|| transport.sent().len() == 2).await);

    let sent: Vec<Envelope> = transport.sent().into_iter().map(|r| r.envelope).collect();
    assert_eq!(sent, vec![
        Envelope::new("joinPost", json!("p1")),
        Envelope::new("joinConversations", json!(["c1", "c2"])),
    ]);
}

#[tokio::test(start_paused = true)]
async fn each_room_is_replayed_exactly_once_per_reconnect() {
    let transport = SimTransport::new();
    let credentials = SwappableCredential::new("sess=abc");
    let rt = realtime(&transport, &credentials);
    rt.connect().await.unwrap();

    rt.join_room(RoomKind::Post, "p1");
    rt.join_room(RoomKind::Post, "p1");
    rt.join_room(RoomKind::Post, "p2");
    assert!(wait_until(|| transport.sent_events("joinPost").len() == 2).await);

    for round in 1..=2 {
        transport.drop_connection(CloseReason::TransportClose);
        assert!(wait_until(|| !rt.is_connected()).await);
        assert!(wait_until(|| rt.is_connected()).await);
        assert!(wait_until(|| transport.sent_events("joinPost").len() == 2 + 2 * round).await);
    }

    let by_attempt = transport.sent();
    let last = by_attempt.last().unwrap().attempt;
    let replayed: Vec<_> = by_attempt
        .iter()
        .filter(|record| record.attempt == last)
        .map(|record| record.envelope.data.clone())
        .collect();
    assert_eq!(replayed, vec![json!("p1"), json!("p2")]);
}

#[tokio::test(start_paused = true)]
async fn leave_sends_leave_only_where_a_primitive_exists() {
    let transport = SimTransport::new();
    let credentials = SwappableCredential::new("sess=abc");
    let rt = realtime(&transport, &credentials);
    rt.connect().await.unwrap();

    rt.join_room(RoomKind::Post, "p1");
    rt.join_room(RoomKind::Conversation, "c1");
    rt.leave_room(RoomKind::Post, "p1");
    rt.leave_room(RoomKind::Conversation, "c1");
    rt.leave_room(RoomKind::Post, "never-joined");

    assert!(wait_until(|| transport.sent().len() == 3).await);
    assert_eq!(transport.sent_events("leavePost"), vec![Envelope::new("leavePost", json!("p1"))]);
    assert!(rt.joined_rooms(RoomKind::Conversation).is_empty());
}

#[tokio::test(start_paused = true)]
async fn left_rooms_are_not_replayed() {
    let transport = SimTransport::new();
    let credentials = SwappableCredential::new("sess=abc");
    let rt = realtime(&transport, &credentials);

    rt.join_room(RoomKind::Conversation, "c1");
    rt.join_room(RoomKind::Conversation, "c2");
    rt.leave_room(RoomKind::Conversation, "c1");
    rt.connect().await.unwrap();

    assert!(wait_until(|| transport.sent().len() == 1).await);
    assert_eq!(transport.sent_events("joinConversations"), vec![Envelope::new(
        "joinConversations",
        json!(["c2"])
    )]);
}

#[tokio::test(start_paused = true)]
async fn listeners_survive_reconnect() {
    let transport = SimTransport::new();
    let credentials = SwappableCredential::new("sess=abc");
    let rt = realtime(&transport, &credentials);

    let (hits, handler) = counter();
    rt.on("newMessage", handler);
    rt.connect().await.unwrap();

    transport.server_event("newMessage", json!({"id": 1}));
    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1).await);

    transport.drop_connection(CloseReason::TransportError("reset".into()));
    assert!(wait_until(|| !rt.is_connected()).await);
    assert!(wait_until(|| rt.is_connected()).await);

    transport.server_event("newMessage", json!({"id": 2}));
    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 2).await);
}

#[tokio::test(start_paused = true)]
async fn off_and_dropped_subscriptions_stop_delivery() {
    let transport = SimTransport::new();
    let credentials = SwappableCredential::new("sess=abc");
    let rt = realtime(&transport, &credentials);
    rt.connect().await.unwrap();

    let (kept_hits, kept) = counter();
    let (off_hits, removed) = counter();
    let (guard_hits, guarded) = counter();
    let _kept = rt.subscribe("typing", kept);
    let id = rt.on("typing", removed);
    let guard = rt.subscribe("typing", guarded);

    assert!(rt.off("typing", id));
    drop(guard);

    transport.server_event("typing", json!(null));
    assert!(wait_until(|| kept_hits.load(Ordering::SeqCst) == 1).await);
    assert_eq!(off_hits.load(Ordering::SeqCst), 0);
    assert_eq!(guard_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn emit_is_dropped_unless_connected() {
    let transport = SimTransport::new();
    let credentials = SwappableCredential::new("sess=abc");
    let rt = realtime(&transport, &credentials);

    assert!(!rt.emit("typing", json!({"conversationId": "c1"})));

    rt.connect().await.unwrap();
    assert!(rt.emit("typing", json!({"conversationId": "c1"})));
    assert!(wait_until(|| transport.sent_events("typing").len() == 1).await);

    rt.disconnect();
    assert!(!rt.emit("typing", json!({"conversationId": "c1"})));
}
