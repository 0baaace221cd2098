//! End-to-end sync tests over real WebSocket streams
//!
//! Each test boots a server on an ephemeral port and drives it with raw
//! `tokio-tungstenite` clients (or the full `SyncConnection` runtime for
//! the client-facing tests).

mod common;

use std::time::Duration;

use common::{connect_participant, recv_action, recv_message, send_message};
use pretty_assertions::assert_eq;

use coread::backend::server::ServerConfig;
use coread::client::{ClientConfig, ConnectionStatus, SyncConnection, SyncEvent};
use coread::shared::message::{ActionType, SyncMessage};
use coread::shared::model::{AnnotationBody, AnnotationRecord, Coordinates, ReadingMode};

fn highlight(session: i64, sender: &str, page: i32) -> SyncMessage {
    let record = AnnotationRecord {
        id: 0,
        page,
        snippet: "anchor text".into(),
        body: AnnotationBody::Highlight {
            color: "#FFFF00".into(),
        },
        coordinates: Coordinates::new(0.1, 0.2, 0.3, 0.4),
        author_id: sender.into(),
    };
    SyncMessage::annotation_add(session, sender, &record)
}

#[tokio::test]
async fn join_receives_snapshot_before_anything_else() {
    let addr = common::start_server(ServerConfig::default()).await;
    let mut a = connect_participant(addr, 1, "a").await;

    let first = recv_message(&mut a).await;
    assert_eq!(first.action_type, ActionType::ParticipantsSnapshot);
    let snap = first.snapshot.expect("snapshot body");
    assert_eq!(snap.participants.len(), 1);
    assert_eq!(snap.participants[0].user_id, "a");
    assert!(snap.participants[0].is_current_leader);
    assert_eq!(snap.current_page, 1);
}

#[tokio::test]
async fn follow_mode_page_moves_reach_followers() {
    let addr = common::start_server(ServerConfig::default()).await;
    let mut a = connect_participant(addr, 1, "a").await;
    recv_message(&mut a).await;
    let mut b = connect_participant(addr, 1, "b").await;
    recv_message(&mut b).await;

    send_message(&mut a, &SyncMessage::reading_mode_change(1, "a", ReadingMode::Follow)).await;
    send_message(&mut a, &SyncMessage::page_move(1, "a", 7)).await;

    let mode = recv_action(&mut b, ActionType::ReadingModeChange).await;
    assert_eq!(mode.payload.reading_mode, Some(ReadingMode::Follow));
    let moved = recv_action(&mut b, ActionType::PageMove).await;
    assert_eq!(moved.payload.page, 7);
    assert_eq!(moved.sender_id, "a");
}

#[tokio::test]
async fn non_leader_page_move_is_silently_dropped() {
    let addr = common::start_server(ServerConfig::default()).await;
    let mut a = connect_participant(addr, 1, "a").await;
    recv_message(&mut a).await;
    let mut b = connect_participant(addr, 1, "b").await;
    recv_message(&mut b).await;

    send_message(&mut a, &SyncMessage::reading_mode_change(1, "a", ReadingMode::Follow)).await;
    // b is not the leader; its move must not propagate
    send_message(&mut b, &SyncMessage::page_move(1, "b", 99)).await;
    send_message(&mut a, &SyncMessage::page_move(1, "a", 4)).await;

    let moved = recv_action(&mut b, ActionType::PageMove).await;
    assert_eq!(moved.sender_id, "a");
    assert_eq!(moved.payload.page, 4);
}

#[tokio::test]
async fn annotation_echo_returns_authoritative_id_to_sender() {
    let addr = common::start_server(ServerConfig::default()).await;
    let mut a = connect_participant(addr, 1, "a").await;
    recv_message(&mut a).await;

    send_message(&mut a, &highlight(1, "a", 2)).await;

    let echo = recv_action(&mut a, ActionType::Add).await;
    assert_eq!(echo.sender_id, "a");
    assert_eq!(echo.payload.id, Some(1));
    let record = echo.annotation_record().expect("record in echo");
    assert!(!record.is_provisional());
    assert_eq!(record.page, 2);
}

#[tokio::test]
async fn reconnect_snapshot_contains_missed_annotations() {
    let addr = common::start_server(ServerConfig::default()).await;
    let mut a = connect_participant(addr, 1, "a").await;
    recv_message(&mut a).await;
    let b = connect_participant(addr, 1, "b").await;
    drop(b);

    send_message(&mut a, &highlight(1, "a", 3)).await;
    recv_action(&mut a, ActionType::Add).await;

    let mut b = connect_participant(addr, 1, "b").await;
    let snap = recv_action(&mut b, ActionType::ParticipantsSnapshot)
        .await
        .snapshot
        .expect("snapshot body");
    assert_eq!(snap.annotations.len(), 1);
    assert_eq!(snap.annotations[0].author_id, "a");
    assert!(snap.annotations[0].id > 0);
}

#[tokio::test]
async fn rejoin_on_open_stream_receives_fresh_snapshot() {
    let addr = common::start_server(ServerConfig::default()).await;
    let mut a = connect_participant(addr, 1, "a").await;
    recv_action(&mut a, ActionType::ParticipantsSnapshot).await;

    send_message(&mut a, &highlight(1, "a", 2)).await;
    recv_action(&mut a, ActionType::Add).await;

    // A client resynchronizing in place resends JOIN on the same stream;
    // the fresh snapshot must come back on that stream, not get lost.
    send_message(&mut a, &SyncMessage::join(1, "a")).await;
    let snap = recv_action(&mut a, ActionType::ParticipantsSnapshot)
        .await
        .snapshot
        .expect("snapshot body");
    assert_eq!(snap.annotations.len(), 1);
    assert_eq!(snap.participants.len(), 1);
}

#[tokio::test]
async fn deliberate_leave_hands_leadership_over() {
    let addr = common::start_server(ServerConfig::default()).await;
    let mut a = connect_participant(addr, 1, "a").await;
    recv_message(&mut a).await;
    let mut b = connect_participant(addr, 1, "b").await;
    recv_message(&mut b).await;

    send_message(&mut a, &SyncMessage::leave(1, "a")).await;

    let left = recv_action(&mut b, ActionType::Leave).await;
    assert_eq!(left.sender_id, "a");
    let handover = recv_action(&mut b, ActionType::LeadershipTransfer).await;
    assert_eq!(handover.target_user_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn client_runtime_reconciles_own_highlight() {
    let addr = common::start_server(ServerConfig::default()).await;
    let config = ClientConfig::new(format!("ws://{}", addr), 1, "a", "Alice");
    let (conn, mut events) = SyncConnection::connect(config);

    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::Status(ConnectionStatus::Connected))
    })
    .await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::SnapshotApplied)).await;

    let provisional_id = conn
        .add_highlight(2, "anchor", "#FF0000", Coordinates::new(0.1, 0.1, 0.2, 0.2))
        .await
        .expect("send add");
    assert!(provisional_id < 0);

    // Provisional insert is visible immediately
    let added = wait_for(&mut events, |e| matches!(e, SyncEvent::AnnotationAdded(_))).await;
    let SyncEvent::AnnotationAdded(record) = added else {
        unreachable!()
    };
    assert_eq!(record.id, provisional_id);

    // The echo swaps it for the authoritative record
    let removed = wait_for(&mut events, |e| {
        matches!(e, SyncEvent::AnnotationRemoved { .. })
    })
    .await;
    let SyncEvent::AnnotationRemoved { id, replaced_by } = removed else {
        unreachable!()
    };
    assert_eq!(id, provisional_id);
    assert_eq!(replaced_by, Some(1));

    let count = conn.with_state(|s| s.annotations.len()).await;
    assert_eq!(count, 1);
    let authoritative = conn
        .with_state(|s| s.annotations.keys().next().copied())
        .await;
    assert_eq!(authoritative, Some(1));

    conn.leave_room().await;
}

#[tokio::test]
async fn client_runtime_follows_leader_page_moves() {
    let addr = common::start_server(ServerConfig::default()).await;
    let mut a = connect_participant(addr, 1, "a").await;
    recv_message(&mut a).await;

    let config = ClientConfig::new(format!("ws://{}", addr), 1, "b", "Bob");
    let (conn, mut events) = SyncConnection::connect(config);
    wait_for(&mut events, |e| matches!(e, SyncEvent::SnapshotApplied)).await;

    send_message(&mut a, &SyncMessage::reading_mode_change(1, "a", ReadingMode::Follow)).await;
    send_message(&mut a, &SyncMessage::page_move(1, "a", 7)).await;

    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::PageChanged { page: 7, .. })
    })
    .await;
    let page = conn.with_state(|s| s.current_page).await;
    assert_eq!(page, 7);
    assert!(!conn.with_state(|s| s.is_leader()).await);

    conn.leave_room().await;
}

#[tokio::test]
async fn leave_room_is_terminal_and_announced() {
    let addr = common::start_server(ServerConfig::default()).await;
    let mut a = connect_participant(addr, 1, "a").await;
    recv_message(&mut a).await;

    let config = ClientConfig::new(format!("ws://{}", addr), 1, "b", "Bob");
    let (conn, mut events) = SyncConnection::connect(config);
    wait_for(&mut events, |e| matches!(e, SyncEvent::SnapshotApplied)).await;

    recv_action(&mut a, ActionType::Join).await;
    conn.leave_room().await;

    // The other participant observes the LEAVE
    let left = recv_action(&mut a, ActionType::Leave).await;
    assert_eq!(left.sender_id, "b");

    // And the runtime reported the terminal status
    let mut saw_closed = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(1), events.recv()).await
    {
        if matches!(event, SyncEvent::Status(ConnectionStatus::Closed)) {
            saw_closed = true;
        }
    }
    assert!(saw_closed);
}

#[tokio::test]
async fn display_name_with_spaces_survives_the_handshake() {
    let addr = common::start_server(ServerConfig::default()).await;
    let config = ClientConfig::new(format!("ws://{}", addr), 1, "a", "Alice Smith");
    let (conn, mut events) = SyncConnection::connect(config);

    // The handshake would be rejected outright if the name were not
    // percent-encoded into the query string.
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::Status(ConnectionStatus::Connected))
    })
    .await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::SnapshotApplied)).await;

    // And the name round-trips to other participants unmangled
    let mut b = connect_participant(addr, 1, "b").await;
    let snap = recv_action(&mut b, ActionType::ParticipantsSnapshot)
        .await
        .snapshot
        .expect("snapshot body");
    let alice = snap
        .participants
        .iter()
        .find(|p| p.user_id == "a")
        .expect("joined participant");
    assert_eq!(alice.display_name, "Alice Smith");

    conn.leave_room().await;
}

#[tokio::test]
async fn sends_during_backoff_are_delivered_after_reconnect() {
    // Reserve an address with nothing listening on it yet
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let mut config = ClientConfig::new(format!("ws://{}", addr), 1, "a", "Alice");
    config.backoff_base = Duration::from_millis(50);
    config.backoff_cap = Duration::from_millis(200);
    let (conn, mut events) = SyncConnection::connect(config);

    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::Status(ConnectionStatus::Reconnecting))
    })
    .await;
    // Accepted while disconnected; must not be dropped on the floor
    conn.send_progress(5).expect("send while reconnecting");

    // The server comes up on the reserved address; the agent reconnects
    // and flushes the held send, whose echo proves delivery.
    let listener = tokio::net::TcpListener::bind(addr).await.expect("rebind");
    let app = coread::backend::server::create_app(ServerConfig::default());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });

    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::Status(ConnectionStatus::Connected))
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::ProgressChanged { page: 5, .. })
    })
    .await;
    let progress = conn
        .with_state(|s| s.participants["a"].max_read_page)
        .await;
    assert_eq!(progress, 5);

    conn.leave_room().await;
}

/// Drain the event stream until one matches, with a test timeout
async fn wait_for(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<SyncEvent>,
    mut pred: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended");
        if pred(&event) {
            return event;
        }
    }
}
