//! Integration tests for presence ("who is editing what").
//!
//! These tests start a real server and connect two clients, verifying that
//! presence fans out between sessions of the same document only and never
//! touches the change log.

use grid_collab::client::{ClientConfig, SyncClient, SyncEvent};
use grid_collab::config::ServerConfig;
use grid_collab::presence::{PresenceRoom, PresenceState, PresenceUpdate};
use grid_collab::schema::TableSchema;
use grid_collab::server::SyncServer;
use grid_collab::session::ReconnectPolicy;
use grid_collab::DocumentId;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

async fn start_test_server() -> (Arc<SyncServer>, String) {
    let config = ServerConfig {
        max_sessions_per_document: 10,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let s = server.clone();
    tokio::spawn(async move {
        s.serve_ws(listener).await.unwrap();
    });
    (server, url)
}

/// Connect a client and wait until its subscription is live.
async fn connect_client(
    name: &str,
    doc_id: DocumentId,
    url: &str,
) -> (SyncClient, tokio::sync::mpsc::Receiver<SyncEvent>) {
    let mut config = ClientConfig::new(url, name);
    config.reconnect = ReconnectPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    };
    let (client, mut events) = SyncClient::connect(config, doc_id);
    next_matching(&mut events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    (client, events)
}

async fn next_matching<F>(events: &mut tokio::sync::mpsc::Receiver<SyncEvent>, pred: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("client stopped");
        if pred(&event) {
            return event;
        }
    }
}

fn presence_from(session: Uuid) -> impl Fn(&SyncEvent) -> bool {
    move |e| matches!(e, SyncEvent::Presence(u) if u.session_id == session)
}

async fn document(server: &SyncServer) -> DocumentId {
    let doc = Uuid::new_v4();
    server
        .gateway()
        .create_document(doc, TableSchema::default())
        .unwrap();
    doc
}

#[tokio::test]
async fn test_editing_presence_reaches_peer() {
    let (server, url) = start_test_server().await;
    let doc = document(&server).await;

    let (alice, _alice_events) = connect_client("Alice", doc, &url).await;
    let (bob, mut bob_events) = connect_client("Bob", doc, &url).await;

    alice
        .set_presence(PresenceState::Editing {
            record_id: "rec1".into(),
            field: Some("status".into()),
        })
        .await;

    let event = next_matching(&mut bob_events, presence_from(alice.session_id())).await;
    match event {
        SyncEvent::Presence(update) => {
            assert_eq!(update.user_name, "Alice");
            assert_eq!(
                update.state,
                PresenceState::Editing {
                    record_id: "rec1".into(),
                    field: Some("status".into())
                }
            );
        }
        other => panic!("unexpected event {other:?}"),
    }

    let peers = bob.peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].session_id, alice.session_id());

    // Presence is not an operation
    assert_eq!(server.gateway().change_log().head(doc).unwrap(), 0);
}

#[tokio::test]
async fn test_late_joiner_sees_current_presence() {
    let (server, url) = start_test_server().await;
    let doc = document(&server).await;

    let (alice, _alice_events) = connect_client("Alice", doc, &url).await;
    alice
        .set_presence(PresenceState::Editing {
            record_id: "rec7".into(),
            field: None,
        })
        .await;
    // Let the frame reach the room before Bob joins
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (bob, mut bob_events) = connect_client("Bob", doc, &url).await;
    next_matching(&mut bob_events, presence_from(alice.session_id())).await;
    assert_eq!(bob.peers().await.len(), 1);
}

#[tokio::test]
async fn test_leaving_peer_is_removed() {
    let (server, url) = start_test_server().await;
    let doc = document(&server).await;

    let (alice, _alice_events) = connect_client("Alice", doc, &url).await;
    let (bob, mut bob_events) = connect_client("Bob", doc, &url).await;

    alice.set_presence(PresenceState::Viewing).await;
    next_matching(&mut bob_events, presence_from(alice.session_id())).await;
    assert_eq!(bob.peers().await.len(), 1);

    alice.close().await;
    next_matching(&mut bob_events, |e| {
        matches!(e, SyncEvent::Presence(u) if u.state == PresenceState::Left)
    })
    .await;
    assert!(bob.peers().await.is_empty());
}

#[tokio::test]
async fn test_presence_isolated_per_document() {
    let (server, url) = start_test_server().await;
    let doc_a = document(&server).await;
    let doc_b = document(&server).await;

    let (alice, _alice_events) = connect_client("Alice", doc_a, &url).await;
    let (bob, mut bob_events) = connect_client("Bob", doc_b, &url).await;
    let (carol, mut carol_events) = connect_client("Carol", doc_a, &url).await;

    alice.set_presence(PresenceState::Viewing).await;
    next_matching(&mut carol_events, presence_from(alice.session_id())).await;

    assert!(
        timeout(Duration::from_millis(200), bob_events.recv()).await.is_err(),
        "presence leaked across documents"
    );
    assert!(bob.peers().await.is_empty());
    assert_eq!(carol.peers().await.len(), 1);
}

#[tokio::test]
async fn test_silent_peer_dropped_after_timeout() {
    let (server, url) = start_test_server().await;
    let doc = document(&server).await;

    let (alice, _alice_events) = connect_client("Alice", doc, &url).await;
    let mut config = ClientConfig::new(&url, "Bob");
    config.presence_timeout = Duration::from_millis(150);
    let (bob, mut bob_events) = SyncClient::connect(config, doc);
    next_matching(&mut bob_events, |e| matches!(e, SyncEvent::Connected { .. })).await;

    alice.set_presence(PresenceState::Viewing).await;
    next_matching(&mut bob_events, presence_from(alice.session_id())).await;
    assert_eq!(bob.peers().await.len(), 1);

    // Alice stays connected but sends nothing further
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(bob.peers().await.is_empty());
}

#[test]
fn test_presence_room_full_lifecycle() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let mut room = PresenceRoom::with_interval(alice, "Alice", Duration::from_secs(60));

    let first = room
        .update_local(PresenceState::Editing {
            record_id: "r1".into(),
            field: None,
        })
        .unwrap();
    assert_eq!(first.session_id, alice);
    // Unchanged state within the interval is not resent
    assert!(room
        .update_local(PresenceState::Editing {
            record_id: "r1".into(),
            field: None,
        })
        .is_none());

    room.handle_update(&PresenceUpdate {
        session_id: bob,
        user_name: "Bob".into(),
        state: PresenceState::Editing {
            record_id: "r1".into(),
            field: Some("name".into()),
        },
    });
    assert_eq!(room.editors_of("r1"), vec![bob]);

    room.handle_update(&PresenceUpdate::left(bob));
    assert_eq!(room.peer_count(), 0);
    assert_eq!(room.leave_update().state, PresenceState::Left);
}
