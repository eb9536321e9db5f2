//! End-to-end tests over real WebSocket connections.

use futures_util::{SinkExt, StreamExt};
use scribe_collab::client::{ConnectionState, SyncClient, SyncEvent};
use scribe_collab::identity::{Identity, StaticIdentities};
use scribe_collab::protocol::{ClientEvent, ServerEvent};
use scribe_collab::server::{ServerConfig, SyncServer};
use scribe_collab::session::SessionConfig;
use scribe_collab::storage::{DocumentStorage, MemoryStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server holding one document with `text`. Returns its url and the doc id.
async fn start_test_server(text: &str) -> (String, Uuid) {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    let doc_id = Uuid::new_v4();
    store.create_document(doc_id, "alice").unwrap();
    store.save_document_text(doc_id, text).unwrap();

    let identities = StaticIdentities::new()
        .with("alice-token", Identity::new("alice-tab", "alice"))
        .with("bob-token", Identity::new("bob-tab", "bob"));
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        retry_interval: Duration::from_millis(20),
        session: SessionConfig::for_testing(),
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config, store, Arc::new(identities));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), doc_id)
}

async fn next_event(rx: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

/// Skip events until one matches.
async fn wait_for(rx: &mut mpsc::Receiver<SyncEvent>, matches: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    loop {
        let event = next_event(rx).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Poll the replica until its text has `len` characters.
async fn wait_for_len(client: &SyncClient, len: usize) -> String {
    timeout(Duration::from_secs(2), async {
        loop {
            let text = client.text().await;
            if text.chars().count() == len {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("replica caught up")
}

async fn joined_client(url: &str, token: &str, doc_id: Uuid) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(token, doc_id, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
    wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;
    (client, events)
}

#[tokio::test]
async fn test_client_joins_and_receives_snapshot() {
    let (url, doc_id) = start_test_server("Hello").await;
    let mut client = SyncClient::new("alice-token", doc_id, &url);
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
    assert_eq!(
        next_event(&mut events).await,
        SyncEvent::Joined {
            version: 0,
            text: "Hello".into()
        }
    );
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.text().await, "Hello");
}

#[tokio::test]
async fn test_unauthorized_handshake_is_rejected() {
    let (url, doc_id) = start_test_server("").await;
    let mut client = SyncClient::new("mallory-token", doc_id, &url);
    assert!(client.connect().await.is_err());
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (url, doc_id) = start_test_server("ab").await;
    let (alice, mut alice_events) = joined_client(&url, "alice-token", doc_id).await;
    let (bob, _bob_events) = joined_client(&url, "bob-token", doc_id).await;
    wait_for(&mut alice_events, |e| *e == SyncEvent::UserJoined("bob".into())).await;

    alice.insert(0, "X").await.unwrap();
    bob.insert(2, "Y").await.unwrap();

    let text = wait_for_len(&alice, 4).await;
    assert_eq!(text, wait_for_len(&bob, 4).await);
    assert!(text.starts_with('X'));
    assert!(text.contains('Y'));
}

#[tokio::test]
async fn test_delete_propagates() {
    let (url, doc_id) = start_test_server("abc").await;
    let (alice, mut alice_events) = joined_client(&url, "alice-token", doc_id).await;
    let (bob, mut bob_events) = joined_client(&url, "bob-token", doc_id).await;
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::UserJoined(_))).await;

    alice.delete(1).await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Ack(_))).await;
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Update(_))).await {
        SyncEvent::Update(delta) => {
            assert_eq!(delta.changes.len(), 1);
            assert!(delta.changes[0].is_deleted());
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(alice.text().await, "ac");
    assert_eq!(bob.text().await, "ac");
}

#[tokio::test]
async fn test_server_error_for_bad_submission() {
    let (url, doc_id) = start_test_server("abc").await;
    let (alice, mut events) = joined_client(&url, "alice-token", doc_id).await;

    alice.insert(99, "x").await.unwrap();
    assert!(matches!(
        wait_for(&mut events, |e| matches!(e, SyncEvent::Error(_))).await,
        SyncEvent::Error(_)
    ));
    alice.send_ping().await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::Pong).await;
    assert_eq!(alice.text().await, "abc");
}

#[tokio::test]
async fn test_json_text_framing() {
    let (url, doc_id) = start_test_server("hi").await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/?token=alice-token"))
        .await
        .unwrap();

    let join = ClientEvent::JoinDoc { doc_id }.to_json().unwrap();
    ws.send(Message::Text(join.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    match reply {
        Message::Text(text) => match ServerEvent::from_json(text.as_str()).unwrap() {
            ServerEvent::JoinedRoom { characters, .. } => assert_eq!(characters.len(), 2),
            other => panic!("expected snapshot, got {other:?}"),
        },
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offline_edits_replay_on_connect() {
    let (url, doc_id) = start_test_server("").await;
    let mut alice = SyncClient::new("alice-token", doc_id, &url);
    let mut events = alice.take_event_rx().unwrap();

    alice.insert(0, "hey").await.unwrap();
    assert_eq!(alice.offline_queue_len().await, 1);

    alice.connect().await.unwrap();
    assert_eq!(alice.offline_queue_len().await, 0);
    wait_for(&mut events, |e| matches!(e, SyncEvent::Ack(_))).await;
    assert_eq!(alice.text().await, "hey");

    let (bob, _bob_events) = joined_client(&url, "bob-token", doc_id).await;
    assert_eq!(bob.text().await, "hey");
}

#[tokio::test]
async fn test_disconnect_announces_user_left() {
    let (url, doc_id) = start_test_server("x").await;
    let (_alice, mut alice_events) = joined_client(&url, "alice-token", doc_id).await;
    let (mut bob, _bob_events) = joined_client(&url, "bob-token", doc_id).await;
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::UserJoined(_))).await;

    bob.disconnect().await;
    assert_eq!(
        wait_for(&mut alice_events, |e| matches!(e, SyncEvent::UserLeft(_))).await,
        SyncEvent::UserLeft("bob".into())
    );

    bob.insert(0, "late").await.unwrap();
    assert_eq!(bob.offline_queue_len().await, 1);
}
