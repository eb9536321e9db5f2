//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - A local replica fed by the server's snapshot and deltas
//! - Offline queue for edits made while disconnected
//!
//! Edits are index based and resolved by the server; the replica only ever
//! integrates characters the server committed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use scribe_core::{CharId, Character, Document};

use crate::error::CollabError;
use crate::protocol::{ClientEvent, Delta, ProtocolError, ServerEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Snapshot received; the replica now holds `text`.
    Joined { version: u64, text: String },
    UserJoined(String),
    UserLeft(String),
    /// Someone else's committed changes.
    Update(Delta),
    /// Our own committed changes.
    Ack(Delta),
    Error(String),
    Pong,
}

/// Offline queue for edits made while disconnected.
///
/// Queued events are replayed, in order, after the next join.
pub struct OfflineQueue {
    queue: VecDeque<QueuedEvent>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    event: ClientEvent,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` when the queue is full.
    pub fn enqueue(&mut self, event: ClientEvent) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedEvent {
            event,
            queued_at: Instant::now(),
        });
        true
    }

    pub fn drain(&mut self) -> Vec<ClientEvent> {
        self.queue.drain(..).map(|queued| queued.event).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// How long the oldest queued edit has been waiting.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|queued| queued.queued_at.elapsed())
    }
}

/// Local copy of a document, built from what the server committed.
pub struct ClientReplica {
    document: Document,
}

impl ClientReplica {
    pub fn new(doc_id: Uuid) -> Self {
        Self {
            document: Document::new(doc_id),
        }
    }

    /// Replace the replica with a `joined-room` snapshot.
    pub fn apply_snapshot(&mut self, characters: &[Character]) {
        self.document = Document::from_characters(self.document.uuid(), characters);
    }

    /// Integrate a delta. Returns how many characters changed.
    pub fn apply_delta(&mut self, delta: &Delta) -> usize {
        self.document.integrate(&delta.changes)
    }

    /// Id of the visible character at `index`.
    pub fn char_id_at(&self, index: usize) -> Option<CharId> {
        self.document.state().visible().nth(index).map(|c| c.id().clone())
    }

    pub fn text(&self) -> String {
        self.document.to_string()
    }

    pub fn len(&self) -> usize {
        self.document.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document.is_empty()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }
}

/// The sync client for one document.
pub struct SyncClient {
    token: String,
    doc_id: Uuid,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    replica: Arc<Mutex<ClientReplica>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientEvent>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(token: impl Into<String>, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            token: token.into(),
            doc_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(Mutex::new(ClientReplica::new(doc_id))),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the document and replay queued edits.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match self.open().await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(256);
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let frame = match event.encode() {
                    Ok(bytes) => Message::Binary(bytes.into()),
                    Err(e) => {
                        log::error!("Cannot encode {event:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        out_tx
            .send(ClientEvent::JoinDoc { doc_id: self.doc_id })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued edits", queued.len());
        }
        for event in queued {
            out_tx.send(event).await.map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let replica = self.replica.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                let decoded = match message {
                    Ok(Message::Binary(data)) => ServerEvent::decode(&data),
                    Ok(Message::Text(text)) => ServerEvent::from_json(text.as_str()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(event) => {
                        let event = Self::integrate(&replica, event).await;
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Undecodable server frame: {e}"),
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn open(
        &self,
    ) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, ProtocolError>
    {
        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        Ok(ws_stream)
    }

    /// Fold a server event into the replica and translate it for the application.
    async fn integrate(replica: &Mutex<ClientReplica>, event: ServerEvent) -> SyncEvent {
        match event {
            ServerEvent::JoinedRoom { version, characters, .. } => {
                let mut replica = replica.lock().await;
                replica.apply_snapshot(&characters);
                SyncEvent::Joined {
                    version,
                    text: replica.text(),
                }
            }
            ServerEvent::UserJoined { user_id, .. } => SyncEvent::UserJoined(user_id),
            ServerEvent::UserLeft { user_id, .. } => SyncEvent::UserLeft(user_id),
            ServerEvent::UpdateDocServer(delta) => {
                replica.lock().await.apply_delta(&delta);
                SyncEvent::Update(delta)
            }
            ServerEvent::UpdateDocAck(delta) => {
                replica.lock().await.apply_delta(&delta);
                SyncEvent::Ack(delta)
            }
            ServerEvent::ServerError { message } => SyncEvent::Error(message),
            ServerEvent::Pong => SyncEvent::Pong,
        }
    }

    /// Close the connection. Later edits are queued.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Insert `text` at visible offset `index`.
    pub async fn insert(&self, index: usize, text: &str) -> Result<(), CollabError> {
        if text.is_empty() {
            return Err(CollabError::Validation("insert payload must not be empty".into()));
        }
        self.send(ClientEvent::UpdateDocClient {
            doc_id: self.doc_id,
            payload: text.to_string(),
            index: Some(index),
        })
        .await
    }

    /// Delete the visible character at `index` of the local replica.
    pub async fn delete(&self, index: usize) -> Result<(), CollabError> {
        let replica = self.replica.lock().await;
        let target = replica.char_id_at(index).ok_or_else(|| {
            CollabError::Validation(format!("index {index} out of bounds for length {}", replica.len()))
        })?;
        drop(replica);
        self.send(ClientEvent::UpdateDocClient {
            doc_id: self.doc_id,
            payload: target.to_string(),
            index: None,
        })
        .await
    }

    pub async fn send_ping(&self) -> Result<(), CollabError> {
        match &self.outgoing_tx {
            Some(tx) if self.connection_state().await == ConnectionState::Connected => {
                tx.send(ClientEvent::Ping).await.map_err(|_| ProtocolError::ConnectionClosed)?;
                Ok(())
            }
            _ => Err(ProtocolError::ConnectionClosed.into()),
        }
    }

    /// Send an edit, or queue it while offline.
    async fn send(&self, event: ClientEvent) -> Result<(), CollabError> {
        if let Some(tx) = &self.outgoing_tx {
            if self.connection_state().await == ConnectionState::Connected {
                return tx
                    .send(event)
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed.into());
            }
        }
        if !self.offline_queue.lock().await.enqueue(event) {
            return Err(ProtocolError::ConnectionClosed.into());
        }
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn text(&self) -> String {
        self.replica.lock().await.text()
    }

    pub fn replica(&self) -> &Arc<Mutex<ClientReplica>> {
        &self.replica
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::OriginId;

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("token", Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
        assert_eq!(client.text().await, "");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_insert_offline_queues() {
        let client = SyncClient::new("token", Uuid::new_v4(), "ws://localhost:9090");
        client.insert(0, "a").await.unwrap();
        client.insert(1, "b").await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
        assert!(matches!(client.insert(0, "").await, Err(CollabError::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_needs_known_character() {
        let client = SyncClient::new("token", Uuid::new_v4(), "ws://localhost:9090");
        assert!(matches!(client.delete(0).await, Err(CollabError::Validation(_))));
    }

    #[tokio::test]
    async fn test_ping_offline_fails() {
        let client = SyncClient::new("token", Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.send_ping().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = SyncClient::new("token", Uuid::new_v4(), "ws://127.0.0.1:1");
        assert!(matches!(client.connect().await, Err(ProtocolError::Handshake(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("token", Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_offline_queue_capacity_and_order() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(ClientEvent::Ping));
        assert!(queue.enqueue(ClientEvent::LeaveDoc { doc_id: Uuid::nil() }));
        assert!(!queue.enqueue(ClientEvent::Ping));
        assert!(queue.oldest_age().is_some());

        assert_eq!(
            queue.drain(),
            vec![ClientEvent::Ping, ClientEvent::LeaveDoc { doc_id: Uuid::nil() }]
        );
        assert!(queue.is_empty());
        assert!(queue.oldest_age().is_none());
    }

    #[test]
    fn test_replica_snapshot_and_delta() {
        let doc_id = Uuid::new_v4();
        let mut server = Document::new(doc_id);
        let origin = OriginId::new("c1");
        let ops = server.insert_text(0, "abc", &origin).unwrap();
        server.apply(ops);

        let mut replica = ClientReplica::new(doc_id);
        let snapshot: Vec<Character> = server.visible_characters().into_iter().cloned().collect();
        replica.apply_snapshot(&snapshot);
        assert_eq!(replica.text(), "abc");

        let delete = server.delete_at(1, &origin).unwrap();
        let report = server.apply([delete]);
        let delta = Delta::new(doc_id, report.version, report.changes);
        assert_eq!(replica.apply_delta(&delta), 1);
        assert_eq!(replica.text(), "ac");
        assert_eq!(replica.apply_delta(&delta), 0);
        assert_eq!(replica.char_id_at(1), server.state().visible().nth(1).map(|c| c.id().clone()));
    }
}
