//! Real-time sync: connections, room membership and edit submission.
//!
//! ```text
//! connect(token) ──► Connection + inbox
//!        │
//! join(doc) ──► lock doc ─► subscribe ─► joined-room snapshot ─► forwarder task
//!        │                                                          │
//! submit ──► re-verify ─► validate ─► session.commit ─┬─► room (peers) ┘
//!                                                     └─► update-doc-ack (self)
//! ```
//!
//! Deltas are published while the document lock is held, and a joiner
//! subscribes under that same lock, so every member sees commits in order and
//! nothing between its snapshot and its first delta.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use scribe_core::{CharId, Document, DocumentError, Edit, Operation};

use crate::broadcast::{BroadcastGroup, ConnectionId, Member, RoomManager, RoomMessage};
use crate::error::CollabError;
use crate::identity::{Identity, IdentityVerifier};
use crate::protocol::{ClientEvent, Delta, ServerEvent};
use crate::session::{Commit, DocumentSession};

/// An authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
}

struct ConnectionEntry {
    identity: Identity,
    token: String,
    outbox: mpsc::UnboundedSender<ServerEvent>,
    /// Joined documents and the task forwarding each room to `outbox`.
    rooms: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl ConnectionEntry {
    fn send(&self, event: ServerEvent) {
        if self.outbox.send(event).is_err() {
            log::debug!("Dropping event for closed connection of {}", self.identity.client_id);
        }
    }
}

/// Routes edits between connections and document sessions.
pub struct SyncProtocol {
    session: DocumentSession,
    rooms: RoomManager,
    identity: Arc<dyn IdentityVerifier>,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionEntry>>>,
    max_members_per_room: usize,
}

impl SyncProtocol {
    pub fn new(
        session: DocumentSession,
        identity: Arc<dyn IdentityVerifier>,
        broadcast_capacity: usize,
        max_members_per_room: usize,
    ) -> Self {
        Self {
            session,
            rooms: RoomManager::new(broadcast_capacity),
            identity,
            connections: RwLock::new(HashMap::new()),
            max_members_per_room,
        }
    }

    pub fn session(&self) -> &DocumentSession {
        &self.session
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn identity(&self) -> &Arc<dyn IdentityVerifier> {
        &self.identity
    }

    /// Authenticate `token` and register a connection.
    ///
    /// Everything the server has for this connection arrives on the returned
    /// receiver.
    pub async fn connect(
        &self,
        token: &str,
    ) -> Result<(Connection, mpsc::UnboundedReceiver<ServerEvent>), CollabError> {
        let identity = self.identity.verify_token(token)?;
        let (outbox, inbox) = mpsc::unbounded_channel();
        let connection = Connection {
            id: ConnectionId::new(),
            identity: identity.clone(),
        };
        let entry = Arc::new(ConnectionEntry {
            identity,
            token: token.to_string(),
            outbox,
            rooms: Mutex::new(HashMap::new()),
        });
        self.connections.write().await.insert(connection.id, entry);
        log::info!(
            "Connection {} established for client {}",
            connection.id,
            connection.identity.client_id
        );
        Ok((connection, inbox))
    }

    /// Dispatch one client event.
    pub async fn handle_event(&self, connection: &Connection, event: ClientEvent) -> Result<(), CollabError> {
        match event {
            ClientEvent::JoinDoc { doc_id } => self.join(connection, doc_id).await,
            ClientEvent::LeaveDoc { doc_id } => self.leave(connection, doc_id).await.map(|_| ()),
            ClientEvent::UpdateDocClient { doc_id, payload, index } => {
                self.submit(connection, doc_id, &payload, index).await.map(|_| ())
            }
            ClientEvent::Ping => {
                self.entry(connection.id).await?.send(ServerEvent::Pong);
                Ok(())
            }
        }
    }

    /// Join the room of `doc_id`.
    ///
    /// The joiner gets a `joined-room` snapshot; everyone else gets
    /// `user-joined`. Joining twice only resends the snapshot.
    pub async fn join(&self, connection: &Connection, doc_id: Uuid) -> Result<(), CollabError> {
        let entry = self.entry(connection.id).await?;
        let handle = self.session.get_or_load(doc_id).await?;
        let room = self.rooms.get_or_create(doc_id);

        let mut joined = entry.rooms.lock().await;
        if joined.contains_key(&doc_id) {
            let document = handle.lock().await;
            entry.send(snapshot(&document));
            return Ok(());
        }
        if room.member_count() >= self.max_members_per_room {
            drop(joined);
            self.rooms.remove_if_empty(&doc_id);
            return Err(CollabError::Validation(format!("room {doc_id} is full")));
        }

        let member = Member {
            client_id: entry.identity.client_id.clone(),
            user_id: entry.identity.user_id.clone(),
        };
        let receiver = {
            let document = handle.lock().await;
            let receiver = room.add_member(connection.id, member);
            entry.send(snapshot(&document));
            room.broadcast(
                Some(connection.id),
                ServerEvent::UserJoined {
                    doc_id,
                    user_id: entry.identity.user_id.clone(),
                },
            );
            receiver
        };

        let forwarder = tokio::spawn(forward_room(connection.id, room, receiver, entry.outbox.clone()));
        joined.insert(doc_id, forwarder);
        log::info!("Connection {} joined document {doc_id}", connection.id);
        Ok(())
    }

    /// Leave the room of `doc_id`. Returns whether the connection was in it.
    pub async fn leave(&self, connection: &Connection, doc_id: Uuid) -> Result<bool, CollabError> {
        let entry = self.entry(connection.id).await?;
        let forwarder = entry.rooms.lock().await.remove(&doc_id);
        match forwarder {
            Some(forwarder) => {
                forwarder.abort();
                self.remove_member(connection.id, &entry.identity, doc_id).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Submit an edit from a connection.
    ///
    /// With `index` the payload is inserted at that visible offset, without it
    /// the payload names the character to delete. Peers receive the delta as
    /// `update-doc-server`, the submitter as `update-doc-ack`.
    pub async fn submit(
        &self,
        connection: &Connection,
        doc_id: Uuid,
        payload: &str,
        index: Option<usize>,
    ) -> Result<Delta, CollabError> {
        let entry = self.entry(connection.id).await?;
        let identity = self.identity.verify_token(&entry.token)?;
        if !entry.rooms.lock().await.contains_key(&doc_id) {
            return Err(CollabError::Validation(format!("not joined to document {doc_id}")));
        }

        let edit = parse_edit(payload, index)?;
        let origin = identity.origin();
        let commit = self
            .commit_and_broadcast(doc_id, Some(connection.id), |document| document.resolve_edit(&edit, &origin))
            .await?;

        if let Some(rejection) = commit.rejected.first() {
            return Err(rejection.error.clone().into());
        }
        entry.send(ServerEvent::UpdateDocAck(commit.delta.clone()));
        Ok(commit.delta)
    }

    /// Commit operations built against `doc_id` and publish the delta to its
    /// room under the document lock. `origin` is skipped by the forwarders.
    ///
    /// The room is looked up under the lock too: a joiner subscribes while
    /// holding it, so it either sees the change in its snapshot or as a delta.
    pub async fn commit_and_broadcast<B>(
        &self,
        doc_id: Uuid,
        origin: Option<ConnectionId>,
        build: B,
    ) -> Result<Commit, CollabError>
    where
        B: FnOnce(&mut Document) -> Result<Vec<Operation>, DocumentError>,
    {
        self.session
            .commit(doc_id, build, |delta| {
                if let Some(room) = self.rooms.get(&doc_id) {
                    let receivers = room.broadcast(origin, ServerEvent::UpdateDocServer(delta.clone()));
                    log::trace!("Delta v{} of {doc_id} sent to {receivers} receivers", delta.version);
                }
            })
            .await
    }

    /// Run the session's retry pass and publish what it produced.
    ///
    /// Resolved deltas go to the whole room. Dropped operations are reported
    /// as `server-error` to every connection of the client that sent them.
    pub async fn retry_pending(&self) -> usize {
        let connections: Vec<Arc<ConnectionEntry>> = self.connections.read().await.values().cloned().collect();

        self.session
            .retry_pending(|delta, rejected| {
                if !delta.is_empty() {
                    if let Some(room) = self.rooms.get(&delta.doc_id) {
                        room.broadcast(None, ServerEvent::UpdateDocServer(delta.clone()));
                    }
                }
                for rejection in rejected {
                    let origin = rejection.operation.origin().as_str();
                    let message = CollabError::MergeAnomaly(format!(
                        "operation on {} dropped: {}",
                        delta.doc_id, rejection.error
                    ))
                    .to_string();
                    for entry in connections.iter().filter(|entry| entry.identity.client_id == origin) {
                        entry.send(ServerEvent::error(message.clone()));
                    }
                }
            })
            .await
    }

    /// Drop a connection and all its memberships. Edits it made stay.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let Some(entry) = self.connections.write().await.remove(&connection_id) else {
            return false;
        };
        let joined: Vec<(Uuid, JoinHandle<()>)> = entry.rooms.lock().await.drain().collect();
        for (doc_id, forwarder) in joined {
            forwarder.abort();
            self.remove_member(connection_id, &entry.identity, doc_id).await;
        }
        log::info!("Connection {connection_id} closed");
        true
    }

    /// Evict idle documents nobody is joined to.
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<Uuid> {
        self.session
            .evict_idle(ttl, |doc_id| self.rooms.is_occupied(doc_id))
            .await
    }

    /// Tell every member the document is gone and close its room.
    pub async fn close_document(&self, doc_id: Uuid) {
        let Some(room) = self.rooms.close(&doc_id) else {
            return;
        };
        room.broadcast(None, ServerEvent::error(format!("document {doc_id} was deleted")));

        let connections: Vec<Arc<ConnectionEntry>> = self.connections.read().await.values().cloned().collect();
        for entry in connections {
            if let Some(forwarder) = entry.rooms.lock().await.remove(&doc_id) {
                entry.send(ServerEvent::error(format!("document {doc_id} was deleted")));
                forwarder.abort();
            }
        }
        log::info!("Closed room for deleted document {doc_id}");
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn joined_documents(&self, connection_id: ConnectionId) -> Vec<Uuid> {
        match self.connections.read().await.get(&connection_id) {
            Some(entry) => entry.rooms.lock().await.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    async fn entry(&self, connection_id: ConnectionId) -> Result<Arc<ConnectionEntry>, CollabError> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| CollabError::Unauthorized(format!("unknown connection {connection_id}")))
    }

    async fn remove_member(&self, connection_id: ConnectionId, identity: &Identity, doc_id: Uuid) {
        if let Some(room) = self.rooms.get(&doc_id) {
            room.remove_member(&connection_id);
            room.broadcast(
                Some(connection_id),
                ServerEvent::UserLeft {
                    doc_id,
                    user_id: identity.user_id.clone(),
                },
            );
        }
        if self.rooms.remove_if_empty(&doc_id) {
            log::debug!("Room {doc_id} removed (empty)");
        }
    }
}

fn snapshot(document: &Document) -> ServerEvent {
    ServerEvent::JoinedRoom {
        doc_id: document.uuid(),
        version: document.version(),
        characters: document.visible_characters().into_iter().cloned().collect(),
    }
}

/// Turn a submitted payload into an edit, rejecting malformed input.
fn parse_edit(payload: &str, index: Option<usize>) -> Result<Edit, CollabError> {
    match index {
        Some(index) => {
            if payload.is_empty() {
                return Err(CollabError::Validation("insert payload must not be empty".into()));
            }
            Ok(Edit::Insert {
                index,
                text: payload.to_string(),
            })
        }
        None => {
            let target: CharId = payload
                .parse()
                .map_err(|e| CollabError::Validation(format!("invalid character id {payload:?}: {e}")))?;
            Ok(Edit::Delete { target })
        }
    }
}

async fn forward_room(
    connection: ConnectionId,
    room: Arc<BroadcastGroup>,
    mut receiver: broadcast::Receiver<Arc<RoomMessage>>,
    outbox: mpsc::UnboundedSender<ServerEvent>,
) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                if message.origin == Some(connection) {
                    continue;
                }
                if outbox.send(message.event.clone()).is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                room.record_lag(skipped);
                log::warn!("Connection {connection} lagged by {skipped} messages");
                let resync = ServerEvent::error(format!("missed {skipped} updates; rejoin to resync"));
                if outbox.send(resync).is_err() {
                    break;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentities;
    use crate::session::SessionConfig;
    use crate::storage::{DocumentStorage, MemoryStore};
    use tokio::time::{timeout, Duration};

    async fn setup() -> (SyncProtocol, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let doc_id = Uuid::new_v4();
        store.create_document(doc_id, "alice").unwrap();
        store.save_document_text(doc_id, "hi").unwrap();
        let identities = StaticIdentities::new()
            .with("alice-token", Identity::new("alice-tab", "alice"))
            .with("bob-token", Identity::new("bob-tab", "bob"));
        let session = DocumentSession::new(store, SessionConfig::for_testing());
        (SyncProtocol::new(session, Arc::new(identities), 64, 2), doc_id)
    }

    async fn next(inbox: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(1), inbox.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_parse_edit() {
        assert!(matches!(parse_edit("x", Some(0)), Ok(Edit::Insert { index: 0, .. })));
        assert!(matches!(parse_edit("", Some(0)), Err(CollabError::Validation(_))));
        assert!(matches!(parse_edit("garbage", None), Err(CollabError::Validation(_))));

        let id = CharId::new(scribe_core::OriginId::new("c1"), 3, 0xab);
        assert_eq!(parse_edit(&id.to_string(), None).unwrap(), Edit::Delete { target: id });
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_token() {
        let (sync, _) = setup().await;
        assert!(matches!(sync.connect("nope").await, Err(CollabError::Unauthorized(_))));
        assert_eq!(sync.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_sends_snapshot_and_announces() {
        let (sync, doc_id) = setup().await;
        let (alice, mut alice_inbox) = sync.connect("alice-token").await.unwrap();
        let (bob, mut bob_inbox) = sync.connect("bob-token").await.unwrap();

        sync.join(&alice, doc_id).await.unwrap();
        match next(&mut alice_inbox).await {
            ServerEvent::JoinedRoom { characters, version, .. } => {
                assert_eq!(characters.len(), 2);
                assert_eq!(version, 0);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        sync.join(&bob, doc_id).await.unwrap();
        assert!(matches!(next(&mut bob_inbox).await, ServerEvent::JoinedRoom { .. }));
        assert_eq!(
            next(&mut alice_inbox).await,
            ServerEvent::UserJoined {
                doc_id,
                user_id: "bob".into()
            }
        );
    }

    #[tokio::test]
    async fn test_submit_acks_sender_and_updates_peers() {
        let (sync, doc_id) = setup().await;
        let (alice, mut alice_inbox) = sync.connect("alice-token").await.unwrap();
        let (bob, mut bob_inbox) = sync.connect("bob-token").await.unwrap();
        sync.join(&alice, doc_id).await.unwrap();
        sync.join(&bob, doc_id).await.unwrap();
        next(&mut alice_inbox).await;
        next(&mut alice_inbox).await;
        next(&mut bob_inbox).await;

        let delta = sync.submit(&alice, doc_id, "!", Some(2)).await.unwrap();
        assert_eq!(delta.changes.len(), 1);

        assert_eq!(next(&mut alice_inbox).await, ServerEvent::UpdateDocAck(delta.clone()));
        assert_eq!(next(&mut bob_inbox).await, ServerEvent::UpdateDocServer(delta));
        assert!(alice_inbox.try_recv().is_err());
        assert_eq!(sync.session().view(doc_id).await.unwrap().text, "hi!");
    }

    #[tokio::test]
    async fn test_submit_requires_membership() {
        let (sync, doc_id) = setup().await;
        let (alice, _inbox) = sync.connect("alice-token").await.unwrap();
        assert!(matches!(
            sync.submit(&alice, doc_id, "x", Some(0)).await,
            Err(CollabError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_room_capacity() {
        let (sync, doc_id) = setup().await;
        let (a, _a) = sync.connect("alice-token").await.unwrap();
        let (b, _b) = sync.connect("bob-token").await.unwrap();
        let (c, _c) = sync.connect("bob-token").await.unwrap();
        sync.join(&a, doc_id).await.unwrap();
        sync.join(&b, doc_id).await.unwrap();
        assert!(matches!(sync.join(&c, doc_id).await, Err(CollabError::Validation(_))));
    }

    #[tokio::test]
    async fn test_leave_and_disconnect() {
        let (sync, doc_id) = setup().await;
        let (alice, mut alice_inbox) = sync.connect("alice-token").await.unwrap();
        let (bob, _bob_inbox) = sync.connect("bob-token").await.unwrap();
        sync.join(&alice, doc_id).await.unwrap();
        sync.join(&bob, doc_id).await.unwrap();
        next(&mut alice_inbox).await;
        next(&mut alice_inbox).await;

        assert!(sync.leave(&bob, doc_id).await.unwrap());
        assert!(!sync.leave(&bob, doc_id).await.unwrap());
        assert_eq!(
            next(&mut alice_inbox).await,
            ServerEvent::UserLeft {
                doc_id,
                user_id: "bob".into()
            }
        );

        assert!(sync.disconnect(alice.id).await);
        assert_eq!(sync.rooms().room_count(), 0);
        assert_eq!(sync.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_idle_eviction_spares_joined_documents() {
        let (sync, doc_id) = setup().await;
        let (alice, mut inbox) = sync.connect("alice-token").await.unwrap();
        sync.join(&alice, doc_id).await.unwrap();
        let mut replica = match next(&mut inbox).await {
            ServerEvent::JoinedRoom { characters, .. } => Document::from_characters(doc_id, &characters),
            other => panic!("expected snapshot, got {other:?}"),
        };

        let delta = sync.submit(&alice, doc_id, "X", Some(1)).await.unwrap();
        replica.integrate(&delta.changes);
        assert_eq!(replica.to_string(), "hXi");

        timeout(Duration::from_secs(2), async {
            while !sync.session().view(doc_id).await.unwrap().pending_changes.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Reloading would hand out fresh ids the replica does not know.
        assert!(sync.evict_idle(Duration::ZERO).await.is_empty());
        assert!(sync.session().is_loaded(doc_id).await);

        let target = replica.visible_characters()[1].id().clone();
        let delta = sync.submit(&alice, doc_id, &target.to_string(), None).await.unwrap();
        replica.integrate(&delta.changes);
        assert_eq!(replica.to_string(), "hi");
        assert_eq!(sync.session().view(doc_id).await.unwrap().text, "hi");

        sync.leave(&alice, doc_id).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while sync.evict_idle(Duration::ZERO).await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!sync.session().is_loaded(doc_id).await);
    }

    #[tokio::test]
    async fn test_update_reaches_room_created_while_waiting_for_lock() {
        let (sync, doc_id) = setup().await;
        let sync = Arc::new(sync);
        let handle = sync.session().get_or_load(doc_id).await.unwrap();
        let guard = handle.lock().await;

        let update = tokio::spawn({
            let sync = sync.clone();
            async move {
                let origin = scribe_core::OriginId::new("alice-tab");
                sync.commit_and_broadcast(doc_id, None, |document| document.replace_text("hi there", &origin))
                    .await
                    .unwrap()
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Subscribe as a joiner does: create the room, then under the lock.
        let room = sync.rooms().get_or_create(doc_id);
        let member = Member {
            client_id: "carol-tab".into(),
            user_id: "carol".into(),
        };
        let mut receiver = room.add_member(ConnectionId::new(), member);
        let version = guard.version();
        drop(guard);

        let commit = update.await.unwrap();
        assert_eq!(commit.delta.version, version + 1);
        let message = timeout(Duration::from_secs(1), receiver.recv()).await.unwrap().unwrap();
        assert_eq!(message.event, ServerEvent::UpdateDocServer(commit.delta));
    }

    #[tokio::test]
    async fn test_ping() {
        let (sync, _) = setup().await;
        let (alice, mut inbox) = sync.connect("alice-token").await.unwrap();
        sync.handle_event(&alice, ClientEvent::Ping).await.unwrap();
        assert_eq!(next(&mut inbox).await, ServerEvent::Pong);
    }
}
