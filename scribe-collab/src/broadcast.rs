//! Document rooms: fan-out of server events to every connection in a room.
//!
//! Each room is one tokio broadcast channel. Messages carry the connection
//! that caused them so receivers can skip their own echo.
//!
//! Membership and the room map sit behind synchronous locks so both can be
//! consulted while a document lock is held, without awaiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::ServerEvent;

/// Server-assigned id of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One event in a room, tagged with the connection that caused it.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    /// `None` for server-originated events.
    pub origin: Option<ConnectionId>,
    pub event: ServerEvent,
}

/// Who is in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub client_id: String,
    pub user_id: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Counters touched on the send path without taking a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A broadcast group for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomMessage>>,
    members: RwLock<HashMap<ConnectionId, Member>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many messages a slow member may fall behind before
    /// it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a member and return its receiver.
    pub fn add_member(&self, connection: ConnectionId, member: Member) -> broadcast::Receiver<Arc<RoomMessage>> {
        let mut members = write(&self.members);
        members.insert(connection, member);
        self.sender.subscribe()
    }

    pub fn remove_member(&self, connection: &ConnectionId) -> Option<Member> {
        write(&self.members).remove(connection)
    }

    /// Send to every receiver. Filtering the origin is the receiver's job.
    ///
    /// Synchronous so it can run under a document lock.
    pub fn broadcast(&self, origin: Option<ConnectionId>, event: ServerEvent) -> usize {
        let message = Arc::new(RoomMessage { origin, event });
        let count = self.sender.send(message).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record messages a lagging receiver lost.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn member_count(&self) -> usize {
        read(&self.members).len()
    }

    pub fn has_member(&self, connection: &ConnectionId) -> bool {
        read(&self.members).contains_key(connection)
    }

    pub fn members(&self) -> Vec<Member> {
        read(&self.members).values().cloned().collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document ids to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for `doc_id`.
    pub fn get_or_create(&self, doc_id: Uuid) -> Arc<BroadcastGroup> {
        if let Some(room) = read(&self.rooms).get(&doc_id) {
            return room.clone();
        }
        write(&self.rooms)
            .entry(doc_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub fn get(&self, doc_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        read(&self.rooms).get(doc_id).cloned()
    }

    /// Whether anyone is joined to `doc_id`.
    pub fn is_occupied(&self, doc_id: &Uuid) -> bool {
        read(&self.rooms).get(doc_id).is_some_and(|room| room.member_count() > 0)
    }

    /// Remove the room if nobody is left in it.
    pub fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = write(&self.rooms);
        if rooms.get(doc_id).is_some_and(|room| room.member_count() == 0) {
            rooms.remove(doc_id);
            return true;
        }
        false
    }

    /// Drop a room outright (document deleted).
    pub fn close(&self, doc_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        write(&self.rooms).remove(doc_id)
    }

    pub fn room_count(&self) -> usize {
        read(&self.rooms).len()
    }

    pub fn active_documents(&self) -> Vec<Uuid> {
        read(&self.rooms).keys().cloned().collect()
    }
}
