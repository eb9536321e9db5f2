//! # scribe-collab: Sessions, sync and transport for scribe documents
//!
//! Keeps one authoritative [`scribe_core::Document`] per uuid and fans its
//! committed changes out to connected clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (replica)   │  bincode / JSON     │             │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐     ┌────────────────┐
//!                                     │SyncProtocol │ ◄── │DocumentService │
//!                                     └──┬───────┬──┘     └────────────────┘
//!                                        │       │
//!                          ┌─────────────┴┐   ┌──┴─────────────┐
//!                          │DocumentSession│   │ RoomManager    │
//!                          │ (Document/uuid)│  │ (fan-out)      │
//!                          └──────┬────────┘   └────────────────┘
//!                                 │ write-back
//!                          ┌──────┴────────┐
//!                          │DocumentStorage│  RocksStore / MemoryStore
//!                          └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Real-time events and their binary/text framing
//! - [`broadcast`]: Per-document rooms with member tracking
//! - [`session`]: Document registry, serialized commits, write-back
//! - [`sync`]: Connections, joins and edit submission
//! - [`service`]: Request-style document operations
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with offline queue
//! - [`storage`]: Persistence trait and stores
//! - [`identity`]: Token verification

pub mod broadcast;
pub mod client;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod storage;
pub mod sync;

pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Member, RoomManager, RoomMessage};
pub use client::{ClientReplica, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use error::CollabError;
pub use identity::{Claims, Identity, IdentityVerifier, JwtVerifier, StaticIdentities};
pub use protocol::{ClientEvent, Delta, Framing, ProtocolError, ServerEvent};
pub use server::{ConfigError, ServerConfig, ServerError, ServerStats, SyncServer};
pub use service::{DocumentService, DocumentUpdate, FetchedDocument};
pub use session::{Commit, DocumentHandle, DocumentSession, DocumentView, SessionConfig};
pub use storage::{DocumentRecord, DocumentStorage, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use sync::{Connection, SyncProtocol};
