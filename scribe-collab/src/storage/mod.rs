//! Persistent storage for document snapshots.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  spawn_blocking  ┌─────────────────────────────────┐
//! │ DocumentSession  │ ───────────────► │ DocumentStorage                 │
//! │ (authoritative)  │                  │  ├─ RocksStore  (on disk)       │
//! └──────────────────┘                  │  └─ MemoryStore (tests, demos)  │
//!                                       └─────────────────────────────────┘
//! ```
//!
//! Only the flattened text is stored. Reopening a document synthesizes fresh
//! characters from it, so ids and tombstones do not survive a reload.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Bookkeeping kept next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub uuid: Uuid,
    /// User id of the creator.
    pub owner: String,
    /// Seconds since epoch.
    pub created_at: u64,
    /// Seconds since epoch.
    pub updated_at: u64,
}

impl DocumentRecord {
    pub fn new(uuid: Uuid, owner: impl Into<String>) -> Self {
        let now = now_secs();
        Self {
            uuid,
            owner: owner.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_secs().max(self.created_at);
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner == user_id
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(Uuid),
    #[error("document already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Blocking persistence interface. Async callers go through `spawn_blocking`.
pub trait DocumentStorage: Send + Sync + 'static {
    /// Latest flattened text, or `NotFound`.
    fn load_document_text(&self, uuid: Uuid) -> Result<String, StoreError>;

    /// Overwrite the text of an existing document. Fails with `NotFound`;
    /// only `create_document` brings a document into existence.
    fn save_document_text(&self, uuid: Uuid, text: &str) -> Result<DocumentRecord, StoreError>;

    /// Create an empty document. Fails with `AlreadyExists`.
    fn create_document(&self, uuid: Uuid, owner: &str) -> Result<DocumentRecord, StoreError>;

    fn document_record(&self, uuid: Uuid) -> Result<DocumentRecord, StoreError>;

    /// Up to `limit` records, most recently updated first.
    fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Remove text and record. Fails with `NotFound`.
    fn delete_document(&self, uuid: Uuid) -> Result<(), StoreError>;
}

/// Most recently updated first; uuid breaks ties so listings are stable.
pub(crate) fn sort_for_listing(records: &mut Vec<DocumentRecord>, limit: usize) {
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.uuid.cmp(&b.uuid)));
    records.truncate(limit);
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
