//! In-memory store for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use super::{sort_for_listing, DocumentRecord, DocumentStorage, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    record: DocumentRecord,
    text: String,
}

/// A `HashMap` behind a lock. Can be switched offline to exercise failure paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Uuid, Entry>>,
    offline: AtomicBool,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with an I/O error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful `save_document_text` calls.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Io("store is offline".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Uuid, Entry>>, StoreError> {
        self.check_online()?;
        self.entries
            .read()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Entry>>, StoreError> {
        self.check_online()?;
        self.entries
            .write()
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl DocumentStorage for MemoryStore {
    fn load_document_text(&self, uuid: Uuid) -> Result<String, StoreError> {
        self.read()?
            .get(&uuid)
            .map(|entry| entry.text.clone())
            .ok_or(StoreError::NotFound(uuid))
    }

    fn save_document_text(&self, uuid: Uuid, text: &str) -> Result<DocumentRecord, StoreError> {
        let mut entries = self.write()?;
        let entry = entries.get_mut(&uuid).ok_or(StoreError::NotFound(uuid))?;
        entry.record.touch();
        entry.text = text.to_string();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(entry.record.clone())
    }

    fn create_document(&self, uuid: Uuid, owner: &str) -> Result<DocumentRecord, StoreError> {
        let mut entries = self.write()?;
        if entries.contains_key(&uuid) {
            return Err(StoreError::AlreadyExists(uuid));
        }
        let record = DocumentRecord::new(uuid, owner);
        entries.insert(
            uuid,
            Entry {
                record: record.clone(),
                text: String::new(),
            },
        );
        Ok(record)
    }

    fn document_record(&self, uuid: Uuid) -> Result<DocumentRecord, StoreError> {
        self.read()?
            .get(&uuid)
            .map(|entry| entry.record.clone())
            .ok_or(StoreError::NotFound(uuid))
    }

    fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut records: Vec<DocumentRecord> =
            self.read()?.values().map(|entry| entry.record.clone()).collect();
        sort_for_listing(&mut records, limit);
        Ok(records)
    }

    fn delete_document(&self, uuid: Uuid) -> Result<(), StoreError> {
        self.write()?
            .remove(&uuid)
            .map(|_| ())
            .ok_or(StoreError::NotFound(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_owner() {
        let store = MemoryStore::new();
        let uuid = Uuid::new_v4();
        store.create_document(uuid, "alice").unwrap();
        store.save_document_text(uuid, "hello").unwrap();

        assert_eq!(store.load_document_text(uuid).unwrap(), "hello");
        assert_eq!(store.document_record(uuid).unwrap().owner, "alice");
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_offline_fails_everything() {
        let store = MemoryStore::new();
        let uuid = Uuid::new_v4();
        store.create_document(uuid, "alice").unwrap();
        store.save_document_text(uuid, "x").unwrap();

        store.set_offline(true);
        assert!(matches!(store.load_document_text(uuid), Err(StoreError::Io(_))));
        assert!(store.save_document_text(uuid, "y").is_err());

        store.set_offline(false);
        assert_eq!(store.load_document_text(uuid).unwrap(), "x");
    }

    #[test]
    fn test_delete_missing() {
        let store = MemoryStore::new();
        let uuid = Uuid::new_v4();
        assert_eq!(store.delete_document(uuid), Err(StoreError::NotFound(uuid)));
    }

    #[test]
    fn test_save_never_creates() {
        let store = MemoryStore::new();
        let uuid = Uuid::new_v4();
        assert_eq!(store.save_document_text(uuid, "ghost"), Err(StoreError::NotFound(uuid)));
        assert!(store.list_documents(10).unwrap().is_empty());

        store.create_document(uuid, "alice").unwrap();
        store.delete_document(uuid).unwrap();
        assert_eq!(store.save_document_text(uuid, "zombie"), Err(StoreError::NotFound(uuid)));
        assert_eq!(store.load_document_text(uuid), Err(StoreError::NotFound(uuid)));
    }
}
