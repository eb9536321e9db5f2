//! Request-style document operations (list, fetch, create, update, delete).
//!
//! Updates go through the same commit path as real-time edits, so joined
//! connections see them as `update-doc-server` deltas.

use std::sync::Arc;
use uuid::Uuid;

use scribe_core::{Character, Operation};

use crate::error::CollabError;
use crate::identity::Identity;
use crate::protocol::Delta;
use crate::storage::{DocumentRecord, DocumentStorage};
use crate::sync::SyncProtocol;

/// Body of an update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentUpdate {
    /// Replace the whole text.
    Text(String),
    /// Apply one operation authored by the caller.
    Operation(Operation),
}

/// A fetched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub uuid: Uuid,
    pub text: String,
    /// Committed characters not yet written back.
    pub pending_changes: Vec<Character>,
}

pub struct DocumentService {
    sync: Arc<SyncProtocol>,
}

impl DocumentService {
    pub fn new(sync: Arc<SyncProtocol>) -> Self {
        Self { sync }
    }

    fn storage(&self) -> Arc<dyn DocumentStorage> {
        self.sync.session().storage().clone()
    }

    fn authenticate(&self, token: &str) -> Result<Identity, CollabError> {
        self.sync.identity().verify_token(token)
    }

    /// Most recently updated documents first.
    pub async fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>, CollabError> {
        let storage = self.storage();
        Ok(tokio::task::spawn_blocking(move || storage.list_documents(limit)).await??)
    }

    pub async fn fetch_document(&self, token: &str, uuid: Uuid) -> Result<FetchedDocument, CollabError> {
        self.authenticate(token)?;
        let view = self.sync.session().view(uuid).await?;
        Ok(FetchedDocument {
            uuid: view.uuid,
            text: view.text,
            pending_changes: view.pending_changes,
        })
    }

    /// Create an empty document owned by the caller.
    pub async fn create_document(&self, token: &str) -> Result<DocumentRecord, CollabError> {
        let identity = self.authenticate(token)?;
        self.sync.session().create_document(&identity.user_id).await
    }

    pub async fn update_document(&self, token: &str, uuid: Uuid, update: DocumentUpdate) -> Result<Delta, CollabError> {
        let identity = self.authenticate(token)?;
        let origin = identity.origin();

        let commit = match update {
            DocumentUpdate::Text(text) => {
                self.sync
                    .commit_and_broadcast(uuid, None, |document| document.replace_text(&text, &origin))
                    .await?
            }
            DocumentUpdate::Operation(operation) => {
                if operation.origin() != &origin {
                    return Err(CollabError::Unauthorized(format!(
                        "operation origin {} does not match caller {}",
                        operation.origin(),
                        identity.client_id
                    )));
                }
                self.sync
                    .commit_and_broadcast(uuid, None, |_| Ok(vec![operation]))
                    .await?
            }
        };

        match commit.rejected.into_iter().next() {
            Some(rejection) if commit.delta.is_empty() => Err(rejection.error.into()),
            _ => Ok(commit.delta),
        }
    }

    /// Delete a document. Only its owner may.
    pub async fn delete_document(&self, token: &str, uuid: Uuid) -> Result<(), CollabError> {
        let identity = self.authenticate(token)?;
        let storage = self.storage();
        let record = tokio::task::spawn_blocking(move || storage.document_record(uuid))
            .await?
            .map_err(CollabError::from_store)?;
        if !record.is_owned_by(&identity.user_id) {
            return Err(CollabError::Unauthorized(format!(
                "{} does not own document {uuid}",
                identity.user_id
            )));
        }

        // Tombstone first so no submit can re-hydrate the document between
        // the eviction and the storage delete.
        self.sync.session().mark_deleted(uuid).await;
        self.sync.close_document(uuid).await;
        self.sync.session().evict(uuid).await;
        let storage = self.storage();
        tokio::task::spawn_blocking(move || storage.delete_document(uuid))
            .await?
            .map_err(CollabError::from_store)?;
        log::info!("Document {uuid} deleted by {}", identity.user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentities;
    use crate::session::{DocumentSession, SessionConfig};
    use crate::storage::MemoryStore;
    use scribe_core::OriginId;

    fn service() -> DocumentService {
        let identities = StaticIdentities::new()
            .with("alice", Identity::new("alice-tab", "alice"))
            .with("bob", Identity::new("bob-tab", "bob"));
        let session = DocumentSession::new(Arc::new(MemoryStore::new()), SessionConfig::for_testing());
        DocumentService::new(Arc::new(SyncProtocol::new(session, Arc::new(identities), 16, 8)))
    }

    #[tokio::test]
    async fn test_create_update_fetch() {
        let service = service();
        let record = service.create_document("alice").await.unwrap();
        assert_eq!(record.owner, "alice");

        let delta = service
            .update_document("alice", record.uuid, DocumentUpdate::Text("hello".into()))
            .await
            .unwrap();
        assert_eq!(delta.changes.len(), 5);

        let fetched = service.fetch_document("bob", record.uuid).await.unwrap();
        assert_eq!(fetched.text, "hello");
        assert_eq!(service.list_documents(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_operation_origin_must_match_caller() {
        let service = service();
        let record = service.create_document("alice").await.unwrap();
        let forged = Operation::insert("x", None, None, OriginId::new("bob-tab"), 1);
        assert!(matches!(
            service
                .update_document("alice", record.uuid, DocumentUpdate::Operation(forged))
                .await,
            Err(CollabError::Unauthorized(_))
        ));

        let own = Operation::insert("x", None, None, OriginId::new("alice-tab"), 1);
        let delta = service
            .update_document("alice", record.uuid, DocumentUpdate::Operation(own))
            .await
            .unwrap();
        assert_eq!(delta.changes.len(), 1);
    }

    #[tokio::test]
    async fn test_only_owner_deletes() {
        let service = service();
        let record = service.create_document("alice").await.unwrap();

        assert!(matches!(
            service.delete_document("bob", record.uuid).await,
            Err(CollabError::Unauthorized(_))
        ));
        service.delete_document("alice", record.uuid).await.unwrap();
        assert_eq!(
            service.fetch_document("alice", record.uuid).await,
            Err(CollabError::DocumentNotFound(record.uuid))
        );
    }

    #[tokio::test]
    async fn test_deleted_document_stays_deleted() {
        let service = service();
        let record = service.create_document("alice").await.unwrap();
        service
            .update_document("alice", record.uuid, DocumentUpdate::Text("draft".into()))
            .await
            .unwrap();

        service.delete_document("alice", record.uuid).await.unwrap();

        assert_eq!(
            service
                .update_document("bob", record.uuid, DocumentUpdate::Text("again".into()))
                .await,
            Err(CollabError::DocumentNotFound(record.uuid))
        );
        assert!(service.list_documents(10).await.unwrap().is_empty());
        assert!(matches!(
            service.delete_document("alice", record.uuid).await,
            Err(CollabError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_token() {
        let service = service();
        assert!(matches!(
            service.create_document("mallory").await,
            Err(CollabError::Unauthorized(_))
        ));
    }
}
