use thiserror::Error;
use uuid::Uuid;

use scribe_core::{CharId, DocumentError};

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by sessions, the sync protocol and the request surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("character not found: {0}")]
    CharacterNotFound(CharId),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// An operation could not be resolved against the document yet.
    #[error("merge anomaly: {0}")]
    MergeAnomaly(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl CollabError {
    /// Map a storage error, turning a missing row into `DocumentNotFound`.
    pub fn from_store(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(uuid) => Self::DocumentNotFound(uuid),
            other => Self::Persistence(other),
        }
    }
}

impl From<DocumentError> for CollabError {
    fn from(error: DocumentError) -> Self {
        match error {
            DocumentError::CharacterNotFound(id) => Self::CharacterNotFound(id),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for CollabError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::Persistence(StoreError::Io(format!("storage task failed: {error}")))
    }
}
