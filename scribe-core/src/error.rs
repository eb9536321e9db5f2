use thiserror::Error;

use crate::character::CharId;
use crate::position::PositionError;

/// Errors raised by document operations and the merge engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("character not found: {0}")]
    CharacterNotFound(CharId),

    #[error("index {index} out of bounds for document of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("position error: {0}")]
    Position(#[from] PositionError),
}
