//! Operations and causal bookkeeping.
//!
//! Every mutation of a document is expressed as an [`Operation`]. Operations
//! are buffered as [`PendingOp`]s until the merge engine folds them into the
//! committed state.

use serde::{Deserialize, Serialize};

use crate::character::{CharId, OriginId};
use crate::error::DocumentError;
use crate::position::{allocate, Position};

/// A single edit, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Insert `payload` somewhere between `prev` and `next`.
    Insert {
        payload: String,
        prev: Option<Position>,
        next: Option<Position>,
        origin: OriginId,
        clock: u64,
    },
    /// Tombstone the character `target`.
    Delete {
        target: CharId,
        origin: OriginId,
        clock: u64,
    },
}

impl Operation {
    pub fn insert(
        payload: impl Into<String>,
        prev: Option<Position>,
        next: Option<Position>,
        origin: OriginId,
        clock: u64,
    ) -> Self {
        Self::Insert {
            payload: payload.into(),
            prev,
            next,
            origin,
            clock,
        }
    }

    pub fn delete(target: CharId, origin: OriginId, clock: u64) -> Self {
        Self::Delete { target, origin, clock }
    }

    pub fn origin(&self) -> &OriginId {
        match self {
            Self::Insert { origin, .. } | Self::Delete { origin, .. } => origin,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            Self::Insert { clock, .. } | Self::Delete { clock, .. } => *clock,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert { .. })
    }

    /// Shape checks that do not need document state.
    pub fn validate(&self) -> Result<(), DocumentError> {
        match self {
            Self::Insert { payload, prev, next, .. } => {
                if payload.is_empty() {
                    return Err(DocumentError::Validation(
                        "insert payload must not be empty".into(),
                    ));
                }
                if let (Some(prev), Some(next)) = (prev, next) {
                    if prev >= next {
                        return Err(DocumentError::Validation(format!(
                            "insert bounds out of order: {prev} >= {next}"
                        )));
                    }
                }
                Ok(())
            }
            Self::Delete { .. } => Ok(()),
        }
    }

    /// The id and final position an insert commits to.
    ///
    /// Pure in the operation: every replica computes the same pair no matter
    /// which other operations it has already seen.
    pub fn resolve_insert(&self) -> Result<Option<(CharId, Position)>, DocumentError> {
        let Self::Insert { payload, prev, next, origin, clock } = self else {
            return Ok(None);
        };
        let position = allocate(prev.as_ref(), next.as_ref())?.stamped(origin, *clock);
        let id = CharId::derive(
            origin.clone(),
            *clock,
            &[
                payload.as_bytes(),
                prev.as_ref().map_or(&b""[..], |p| p.as_str().as_bytes()),
                next.as_ref().map_or(&b""[..], |p| p.as_str().as_bytes()),
            ],
        );
        Ok(Some((id, position)))
    }

    pub(crate) fn sort_key(&self) -> (u64, &OriginId) {
        (self.clock(), self.origin())
    }
}

/// An operation waiting in a document's pending buffer.
///
/// Entries leave the buffer once folded or rejected, so presence in the
/// buffer means "not yet committed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOp {
    pub(crate) operation: Operation,
    pub(crate) retries: u32,
}

impl PendingOp {
    pub fn new(operation: Operation) -> Self {
        Self { operation, retries: 0 }
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Merge passes this entry has already waited through.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Lamport clock: `tick` for local events, `observe` for remote ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock(u64);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn at(value: u64) -> Self {
        Self(value)
    }

    pub fn current(&self) -> u64 {
        self.0
    }

    pub fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub fn observe(&mut self, remote: u64) -> u64 {
        self.0 = self.0.max(remote);
        self.0
    }
}
