//! The merge engine: folds pending operations into committed state.
//!
//! `merge` is a pure function of its inputs. It takes the committed state
//! and the pending buffer by value and hands back the next state, the
//! operations still waiting, and the delta of newly committed characters.
//!
//! Pass structure:
//! 1. order pending operations by `(clock, origin)`
//! 2. fold every insert (allocate, stamp, dedupe by id)
//! 3. fold every delete; unknown targets wait for a later pass
//! 4. drop what was folded or rejected

use crate::character::Character;
use crate::document::DocumentState;
use crate::error::DocumentError;
use crate::operation::{Operation, PendingOp};

/// Limits applied by a merge pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    /// Passes a delete may wait for its target before it is dropped.
    pub max_retries: u32,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self { max_retries: 16 }
    }
}

/// An operation removed from the buffer without being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub operation: Operation,
    pub error: DocumentError,
}

/// Result of one merge pass.
#[derive(Debug)]
pub struct MergeOutcome {
    pub state: DocumentState,
    pub pending: Vec<PendingOp>,
    pub changes: Vec<Character>,
    pub rejected: Vec<Rejection>,
}

/// Run one merge pass.
pub fn merge(mut state: DocumentState, mut pending: Vec<PendingOp>, policy: &MergePolicy) -> MergeOutcome {
    pending.sort_by(|a, b| a.operation.sort_key().cmp(&b.operation.sort_key()));
    let (inserts, deletes): (Vec<_>, Vec<_>) =
        pending.into_iter().partition(|entry| entry.operation.is_insert());

    let mut changes = Vec::new();
    let mut rejected = Vec::new();

    for entry in inserts {
        match entry.operation.resolve_insert() {
            Ok(Some((id, position))) => {
                if state.characters.contains_key(&id) {
                    log::trace!("Duplicate insert {id} ignored");
                    continue;
                }
                let Operation::Insert { payload, .. } = entry.operation else {
                    continue;
                };
                let character = Character::new(id, payload, position);
                changes.push(character.clone());
                state.insert(character);
            }
            Ok(None) => {}
            Err(error) => {
                log::warn!("Rejected insert from {}: {error}", entry.operation.origin());
                rejected.push(Rejection {
                    operation: entry.operation,
                    error,
                });
            }
        }
    }

    let mut waiting = Vec::new();
    for mut entry in deletes {
        let Operation::Delete { target, .. } = &entry.operation else {
            continue;
        };
        let target = target.clone();
        match state.characters.get_mut(&target) {
            Some(character) => {
                if character.tombstone() {
                    changes.push(character.clone());
                }
            }
            None if entry.retries < policy.max_retries => {
                entry.retries += 1;
                log::debug!("Delete of {target} waiting for its insert (attempt {})", entry.retries);
                waiting.push(entry);
            }
            None => {
                log::warn!("Dropping delete of {target} after {} attempts", entry.retries);
                rejected.push(Rejection {
                    operation: entry.operation,
                    error: DocumentError::CharacterNotFound(target),
                });
            }
        }
    }

    if !changes.is_empty() {
        state.version += 1;
    }

    MergeOutcome {
        state,
        pending: waiting,
        changes,
        rejected,
    }
}
