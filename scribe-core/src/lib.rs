//! # scribe-core: Sequence CRDT for collaborative plain text
//!
//! A document is an ordered set of characters. Each character has a unique
//! id and a dense, lexicographically ordered position key; deletes leave
//! tombstones so that late operations still find their targets.
//!
//! ## Data flow
//!
//! ```text
//!   Edit ──resolve_edit──► Operation ──enqueue──► pending buffer
//!                                                      │
//!                                                 apply_pending
//!                                                      │
//!                                                      ▼
//!   change log ◄──── changes ◄──── merge(state, pending, policy)
//! ```
//!
//! ## Modules
//!
//! - [`position`]: Dense position keys and the allocator
//! - [`character`]: Character ids, characters and their total order
//! - [`operation`]: Insert/delete operations and the Lamport clock
//! - [`merge`]: The pure merge pass
//! - [`document`]: The document aggregate

pub mod character;
pub mod document;
pub mod error;
pub mod merge;
pub mod operation;
pub mod position;

pub use character::{compare, CharId, Character, OriginId, ParseCharIdError, SortKey};
pub use document::{Document, DocumentState, Edit, MergeReport};
pub use error::DocumentError;
pub use merge::{merge, MergeOutcome, MergePolicy, Rejection};
pub use operation::{LamportClock, Operation, PendingOp};
pub use position::{allocate, spread, Position, PositionError};
