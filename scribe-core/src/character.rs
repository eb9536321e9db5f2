//! Characters: the elements of the replicated sequence.
//!
//! Each character carries an immutable identity `(clock, salt, origin)`, a
//! payload, and a position. Only the tombstone flag may change after
//! creation, and only from live to deleted.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::position::Position;

/// Namespace for deterministic character salts (UUIDv5).
const SALT_NAMESPACE: Uuid = Uuid::from_u128(0x5c1b_e0c4_7a2e_4d8f_9f3b_2b6e_11c0_d7a4);

/// Origin used for characters synthesized while hydrating a snapshot.
const SNAPSHOT_ORIGIN: &str = "~snapshot";

/// Identifier of the replica or client that created an operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(String);

impl OriginId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Origin of characters rebuilt from persisted text.
    pub fn snapshot() -> Self {
        Self(SNAPSHOT_ORIGIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OriginId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OriginId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A character id that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed character id {0:?}")]
pub struct ParseCharIdError(pub String);

/// Globally unique character identity.
///
/// Rendered as `"{clock}-{salt:08x}-{origin}"`. The salt is a digest of the
/// creating operation, so two operations that share `(origin, clock)` still
/// produce distinct ids while a redelivered operation reproduces its id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CharId {
    clock: u64,
    salt: u32,
    origin: OriginId,
}

impl CharId {
    pub fn new(origin: OriginId, clock: u64, salt: u32) -> Self {
        Self { clock, salt, origin }
    }

    /// Derive an id whose salt digests `parts`.
    pub fn derive(origin: OriginId, clock: u64, parts: &[&[u8]]) -> Self {
        let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len() + 4).sum());
        for part in parts {
            buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
            buf.extend_from_slice(part);
        }
        let digest = Uuid::new_v5(&SALT_NAMESPACE, &buf);
        let bytes = digest.as_bytes();
        let salt = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Self::new(origin, clock, salt)
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn salt(&self) -> u32 {
        self.salt
    }

    pub fn origin(&self) -> &OriginId {
        &self.origin
    }
}

impl fmt::Display for CharId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:08x}-{}", self.clock, self.salt, self.origin)
    }
}

impl FromStr for CharId {
    type Err = ParseCharIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseCharIdError(s.to_string());
        let mut parts = s.splitn(3, '-');
        let (Some(clock), Some(salt), Some(origin)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if salt.len() != 8 || origin.is_empty() {
            return Err(malformed());
        }
        let clock = clock.parse::<u64>().map_err(|_| malformed())?;
        let salt = u32::from_str_radix(salt, 16).map_err(|_| malformed())?;
        Ok(Self::new(OriginId::new(origin), clock, salt))
    }
}

impl TryFrom<String> for CharId {
    type Error = ParseCharIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CharId> for String {
    fn from(id: CharId) -> Self {
        id.to_string()
    }
}

/// One element of the sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    id: CharId,
    value: String,
    position: Position,
    deleted: bool,
}

/// Total order over characters: `(position, origin, clock, salt)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    position: Position,
    origin: OriginId,
    clock: u64,
    salt: u32,
}

impl Character {
    pub(crate) fn new(id: CharId, value: String, position: Position) -> Self {
        Self {
            id,
            value,
            position,
            deleted: false,
        }
    }

    pub fn id(&self) -> &CharId {
        &self.id
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn origin(&self) -> &OriginId {
        &self.id.origin
    }

    /// Lamport clock of the creating operation.
    pub fn clock(&self) -> u64 {
        self.id.clock
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_visible(&self) -> bool {
        !self.deleted
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey {
            position: self.position.clone(),
            origin: self.id.origin.clone(),
            clock: self.id.clock,
            salt: self.id.salt,
        }
    }

    /// Mark as deleted. Returns `false` if it already was.
    pub(crate) fn tombstone(&mut self) -> bool {
        if self.deleted {
            return false;
        }
        self.deleted = true;
        true
    }
}

/// Compare two characters by document order.
pub fn compare(a: &Character, b: &Character) -> Ordering {
    (&a.position, &a.id.origin, a.id.clock, a.id.salt)
        .cmp(&(&b.position, &b.id.origin, b.id.clock, b.id.salt))
}
