//! The document aggregate.
//!
//! A [`Document`] owns the committed [`DocumentState`], the pending operation
//! buffer, the change log and the Lamport clock. All mutation goes through
//! [`Document::enqueue`] + [`Document::apply_pending`]; the edit helpers only
//! build operations.

use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::character::{CharId, Character, OriginId, SortKey};
use crate::error::DocumentError;
use crate::merge::{merge, MergePolicy, Rejection};
use crate::operation::{LamportClock, Operation, PendingOp};
use crate::position::{self, Position};

/// Committed characters plus a version marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentState {
    pub(crate) characters: BTreeMap<CharId, Character>,
    pub(crate) order: BTreeMap<SortKey, CharId>,
    pub(crate) version: u64,
}

impl DocumentState {
    pub(crate) fn insert(&mut self, character: Character) {
        self.order.insert(character.sort_key(), character.id().clone());
        self.characters.insert(character.id().clone(), character);
    }

    /// All characters, tombstones included, in document order.
    pub fn ordered(&self) -> impl Iterator<Item = &Character> + '_ {
        self.order.values().filter_map(|id| self.characters.get(id))
    }

    /// Visible characters in document order.
    pub fn visible(&self) -> impl Iterator<Item = &Character> + '_ {
        self.ordered().filter(|c| c.is_visible())
    }

    pub fn text(&self) -> String {
        self.visible().map(Character::value).collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.characters.values().filter(|c| c.is_visible()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of characters including tombstones.
    pub fn total(&self) -> usize {
        self.characters.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn characters(&self) -> &BTreeMap<CharId, Character> {
        &self.characters
    }
}

/// An index-addressed edit as sent by interactive clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Insert `text` so that it starts at visible offset `index`.
    Insert { index: usize, text: String },
    /// Delete the character with this id.
    Delete { target: CharId },
}

/// What a merge pass did to a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub changes: Vec<Character>,
    pub rejected: Vec<Rejection>,
    pub version: u64,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.rejected.is_empty()
    }
}

/// A replicated plain-text document.
#[derive(Debug, Clone)]
pub struct Document {
    uuid: Uuid,
    state: DocumentState,
    pending: Vec<PendingOp>,
    change_log: Vec<Character>,
    clock: LamportClock,
    policy: MergePolicy,
}

impl Document {
    /// Create an empty document.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            state: DocumentState::default(),
            pending: Vec::new(),
            change_log: Vec::new(),
            clock: LamportClock::new(),
            policy: MergePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Rebuild a document from persisted plain text.
    ///
    /// Positions are synthesized in increasing order; the change log starts
    /// empty because nothing here is new to anyone.
    pub fn hydrate(uuid: Uuid, text: &str) -> Result<Self, DocumentError> {
        let values: Vec<char> = text.chars().collect();
        let positions = position::spread(values.len())?;
        let origin = OriginId::snapshot();

        let mut doc = Self::new(uuid);
        for (index, (value, position)) in values.into_iter().zip(positions).enumerate() {
            let clock = index as u64 + 1;
            let id = CharId::derive(origin.clone(), clock, &[position.as_str().as_bytes()]);
            doc.state.insert(Character::new(id, value.to_string(), position));
        }
        doc.clock = LamportClock::at(doc.state.total() as u64);
        log::debug!("Hydrated document {uuid} with {} characters", doc.state.total());
        Ok(doc)
    }

    /// Build a replica from characters received from an authority.
    pub fn from_characters(uuid: Uuid, characters: &[Character]) -> Self {
        let mut doc = Self::new(uuid);
        doc.integrate(characters);
        doc
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }

    pub fn clock(&self) -> u64 {
        self.clock.current()
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Number of characters including tombstones.
    pub fn total_characters(&self) -> usize {
        self.state.total()
    }

    pub fn get_character(&self, id: &CharId) -> Result<&Character, DocumentError> {
        self.state
            .characters
            .get(id)
            .ok_or_else(|| DocumentError::CharacterNotFound(id.clone()))
    }

    pub fn visible_characters(&self) -> Vec<&Character> {
        self.state.visible().collect()
    }

    pub fn pending_operations(&self) -> impl Iterator<Item = &Operation> + '_ {
        self.pending.iter().map(PendingOp::operation)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Characters committed since the last flush.
    pub fn change_log(&self) -> &[Character] {
        &self.change_log
    }

    /// Remove the first `count` change log entries (after they were persisted).
    pub fn flush_changes(&mut self, count: usize) -> Vec<Character> {
        let count = count.min(self.change_log.len());
        self.change_log.drain(..count).collect()
    }

    /// Buffer an operation for the next merge pass.
    pub fn enqueue(&mut self, operation: Operation) {
        self.clock.observe(operation.clock());
        self.pending.push(PendingOp::new(operation));
    }

    /// Fold the pending buffer into committed state.
    pub fn apply_pending(&mut self) -> MergeReport {
        if self.pending.is_empty() {
            return MergeReport {
                version: self.state.version,
                ..MergeReport::default()
            };
        }

        let state = std::mem::take(&mut self.state);
        let pending = std::mem::take(&mut self.pending);
        let outcome = merge(state, pending, &self.policy);

        self.state = outcome.state;
        self.pending = outcome.pending;
        self.change_log.extend(outcome.changes.iter().cloned());

        MergeReport {
            changes: outcome.changes,
            rejected: outcome.rejected,
            version: self.state.version,
        }
    }

    /// Enqueue all `operations` and run one merge pass.
    pub fn apply(&mut self, operations: impl IntoIterator<Item = Operation>) -> MergeReport {
        for operation in operations {
            self.enqueue(operation);
        }
        self.apply_pending()
    }

    /// Translate an index-addressed edit into operations.
    pub fn resolve_edit(&mut self, edit: &Edit, origin: &OriginId) -> Result<Vec<Operation>, DocumentError> {
        match edit {
            Edit::Insert { index, text } => self.insert_text(*index, text, origin),
            Edit::Delete { target } => Ok(vec![self.delete_character(target.clone(), origin)]),
        }
    }

    /// Operations inserting `text` at visible offset `index`, one per char.
    pub fn insert_text(
        &mut self,
        index: usize,
        text: &str,
        origin: &OriginId,
    ) -> Result<Vec<Operation>, DocumentError> {
        if text.is_empty() {
            return Err(DocumentError::Validation("insert payload must not be empty".into()));
        }
        let (mut prev, next) = self.neighbours(index)?;

        let mut operations = Vec::with_capacity(text.len());
        for value in text.chars() {
            let clock = self.clock.tick();
            let operation = Operation::insert(value.to_string(), prev.clone(), next.clone(), origin.clone(), clock);
            // Chain the next char after this one's committed position.
            prev = operation.resolve_insert()?.map(|(_, position)| position);
            operations.push(operation);
        }
        Ok(operations)
    }

    /// Operation deleting the visible character at `index`.
    pub fn delete_at(&mut self, index: usize, origin: &OriginId) -> Result<Operation, DocumentError> {
        let target = self
            .state
            .visible()
            .nth(index)
            .map(|c| c.id().clone())
            .ok_or(DocumentError::IndexOutOfBounds { index, len: self.len() })?;
        Ok(self.delete_character(target, origin))
    }

    /// Operation deleting `target`. The target need not be known yet.
    pub fn delete_character(&mut self, target: CharId, origin: &OriginId) -> Operation {
        let clock = self.clock.tick();
        Operation::delete(target, origin.clone(), clock)
    }

    /// Operations turning the current text into `text`.
    ///
    /// Keeps the common prefix and suffix and replaces the middle.
    pub fn replace_text(&mut self, text: &str, origin: &OriginId) -> Result<Vec<Operation>, DocumentError> {
        let current: Vec<(CharId, String)> = self
            .state
            .visible()
            .map(|c| (c.id().clone(), c.value().to_string()))
            .collect();
        let wanted: Vec<String> = text.chars().map(String::from).collect();

        let prefix = current
            .iter()
            .zip(&wanted)
            .take_while(|((_, have), want)| have == *want)
            .count();
        let suffix = current[prefix..]
            .iter()
            .rev()
            .zip(wanted[prefix..].iter().rev())
            .take_while(|((_, have), want)| have == *want)
            .count();

        let mut operations = Vec::new();
        for (id, _) in &current[prefix..current.len() - suffix] {
            operations.push(self.delete_character(id.clone(), origin));
        }
        let inserted: String = wanted[prefix..wanted.len() - suffix].concat();
        if !inserted.is_empty() {
            operations.extend(self.insert_text(prefix, &inserted, origin)?);
        }
        Ok(operations)
    }

    /// Apply characters already committed by an authority.
    ///
    /// Unknown characters are inserted as-is; known ones can only move to
    /// deleted. Returns how many characters changed.
    pub fn integrate(&mut self, characters: &[Character]) -> usize {
        let mut applied = 0;
        for incoming in characters {
            self.clock.observe(incoming.clock());
            match self.state.characters.get_mut(incoming.id()) {
                Some(existing) => {
                    if incoming.is_deleted() && existing.tombstone() {
                        applied += 1;
                    }
                }
                None => {
                    self.state.insert(incoming.clone());
                    applied += 1;
                }
            }
        }
        if applied > 0 {
            self.state.version += 1;
        }
        applied
    }

    /// Positions of the visible neighbours around offset `index`.
    fn neighbours(&self, index: usize) -> Result<(Option<Position>, Option<Position>), DocumentError> {
        let len = self.len();
        if index > len {
            return Err(DocumentError::IndexOutOfBounds { index, len });
        }
        let mut visible = self.state.visible().skip(index.saturating_sub(1));
        let prev = if index == 0 {
            None
        } else {
            visible.next().map(|c| c.position().clone())
        };
        let next = visible.next().map(|c| c.position().clone());
        Ok((prev, next))
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for character in self.state.visible() {
            f.write_str(character.value())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(id: &str) -> OriginId {
        OriginId::new(id)
    }

    fn edit(doc: &mut Document, index: usize, text: &str, who: &str) -> MergeReport {
        let ops = doc.insert_text(index, text, &origin(who)).unwrap();
        doc.apply(ops)
    }

    #[test]
    fn test_hydrate_roundtrip() {
        let doc = Document::hydrate(Uuid::new_v4(), "Hello").unwrap();
        assert_eq!(doc.to_string(), "Hello");
        assert_eq!(doc.len(), 5);
        assert_eq!(doc.version(), 0);
        assert!(doc.change_log().is_empty());
        assert_eq!(doc.clock(), 5);
    }

    #[test]
    fn test_empty_document() {
        let mut doc = Document::new(Uuid::new_v4());
        assert_eq!(doc.to_string(), "");
        assert_eq!(doc.len(), 0);
        assert!(doc.is_empty());

        edit(&mut doc, 0, "X", "c1");
        assert_eq!(doc.to_string(), "X");
    }

    #[test]
    fn test_insert_at_start_middle_end() {
        let mut doc = Document::hydrate(Uuid::new_v4(), "Hello").unwrap();
        edit(&mut doc, 0, "X", "c1");
        assert_eq!(doc.to_string(), "XHello");
        edit(&mut doc, 3, "Y", "c1");
        assert_eq!(doc.to_string(), "XHeYllo");
        let end = doc.len();
        edit(&mut doc, end, "Z", "c1");
        assert_eq!(doc.to_string(), "XHeYlloZ");
    }

    #[test]
    fn test_insert_multi_char_payload_keeps_order() {
        let mut doc = Document::hydrate(Uuid::new_v4(), "ad").unwrap();
        let report = edit(&mut doc, 1, "bc", "c1");
        assert_eq!(report.changes.len(), 2);
        assert_eq!(doc.to_string(), "abcd");
    }

    #[test]
    fn test_insert_out_of_bounds() {
        let mut doc = Document::hydrate(Uuid::new_v4(), "ab").unwrap();
        let err = doc.insert_text(3, "x", &origin("c1")).unwrap_err();
        assert_eq!(err, DocumentError::IndexOutOfBounds { index: 3, len: 2 });
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let mut doc = Document::hydrate(Uuid::new_v4(), "Hello").unwrap();
        let op = doc.delete_at(0, &origin("c1")).unwrap();
        let report = doc.apply([op]);
        assert_eq!(report.changes.len(), 1);
        assert!(report.changes[0].is_deleted());
        assert_eq!(doc.to_string(), "ello");
        assert_eq!(doc.len(), 4);
        assert_eq!(doc.total_characters(), 5);
    }

    #[test]
    fn test_get_character_not_found() {
        let doc = Document::new(Uuid::new_v4());
        let id = CharId::new(origin("c1"), 1, 0);
        assert_eq!(doc.get_character(&id), Err(DocumentError::CharacterNotFound(id.clone())));
    }

    #[test]
    fn test_pending_and_change_log_bookkeeping() {
        let mut doc = Document::hydrate(Uuid::new_v4(), "ab").unwrap();
        let ops = doc.insert_text(1, "xy", &origin("c1")).unwrap();
        for op in ops {
            doc.enqueue(op);
        }
        assert_eq!(doc.pending_len(), 2);
        assert!(doc.change_log().is_empty());

        let report = doc.apply_pending();
        assert_eq!(doc.pending_len(), 0);
        assert_eq!(doc.change_log().len(), 2);
        assert_eq!(report.version, 1);

        let flushed = doc.flush_changes(1);
        assert_eq!(flushed.len(), 1);
        assert_eq!(doc.change_log().len(), 1);
    }

    #[test]
    fn test_replace_text_diff() {
        let mut doc = Document::hydrate(Uuid::new_v4(), "Hello World").unwrap();
        let ops = doc.replace_text("Help World!", &origin("c1")).unwrap();
        doc.apply(ops);
        assert_eq!(doc.to_string(), "Help World!");

        let ops = doc.replace_text("", &origin("c1")).unwrap();
        doc.apply(ops);
        assert_eq!(doc.to_string(), "");
    }

    #[test]
    fn test_replace_identical_text_is_empty() {
        let mut doc = Document::hydrate(Uuid::new_v4(), "same").unwrap();
        assert!(doc.replace_text("same", &origin("c1")).unwrap().is_empty());
    }

    #[test]
    fn test_integrate_replica() {
        let uuid = Uuid::new_v4();
        let mut authority = Document::hydrate(uuid, "ab").unwrap();
        let mut replica = Document::from_characters(uuid, &authority.state().ordered().cloned().collect::<Vec<_>>());
        assert_eq!(replica.to_string(), "ab");

        let report = edit(&mut authority, 1, "X", "c1");
        assert_eq!(replica.integrate(&report.changes), 1);
        assert_eq!(replica.integrate(&report.changes), 0);
        assert_eq!(replica.to_string(), "aXb");

        let op = authority.delete_at(0, &origin("c2")).unwrap();
        let report = authority.apply([op]);
        replica.integrate(&report.changes);
        assert_eq!(replica.to_string(), "Xb");
        assert_eq!(replica.state().characters(), authority.state().characters());
    }
}
