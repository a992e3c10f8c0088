//! Flat, id-keyed store of the tangent tree hanging off one message.

use std::collections::HashMap;

use tracing::warn;

use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::core::ids::{MessageId, TangentId};
use crate::tree::core::tangent::{Tangent, TangentRecord, TangentTurn};

/// All tangents anchored to one message.
///
/// Records are located by id in a flat map and mutated in place; parent and
/// child links are ids, so a lookup never walks the nested structure.
#[derive(Clone, Debug)]
pub struct TangentForest {
    message_id: MessageId,
    records: HashMap<TangentId, TangentRecord>,
    roots: Vec<TangentId>,
}

impl TangentForest {
    /// Create an empty forest for a message.
    #[must_use]
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            records: HashMap::new(),
            roots: Vec::new(),
        }
    }

    /// Rebuild a forest from stored records ordered by `created_at`.
    ///
    /// Child lists are derived from `parent_id`. A record whose parent is missing
    /// is kept as a top-level tangent rather than dropped.
    #[must_use]
    pub fn from_records(message_id: MessageId, records: Vec<TangentRecord>) -> Self {
        let mut forest = Self::new(message_id);
        for mut record in records {
            record.sub_tangents.clear();
            if let Some(parent_id) = record.parent_id {
                if !forest.records.contains_key(&parent_id) {
                    warn!(
                        "Tangent {} references missing parent {}; keeping it top-level",
                        record.id, parent_id
                    );
                    record.parent_id = None;
                }
            }
            forest.attach(record);
        }
        forest
    }

    /// Anchor message of every tangent in this forest.
    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Insert a new tangent under its parent (or top-level).
    ///
    /// # Errors
    /// Returns `NotFound` if the record names a parent that is not in this forest.
    pub fn insert(&mut self, record: TangentRecord) -> TreeResult<()> {
        if let Some(parent_id) = record.parent_id {
            if !self.records.contains_key(&parent_id) {
                return Err(TreeError::not_found("tangent", parent_id));
            }
        }
        self.attach(record);
        Ok(())
    }

    /// Append a turn to an existing tangent's conversation.
    ///
    /// # Errors
    /// Returns `NotFound` if the tangent is not in this forest.
    pub fn push_turn(&mut self, id: TangentId, turn: TangentTurn) -> TreeResult<()> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| TreeError::not_found("tangent", id))?;
        record.conversation.push(turn);
        Ok(())
    }

    /// Look up a tangent.
    #[must_use]
    pub fn get(&self, id: &TangentId) -> Option<&TangentRecord> {
        self.records.get(id)
    }

    /// Whether the tangent belongs to this forest.
    #[must_use]
    pub fn contains(&self, id: &TangentId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of tangents, nested ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the forest holds no tangents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Top-level tangent ids in creation order.
    #[must_use]
    pub fn roots(&self) -> &[TangentId] {
        &self.roots
    }

    /// Iterate over every record.
    pub fn iter(&self) -> impl Iterator<Item = &TangentRecord> {
        self.records.values()
    }

    /// Nested view of every top-level tangent, for rendering.
    #[must_use]
    pub fn to_tree(&self) -> Vec<Tangent> {
        self.roots
            .iter()
            .filter_map(|id| self.build_view(id))
            .collect()
    }

    fn build_view(&self, id: &TangentId) -> Option<Tangent> {
        let record = self.records.get(id)?;
        Some(Tangent {
            id: record.id,
            highlighted_text: record.highlighted_text.clone(),
            conversation: record.conversation.clone(),
            sub_tangents: record
                .sub_tangents
                .iter()
                .filter_map(|child| self.build_view(child))
                .collect(),
            created_at: record.created_at,
        })
    }

    fn attach(&mut self, record: TangentRecord) {
        let id = record.id;
        match record.parent_id.and_then(|parent| self.records.get_mut(&parent)) {
            Some(parent) => parent.sub_tangents.push(id),
            None => self.roots.push(id),
        }
        self.records.insert(id, record);
    }
}
