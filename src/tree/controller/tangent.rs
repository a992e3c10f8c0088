//! Tangent controller: new tangents, replies and sub-tangents.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::tree::core::clock::MonotonicClock;
use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::core::ids::{ConversationId, MessageId, TangentId, TurnId};
use crate::tree::core::tangent::{Tangent, TangentRecord, TangentRole, TangentTurn};
use crate::tree::navigator::{find_tangent, lineage};
use crate::tree::storage::{TangentForest, TangentStore};

/// Owns every tangent forest of one conversation.
///
/// Each tangent id is indexed to its anchor message, so replies and sub-tangents
/// resolve in one lookup regardless of nesting depth.
pub struct TangentController {
    conversation_id: ConversationId,
    store: Arc<dyn TangentStore>,
    forests: HashMap<MessageId, TangentForest>,
    index: HashMap<TangentId, MessageId>,
    clock: MonotonicClock,
}

impl TangentController {
    /// Controller with no tangents.
    #[must_use]
    pub fn new(conversation_id: ConversationId, store: Arc<dyn TangentStore>) -> Self {
        Self::from_records(conversation_id, store, Vec::new())
    }

    /// Controller over stored records ordered by `created_at`.
    #[must_use]
    pub fn from_records(
        conversation_id: ConversationId,
        store: Arc<dyn TangentStore>,
        records: Vec<TangentRecord>,
    ) -> Self {
        let latest = records
            .iter()
            .flat_map(|record| {
                std::iter::once(record.created_at)
                    .chain(record.conversation.iter().map(|turn| turn.created_at))
            })
            .max();

        let mut grouped: HashMap<MessageId, Vec<TangentRecord>> = HashMap::new();
        for record in records {
            grouped.entry(record.message_id).or_default().push(record);
        }

        let mut index = HashMap::new();
        let forests = grouped
            .into_iter()
            .map(|(message_id, records)| {
                let forest = TangentForest::from_records(message_id, records);
                for record in forest.iter() {
                    index.insert(record.id, message_id);
                }
                (message_id, forest)
            })
            .collect();

        Self {
            conversation_id,
            store,
            forests,
            index,
            clock: MonotonicClock::starting_after(latest),
        }
    }

    /// Load a conversation's tangents from the store.
    ///
    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn load(conversation_id: ConversationId, store: Arc<dyn TangentStore>) -> TreeResult<Self> {
        let records = store.load_by_conversation(conversation_id).await?;
        debug!(
            "Loaded {} tangents for conversation {conversation_id}",
            records.len()
        );
        Ok(Self::from_records(conversation_id, store, records))
    }

    /// Start a top-level tangent on `message_id` with the user's opening remark.
    ///
    /// # Errors
    /// Returns the store error if the insert fails; nothing changes in memory then.
    pub async fn create_tangent(
        &mut self,
        message_id: MessageId,
        highlighted_text: String,
        content: String,
    ) -> TreeResult<TangentId> {
        let record = self.new_record(message_id, None, highlighted_text, content);
        self.persist_new(record).await
    }

    /// Start a tangent on a span inside `parent_tangent_id`'s own conversation.
    ///
    /// # Errors
    /// Returns `NotFound` if the parent tangent is unknown, or the store error if the
    /// insert fails.
    pub async fn create_sub_tangent(
        &mut self,
        parent_tangent_id: TangentId,
        highlighted_text: String,
        content: String,
    ) -> TreeResult<TangentId> {
        let parent = self.resolve(&parent_tangent_id)?;
        let anchored = parent
            .conversation
            .iter()
            .any(|turn| turn.content.contains(highlighted_text.as_str()));
        if !anchored {
            debug!("Highlighted text is not part of tangent {parent_tangent_id}'s conversation");
        }
        let message_id = parent.message_id;

        let record = self.new_record(message_id, Some(parent_tangent_id), highlighted_text, content);
        self.persist_new(record).await
    }

    /// Append a user turn to an existing tangent.
    ///
    /// # Errors
    /// Returns `NotFound` if the tangent is unknown, or the store error if the append
    /// fails.
    pub async fn reply_to_tangent(&mut self, tangent_id: TangentId, content: String) -> TreeResult<TurnId> {
        self.append_turn(tangent_id, TangentRole::User, content).await
    }

    /// Append an assistant turn to an existing tangent.
    ///
    /// # Errors
    /// Returns `NotFound` if the tangent is unknown, or the store error if the append
    /// fails.
    pub async fn append_assistant_reply(
        &mut self,
        tangent_id: TangentId,
        content: String,
    ) -> TreeResult<TurnId> {
        self.append_turn(tangent_id, TangentRole::Assistant, content).await
    }

    /// Nested tangents of one message, oldest first.
    #[must_use]
    pub fn tangents_for(&self, message_id: &MessageId) -> Vec<Tangent> {
        self.forests
            .get(message_id)
            .map(TangentForest::to_tree)
            .unwrap_or_default()
    }

    /// Forest anchored to `message_id`, if it has tangents.
    #[must_use]
    pub fn forest(&self, message_id: &MessageId) -> Option<&TangentForest> {
        self.forests.get(message_id)
    }

    /// Anchor message of a tangent.
    #[must_use]
    pub fn message_of(&self, tangent_id: &TangentId) -> Option<MessageId> {
        self.index.get(tangent_id).copied()
    }

    /// Look a tangent up at any depth.
    #[must_use]
    pub fn get(&self, tangent_id: &TangentId) -> Option<&TangentRecord> {
        let message_id = self.index.get(tangent_id)?;
        find_tangent(self.forests.get(message_id)?, tangent_id)
    }

    /// Tangents from the top-level ancestor down to `tangent_id`.
    #[must_use]
    pub fn lineage(&self, tangent_id: &TangentId) -> Vec<&TangentRecord> {
        self.index
            .get(tangent_id)
            .and_then(|message_id| self.forests.get(message_id))
            .map(|forest| lineage(forest, tangent_id))
            .unwrap_or_default()
    }

    /// Number of tangents across every message.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the conversation has no tangents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn resolve(&self, tangent_id: &TangentId) -> TreeResult<&TangentRecord> {
        self.get(tangent_id).ok_or_else(|| {
            warn!(
                "Tangent {tangent_id} not found in conversation {}",
                self.conversation_id
            );
            TreeError::not_found("tangent", tangent_id)
        })
    }

    fn new_record(
        &mut self,
        message_id: MessageId,
        parent_id: Option<TangentId>,
        highlighted_text: String,
        content: String,
    ) -> TangentRecord {
        let created_at: DateTime<Utc> = self.clock.tick();
        TangentRecord {
            id: TangentId::new(),
            conversation_id: self.conversation_id,
            message_id,
            parent_id,
            highlighted_text,
            conversation: vec![TangentTurn::new(TangentRole::User, content, created_at)],
            sub_tangents: Vec::new(),
            created_at,
        }
    }

    async fn persist_new(&mut self, record: TangentRecord) -> TreeResult<TangentId> {
        let id = record.id;
        let message_id = record.message_id;
        self.store.insert_tangent(record.clone()).await?;

        self.forests
            .entry(message_id)
            .or_insert_with(|| TangentForest::new(message_id))
            .insert(record)?;
        self.index.insert(id, message_id);

        debug!("Created tangent {id} on message {message_id}");
        Ok(id)
    }

    async fn append_turn(
        &mut self,
        tangent_id: TangentId,
        role: TangentRole,
        content: String,
    ) -> TreeResult<TurnId> {
        let message_id = self.resolve(&tangent_id)?.message_id;
        let turn = TangentTurn::new(role, content, self.clock.tick());
        let turn_id = turn.id;

        self.store.append_turn(tangent_id, turn.clone()).await?;
        let forest = self
            .forests
            .get_mut(&message_id)
            .ok_or_else(|| TreeError::not_found("tangent", tangent_id))?;
        forest.push_turn(tangent_id, turn)?;

        debug!("Appended {role} turn to tangent {tangent_id}");
        Ok(turn_id)
    }
}
