//! In-memory implementation of every store trait.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::core::ids::{ConversationId, NodeId, TangentId};
use crate::tree::core::node::Node;
use crate::tree::core::tangent::{TangentRecord, TangentTurn};
use crate::tree::storage::StoreFuture;
use crate::tree::storage::conversation_store::{ConversationMeta, ConversationStore};
use crate::tree::storage::node_store::NodeStore;
use crate::tree::storage::tangent_store::TangentStore;

/// Volatile store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, ConversationMeta>,
    nodes: DashMap<NodeId, Node>,
    tangents: DashMap<TangentId, TangentRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryStore {
    fn list_all(&self) -> StoreFuture<'_, TreeResult<Vec<ConversationMeta>>> {
        Box::pin(async move {
            let mut all: Vec<ConversationMeta> = self
                .conversations
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(all)
        })
    }

    fn get_by_id(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<Option<ConversationMeta>>> {
        Box::pin(async move { Ok(self.conversations.get(&id).map(|entry| entry.clone())) })
    }

    fn create(&self, meta: ConversationMeta) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            if self.conversations.contains_key(&meta.id) {
                return Err(TreeError::Persistence(format!(
                    "conversation {} already exists",
                    meta.id
                )));
            }
            self.conversations.insert(meta.id, meta);
            Ok(())
        })
    }

    fn update_title(&self, id: ConversationId, title: String) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            if let Some(mut meta) = self.conversations.get_mut(&id) {
                meta.title = title;
            }
            Ok(())
        })
    }

    fn touch_updated(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            if let Some(mut meta) = self.conversations.get_mut(&id) {
                meta.updated_at = meta.updated_at.max(at);
            }
            Ok(())
        })
    }

    fn delete(&self, id: ConversationId) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            self.conversations.remove(&id);
            Ok(())
        })
    }
}

impl NodeStore for MemoryStore {
    fn insert_node(&self, node: Node) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            if self.nodes.contains_key(&node.id) {
                return Err(TreeError::Persistence(format!("node {} already exists", node.id)));
            }
            self.nodes.insert(node.id, node);
            Ok(())
        })
    }

    fn update_response(&self, id: NodeId, response: String) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let mut node = self
                .nodes
                .get_mut(&id)
                .ok_or_else(|| TreeError::not_found("node", id))?;
            node.assistant_response = Some(response);
            Ok(())
        })
    }

    fn load_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<Vec<Node>>> {
        Box::pin(async move {
            let mut nodes: Vec<Node> = self
                .nodes
                .iter()
                .filter(|entry| entry.conversation_id == conversation_id)
                .map(|entry| entry.value().clone())
                .collect();
            nodes.sort_by_key(|node| node.created_at);
            Ok(nodes)
        })
    }

    fn delete_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            self.nodes
                .retain(|_, node| node.conversation_id != conversation_id);
            Ok(())
        })
    }
}

impl TangentStore for MemoryStore {
    fn insert_tangent(&self, record: TangentRecord) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            if self.tangents.contains_key(&record.id) {
                return Err(TreeError::Persistence(format!(
                    "tangent {} already exists",
                    record.id
                )));
            }
            self.tangents.insert(record.id, record);
            Ok(())
        })
    }

    fn append_turn(
        &self,
        tangent_id: TangentId,
        turn: TangentTurn,
    ) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let mut record = self
                .tangents
                .get_mut(&tangent_id)
                .ok_or_else(|| TreeError::not_found("tangent", tangent_id))?;
            record.conversation.push(turn);
            Ok(())
        })
    }

    fn load_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<Vec<TangentRecord>>> {
        Box::pin(async move {
            let mut records: Vec<TangentRecord> = self
                .tangents
                .iter()
                .filter(|entry| entry.conversation_id == conversation_id)
                .map(|entry| {
                    let mut record = entry.value().clone();
                    record.sub_tangents.clear();
                    record
                })
                .collect();
            records.sort_by_key(|record| record.created_at);
            Ok(records)
        })
    }

    fn delete_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            self.tangents
                .retain(|_, record| record.conversation_id != conversation_id);
            Ok(())
        })
    }
}
