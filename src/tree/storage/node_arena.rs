//! Id-keyed node arena for one conversation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::tree::core::ids::NodeId;
use crate::tree::core::node::Node;

/// Nodes of one conversation keyed by id.
///
/// The tree is encoded only through `Node::parent_id`; there are no child arrays.
#[derive(Clone, Debug, Default)]
pub struct NodeArena {
    nodes: HashMap<NodeId, Node>,
}

impl NodeArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an arena from loaded nodes.
    #[must_use]
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|node| (node.id, node)).collect(),
        }
    }

    /// Insert or replace a node.
    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    /// Look up a node.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Look up a node mutably.
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Whether the node exists.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over all nodes in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Latest creation timestamp, used to seed the conversation clock.
    #[must_use]
    pub fn latest_created_at(&self) -> Option<DateTime<Utc>> {
        self.nodes.values().map(|node| node.created_at).max()
    }
}
