//! Sibling enumeration and leaf selection.

use std::collections::HashSet;

use crate::tree::core::ids::NodeId;
use crate::tree::core::node::{BranchInfo, Node};
use crate::tree::storage::node_arena::NodeArena;

/// Every node sharing `node_id`'s parent and conversation, the node itself included,
/// oldest first.
///
/// Returns an empty list for an unknown id. Callers hide branch pickers when the
/// result has one entry or fewer.
#[must_use]
pub fn siblings(arena: &NodeArena, node_id: &NodeId, preview_chars: usize) -> Vec<BranchInfo> {
    let Some(node) = arena.get(node_id) else {
        return Vec::new();
    };

    let mut found: Vec<&Node> = arena
        .iter()
        .filter(|other| {
            other.parent_id == node.parent_id && other.conversation_id == node.conversation_id
        })
        .collect();
    found.sort_by_key(|other| (other.created_at, other.id));
    found
        .into_iter()
        .map(|other| BranchInfo::from_node(other, preview_chars))
        .collect()
}

/// Children of `parent` (roots when `None`), oldest first.
#[must_use]
pub fn children<'a>(arena: &'a NodeArena, parent: Option<&NodeId>) -> Vec<&'a Node> {
    let mut found: Vec<&Node> = arena
        .iter()
        .filter(|node| node.parent_id.as_ref() == parent)
        .collect();
    found.sort_by_key(|node| (node.created_at, node.id));
    found
}

/// The most recently created node that has no children.
///
/// Picks the initially active node when a conversation loads; `None` for an empty
/// conversation.
#[must_use]
pub fn latest_leaf(arena: &NodeArena) -> Option<&Node> {
    let parents: HashSet<&NodeId> = arena
        .iter()
        .filter_map(|node| node.parent_id.as_ref())
        .collect();

    arena
        .iter()
        .filter(|node| !parents.contains(&node.id))
        .max_by_key(|node| (node.created_at, node.id))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::tree::core::ids::ConversationId;

    struct Builder {
        arena: NodeArena,
        conversation: ConversationId,
        start: DateTime<Utc>,
        tick: i64,
    }

    impl Builder {
        fn new() -> Self {
            Self {
                arena: NodeArena::new(),
                conversation: ConversationId::new(),
                start: Utc::now(),
                tick: 0,
            }
        }

        fn add(&mut self, parent: Option<NodeId>, text: &str) -> NodeId {
            self.tick += 1;
            let depth = parent
                .and_then(|p| self.arena.get(&p))
                .map_or(0, |p| p.depth + 1);
            let node = Node {
                id: NodeId::new(),
                conversation_id: self.conversation,
                parent_id: parent,
                user_message: text.to_string(),
                assistant_response: None,
                branch_name: None,
                depth,
                created_at: self.start + Duration::milliseconds(self.tick),
            };
            let id = node.id;
            self.arena.insert(node);
            id
        }
    }

    #[test]
    fn siblings_include_self_sorted_by_creation() {
        let mut b = Builder::new();
        let root = b.add(None, "root");
        let first = b.add(Some(root), "first");
        let second = b.add(Some(root), "second");
        let _grandchild = b.add(Some(first), "deeper");

        let list = siblings(&b.arena, &second, 50);
        let ids: Vec<NodeId> = list.iter().map(|info| info.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(list.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn only_child_has_single_sibling_entry() {
        let mut b = Builder::new();
        let root = b.add(None, "root");
        let child = b.add(Some(root), "child");
        assert_eq!(siblings(&b.arena, &child, 50).len(), 1);
        assert!(siblings(&b.arena, &NodeId::new(), 50).is_empty());
    }

    #[test]
    fn preview_is_truncated() {
        let mut b = Builder::new();
        let long = "x".repeat(80);
        let id = b.add(None, &long);
        let list = siblings(&b.arena, &id, 50);
        assert_eq!(list[0].preview.len(), 53);
        assert!(list[0].preview.ends_with("..."));
    }

    #[test]
    fn latest_leaf_ignores_inner_nodes() {
        let mut b = Builder::new();
        assert!(latest_leaf(&b.arena).is_none());

        let root = b.add(None, "root");
        let early_leaf = b.add(Some(root), "a");
        let inner = b.add(Some(root), "b");
        let late_leaf = b.add(Some(inner), "c");

        assert_eq!(latest_leaf(&b.arena).map(|n| n.id), Some(late_leaf));
        assert_ne!(latest_leaf(&b.arena).map(|n| n.id), Some(early_leaf));
        assert_eq!(children(&b.arena, Some(&root)).len(), 2);
        assert_eq!(children(&b.arena, None).len(), 1);
    }
}
