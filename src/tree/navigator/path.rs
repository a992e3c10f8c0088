//! Root-to-node path reconstruction.

use serde::{Deserialize, Serialize};

use crate::tree::core::ids::NodeId;
use crate::tree::core::node::Node;
use crate::tree::storage::node_arena::NodeArena;

/// Walk `parent_id` links from `node_id` up to its root.
///
/// Returns the path root first, target last. An id absent from the arena yields an
/// empty path rather than an error. Runs in O(depth); a broken parent link ends the
/// walk at the last node that could be resolved.
#[must_use]
pub fn path_to_root<'a>(arena: &'a NodeArena, node_id: &NodeId) -> Vec<&'a Node> {
    let mut path = Vec::new();
    let mut current = arena.get(node_id);

    while let Some(node) = current {
        path.push(node);
        // Parent links always point at earlier nodes, so a walk longer than the arena is a cycle.
        if path.len() > arena.len() {
            path.clear();
            break;
        }
        current = node.parent_id.as_ref().and_then(|parent| arena.get(parent));
    }

    path.reverse();
    path
}

/// Whether `ancestor` lies on the path from `descendant` to its root.
///
/// A node is not its own ancestor.
#[must_use]
pub fn is_ancestor(arena: &NodeArena, ancestor: &NodeId, descendant: &NodeId) -> bool {
    if ancestor == descendant {
        return false;
    }
    path_to_root(arena, descendant)
        .iter()
        .any(|node| node.id == *ancestor)
}

/// Advisory position of a node, forwarded to the prompt builder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHints {
    /// Depth of the target node.
    pub depth: u32,
    /// Number of nodes on the path.
    pub turns: usize,
    /// Nearest branch label on the path, target first.
    pub branch_name: Option<String>,
}

/// Compute hints for a root-first path.
#[must_use]
pub fn path_hints(path: &[&Node]) -> PathHints {
    PathHints {
        depth: path.last().map_or(0, |node| node.depth),
        turns: path.len(),
        branch_name: path
            .iter()
            .rev()
            .find_map(|node| node.branch_name.clone()),
    }
}
