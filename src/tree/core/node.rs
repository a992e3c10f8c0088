//! Node model for the primary conversation tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tree::core::ids::{ConversationId, NodeId};

/// One turn in the primary conversation tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier.
    pub id: NodeId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Parent node; `None` only for root-level nodes.
    pub parent_id: Option<NodeId>,
    /// Text the user sent to reach this node.
    pub user_message: String,
    /// Assistant reply; `None` while a reply is in flight.
    pub assistant_response: Option<String>,
    /// Optional label distinguishing this node from its siblings.
    pub branch_name: Option<String>,
    /// Distance from the root (`parent.depth + 1`, 0 for roots).
    pub depth: u32,
    /// Creation timestamp, orders siblings.
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Whether the node has a non-empty assistant reply.
    #[must_use]
    pub fn has_response(&self) -> bool {
        self.assistant_response
            .as_deref()
            .is_some_and(|text| !text.is_empty())
    }

    /// Short label used in breadcrumbs and branch pickers.
    #[must_use]
    pub fn label(&self, max_chars: usize) -> String {
        self.branch_name
            .clone()
            .unwrap_or_else(|| truncate_with_ellipsis(&self.user_message, max_chars))
    }
}

/// Display summary of one node among its siblings.
///
/// Derived from the node set, never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Node id.
    pub id: NodeId,
    /// Optional branch label.
    pub branch_name: Option<String>,
    /// Fixed-length prefix of the user message.
    pub preview: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl BranchInfo {
    /// Build the summary for a node with a preview of at most `preview_chars` characters.
    #[must_use]
    pub fn from_node(node: &Node, preview_chars: usize) -> Self {
        Self {
            id: node.id,
            branch_name: node.branch_name.clone(),
            preview: truncate_with_ellipsis(&node.user_message, preview_chars),
            created_at: node.created_at,
        }
    }
}

/// Keep the first `max_chars` characters, appending `...` when something was cut.
#[must_use]
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
