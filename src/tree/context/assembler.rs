//! Path-scoped prompt context assembly.
//!
//! A node's context is its root-first path, never the whole tree, so prompt size
//! grows with depth rather than with the number of branches. A tangent's context is
//! the anchor message followed by each tangent on its lineage.

use tracing::debug;

use crate::llm::ChatMessage;
use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::core::ids::{NodeId, TangentId};
use crate::tree::core::tangent::TangentRole;
use crate::tree::navigator::{PathHints, lineage, path_hints, path_to_root};
use crate::tree::storage::{NodeArena, TangentForest};

/// Advisory metadata computed next to the assembled messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextHints {
    /// Target is a node on a branch.
    Branch(PathHints),
    /// Target is a tangent.
    Tangent {
        /// Number of tangents on the lineage, 1 for a top-level tangent.
        nesting: usize,
        /// Highlighted span of the target tangent.
        highlighted_text: String,
    },
}

/// Ordered messages for one target plus hints for the prompt builder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledContext {
    /// Conversation messages, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Position hints.
    pub hints: ContextHints,
}

impl AssembledContext {
    /// Most recent user text, used as the document query.
    #[must_use]
    pub fn latest_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == crate::llm::ChatRole::User)
            .map(|message| message.content.as_str())
    }
}

/// Assemble the context for a node.
///
/// Emits a user turn per node on the path and an assistant turn for every node that
/// already has a response.
///
/// # Errors
/// Returns `NotFound` if `node_id` is not in `arena`.
pub fn assemble_for_node(arena: &NodeArena, node_id: &NodeId) -> TreeResult<AssembledContext> {
    let path = path_to_root(arena, node_id);
    if path.is_empty() {
        return Err(TreeError::not_found("node", node_id));
    }

    let mut messages = Vec::with_capacity(path.len() * 2);
    for node in &path {
        messages.push(ChatMessage::user(node.user_message.clone()));
        if let Some(response) = &node.assistant_response {
            messages.push(ChatMessage::assistant(response.clone()));
        }
    }

    debug!(
        "Assembled {} messages from {} nodes for node {node_id} ({} nodes in tree)",
        messages.len(),
        path.len(),
        arena.len()
    );

    Ok(AssembledContext {
        messages,
        hints: ContextHints::Branch(path_hints(&path)),
    })
}

/// Assemble the context for a tangent.
///
/// Emits the anchor message, then for every tangent from the top-level one down to
/// `tangent_id` a marker naming its highlighted text followed by its turns. Sibling
/// tangents at every level are left out.
///
/// # Errors
/// Returns `NotFound` if the tangent is not in `forest` or the anchor message is not
/// in `arena`.
pub fn assemble_for_tangent(
    arena: &NodeArena,
    forest: &TangentForest,
    tangent_id: &TangentId,
) -> TreeResult<AssembledContext> {
    let chain = lineage(forest, tangent_id);
    let Some(target) = chain.last() else {
        return Err(TreeError::not_found("tangent", tangent_id));
    };
    let anchor_id = forest.message_id();
    let anchor = arena
        .get(&anchor_id)
        .ok_or_else(|| TreeError::not_found("node", anchor_id))?;

    let turns: usize = chain.iter().map(|record| record.conversation.len()).sum();
    let mut messages = Vec::with_capacity(2 + chain.len() + turns);
    messages.push(ChatMessage::user(anchor.user_message.clone()));
    if let Some(response) = &anchor.assistant_response {
        messages.push(ChatMessage::assistant(response.clone()));
    }

    for record in &chain {
        messages.push(ChatMessage::system(format!(
            "Tangent on highlighted text: \"{}\"",
            record.highlighted_text
        )));
        for turn in &record.conversation {
            messages.push(match turn.role {
                TangentRole::User => ChatMessage::user(turn.content.clone()),
                TangentRole::Assistant => ChatMessage::assistant(turn.content.clone()),
            });
        }
    }

    debug!(
        "Assembled {} messages for tangent {tangent_id} at nesting {}",
        messages.len(),
        chain.len()
    );

    Ok(AssembledContext {
        messages,
        hints: ContextHints::Tangent {
            nesting: chain.len(),
            highlighted_text: target.highlighted_text.clone(),
        },
    })
}
