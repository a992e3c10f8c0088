//! Tangent model: side threads anchored to a highlighted span of a reply.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tree::core::ids::{ConversationId, MessageId, TangentId, TurnId};

/// Author of a tangent turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TangentRole {
    /// User remark.
    User,
    /// Assistant reply.
    Assistant,
}

impl TangentRole {
    /// Stable string form for storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for TangentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TangentRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(value.to_string()),
        }
    }
}

/// One entry of a tangent's own conversation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TangentTurn {
    /// Turn identifier.
    pub id: TurnId,
    /// Author.
    pub role: TangentRole,
    /// Text.
    pub content: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl TangentTurn {
    /// Build a turn stamped with `created_at`.
    #[must_use]
    pub fn new(role: TangentRole, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: TurnId::new(),
            role,
            content: content.into(),
            created_at,
        }
    }
}

/// Flat storage form of a tangent.
///
/// Children are referenced by id, the parent by `parent_id`; the nested
/// [`Tangent`] view is rebuilt from these records on demand.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TangentRecord {
    /// Tangent identifier.
    pub id: TangentId,
    /// Conversation the anchor message belongs to.
    pub conversation_id: ConversationId,
    /// Anchor message (node) of the whole tangent tree.
    pub message_id: MessageId,
    /// Parent tangent for sub-tangents, `None` for top-level tangents.
    pub parent_id: Option<TangentId>,
    /// Highlighted span this tangent is about.
    pub highlighted_text: String,
    /// Ordered turns; never empty once created.
    pub conversation: Vec<TangentTurn>,
    /// Ordered child tangents.
    pub sub_tangents: Vec<TangentId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Nested view of a tangent and all its sub-tangents, for rendering.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Tangent {
    /// Tangent identifier.
    pub id: TangentId,
    /// Highlighted span this tangent is about.
    pub highlighted_text: String,
    /// Ordered turns.
    pub conversation: Vec<TangentTurn>,
    /// Nested tangents anchored inside this tangent's conversation.
    pub sub_tangents: Vec<Tangent>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Tangent {
    /// Count this tangent and every nested sub-tangent.
    #[must_use]
    pub fn thread_size(&self) -> usize {
        1 + self.sub_tangents.iter().map(Self::thread_size).sum::<usize>()
    }
}
