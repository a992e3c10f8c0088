//! Core tree types and identifiers.

pub mod clock;
pub mod config;
pub mod errors;
pub mod ids;
pub mod node;
pub mod tangent;

pub use clock::MonotonicClock;
pub use config::{
    BranchConfig, PromptConfig, ProviderConfig, ServerConfig, SessionConfig, StorageConfig,
    TreeConfig,
};
pub use errors::{ErrorKind, TreeError, TreeResult};
pub use ids::{ConversationId, MessageId, NodeId, TangentId, TurnId};
pub use node::{BranchInfo, Node, truncate_with_ellipsis};
pub use tangent::{Tangent, TangentRecord, TangentRole, TangentTurn};
