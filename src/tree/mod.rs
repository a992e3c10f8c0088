//! Branching conversation tree engine.
//!
//! - `core`: configuration, errors, identifiers, node and tangent types
//! - `storage`: node arena, tangent forests, persistence traits with `SQLite` and
//!   in-memory backends
//! - `navigator`: path, sibling and lineage traversals
//! - `controller`: branch and tangent mutation
//! - `context`: prompt context assembly and document grounding
//! - `stream`: SSE decoding and the streaming session
//! - `engine`: per-conversation orchestration of the UI event surface

pub mod context;
pub mod controller;
pub mod core;
pub mod engine;
pub mod navigator;
pub mod storage;
pub mod stream;

pub use context::{
    AssembledContext, ContextHints, DocumentContextProvider, DocumentSnippet, NoDocuments,
    PromptBuilder, StaticDocuments, assemble_for_node, assemble_for_tangent,
};
pub use controller::{ActiveNode, BranchController, TangentController};
pub use self::core::{
    BranchConfig, BranchInfo, ConversationId, ErrorKind, MessageId, Node, NodeId, PromptConfig,
    ProviderConfig, ServerConfig, SessionConfig, StorageConfig, Tangent, TangentId, TangentRecord,
    TangentRole, TangentTurn, TreeConfig, TreeError, TreeResult, TurnId,
};
pub use engine::{ConversationView, PathEntry, TreeBackends, TreeEngine};
pub use navigator::{PathHints, latest_leaf, lineage, path_to_root, siblings};
pub use storage::{
    ConversationMeta, ConversationStore, MemoryStore, NodeArena, NodeStore, SqliteBackends,
    TangentForest, TangentStore,
};
pub use stream::{SseDecoder, SseFrame, StreamOutcome, StreamSummary, StreamTarget, StreamingSession};
