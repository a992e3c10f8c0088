//! Node and tangent storage.
//!
//! - `node_arena` / `tangent_forest`: in-memory, id-keyed views owned by one conversation.
//! - `conversation_store` / `node_store` / `tangent_store`: persistence traits plus
//!   their `SQLite` implementations.
//! - `memory_store`: `DashMap`-backed implementation of all three traits.

pub mod conversation_store;
pub mod memory_store;
pub mod node_arena;
pub mod node_store;
pub mod sqlite;
pub mod tangent_forest;
pub mod tangent_store;

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::tree::core::errors::{TreeError, TreeResult};

pub use conversation_store::{ConversationMeta, ConversationStore, SqliteConversationStore};
pub use memory_store::MemoryStore;
pub use node_arena::NodeArena;
pub use node_store::{NodeStore, SqliteNodeStore};
pub use sqlite::SqliteBackends;
pub use tangent_forest::TangentForest;
pub use tangent_store::{SqliteTangentStore, TangentStore};

/// Boxed future type for store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Parse a stored identifier column.
pub(crate) fn parse_column<T>(raw: &str, column: &str) -> TreeResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|err| TreeError::Persistence(format!("invalid {column} {raw:?}: {err}")))
}

/// Convert a stored millisecond timestamp.
pub(crate) fn from_millis(ms: i64) -> TreeResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TreeError::Persistence(format!("invalid timestamp {ms}")))
}
