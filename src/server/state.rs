//! Application state shared across all request handlers.

use std::sync::Arc;

use crate::tree::core::config::TreeConfig;
use crate::tree::core::errors::TreeResult;
use crate::tree::engine::TreeEngine;

/// Shared application state.
pub struct AppState {
    /// Conversation tree engine.
    pub engine: Arc<TreeEngine>,
}

impl AppState {
    /// Wrap an existing engine.
    #[must_use]
    pub fn new(engine: TreeEngine) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::new(engine),
        })
    }

    /// Build the engine over `SQLite` backends.
    ///
    /// # Errors
    /// Returns an error if the database or provider client cannot be created.
    pub async fn from_config(config: TreeConfig) -> TreeResult<Arc<Self>> {
        let engine = TreeEngine::from_config(config).await?;
        Ok(Self::new(engine))
    }
}
