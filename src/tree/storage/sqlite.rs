//! `SQLite` backends sharing one connection.

use std::sync::Arc;

use tokio_rusqlite::Connection;
use tracing::info;

use crate::tree::core::config::StorageConfig;
use crate::tree::core::errors::TreeResult;
use crate::tree::storage::conversation_store::SqliteConversationStore;
use crate::tree::storage::node_store::SqliteNodeStore;
use crate::tree::storage::tangent_store::SqliteTangentStore;

/// The three `SQLite` stores, opened over one shared connection.
pub struct SqliteBackends {
    /// Conversation metadata.
    pub conversations: Arc<SqliteConversationStore>,
    /// Nodes.
    pub nodes: Arc<SqliteNodeStore>,
    /// Tangents and tangent turns.
    pub tangents: Arc<SqliteTangentStore>,
}

impl SqliteBackends {
    /// Open the database file named in the config.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(config: &StorageConfig) -> TreeResult<Self> {
        let conn = Connection::open(&config.sqlite_path).await?;
        info!("Opened tree database at {}", config.sqlite_path.display());
        Self::with_connection(conn, config).await
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the tables cannot be created.
    pub async fn in_memory(config: &StorageConfig) -> TreeResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn, config).await
    }

    async fn with_connection(conn: Connection, config: &StorageConfig) -> TreeResult<Self> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            Ok(())
        })
        .await?;

        let conversations = Arc::new(
            SqliteConversationStore::new(conn.clone(), &config.conversations_table).await?,
        );
        let nodes = Arc::new(SqliteNodeStore::new(conn.clone(), &config.nodes_table).await?);
        let tangents = Arc::new(
            SqliteTangentStore::new(conn, &config.tangents_table, &config.tangent_turns_table)
                .await?,
        );

        Ok(Self {
            conversations,
            nodes,
            tangents,
        })
    }
}
