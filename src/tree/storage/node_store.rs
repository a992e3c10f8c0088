//! Persistence for conversation nodes.

use tokio_rusqlite::Connection;

use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::core::ids::{ConversationId, NodeId};
use crate::tree::core::node::Node;
use crate::tree::storage::{StoreFuture, from_millis, parse_column};

/// Node persistence trait.
///
/// The engine only needs insert, update-by-id and an ordered select per conversation.
pub trait NodeStore: Send + Sync {
    /// Insert a new node.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn insert_node(&self, node: Node) -> StoreFuture<'_, TreeResult<()>>;

    /// Overwrite the assistant response of a node.
    ///
    /// # Errors
    /// Returns `NotFound` if no row has this id, or a storage error.
    fn update_response(&self, id: NodeId, response: String) -> StoreFuture<'_, TreeResult<()>>;

    /// Load every node of a conversation ordered by `created_at`.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn load_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<Vec<Node>>>;

    /// Delete every node of a conversation.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<()>>;
}

/// `SQLite` implementation of node storage.
pub struct SqliteNodeStore {
    conn: Connection,
    table: String,
}

type NodeRow = (
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    i64,
    i64,
);

impl SqliteNodeStore {
    /// Initialize the node store.
    ///
    /// # Errors
    /// Returns an error if the table cannot be created.
    pub async fn new(conn: Connection, table: &str) -> TreeResult<Self> {
        let table = table.to_string();
        let table_name = table.clone();

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    parent_id TEXT,
                    user_message TEXT NOT NULL,
                    assistant_response TEXT,
                    branch_name TEXT,
                    depth INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table_name}_conversation_ts
                    ON {table_name} (conversation_id, created_at);"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, table })
    }
}

fn node_from_row(conversation_id: ConversationId, row: NodeRow) -> TreeResult<Node> {
    let (id, parent_id, user_message, assistant_response, branch_name, depth, created_at) = row;
    Ok(Node {
        id: parse_column(&id, "node id")?,
        conversation_id,
        parent_id: parent_id
            .as_deref()
            .map(|raw| parse_column(raw, "parent id"))
            .transpose()?,
        user_message,
        assistant_response,
        branch_name,
        depth: u32::try_from(depth)
            .map_err(|_| TreeError::Persistence(format!("invalid depth {depth}")))?,
        created_at: from_millis(created_at)?,
    })
}

impl NodeStore for SqliteNodeStore {
    fn insert_node(&self, node: Node) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!(
                            "INSERT INTO {table}
                            (id, conversation_id, parent_id, user_message, assistant_response,
                             branch_name, depth, created_at)
                            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                        ),
                        rusqlite::params![
                            node.id.to_string(),
                            node.conversation_id.to_string(),
                            node.parent_id.map(|id| id.to_string()),
                            node.user_message,
                            node.assistant_response,
                            node.branch_name,
                            i64::from(node.depth),
                            node.created_at.timestamp_millis()
                        ],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn update_response(&self, id: NodeId, response: String) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            let id_str = id.to_string();
            let changed = self
                .conn
                .call(move |conn| {
                    let changed = conn.execute(
                        &format!("UPDATE {table} SET assistant_response = ?1 WHERE id = ?2"),
                        rusqlite::params![response, id_str],
                    )?;
                    Ok(changed)
                })
                .await?;
            if changed == 0 {
                return Err(TreeError::not_found("node", id));
            }
            Ok(())
        })
    }

    fn load_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<Vec<Node>>> {
        Box::pin(async move {
            let table = self.table.clone();
            let conversation = conversation_id.to_string();
            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT id, parent_id, user_message, assistant_response, branch_name,
                                depth, created_at
                         FROM {table}
                         WHERE conversation_id = ?1
                         ORDER BY created_at"
                    ))?;
                    let rows = stmt
                        .query_map(rusqlite::params![conversation], |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                                row.get(5)?,
                                row.get(6)?,
                            ))
                        })?
                        .collect::<Result<Vec<NodeRow>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;

            rows.into_iter()
                .map(|row| node_from_row(conversation_id, row))
                .collect()
        })
    }

    fn delete_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            let conversation = conversation_id.to_string();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!("DELETE FROM {table} WHERE conversation_id = ?1"),
                        rusqlite::params![conversation],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }
}
