//! Conversation metadata store.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;

use crate::tree::core::errors::TreeResult;
use crate::tree::core::ids::ConversationId;
use crate::tree::storage::{StoreFuture, from_millis, parse_column};

/// Metadata of one conversation, as shown in a conversation list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMeta {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Display title.
    pub title: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Trait for conversation metadata storage.
pub trait ConversationStore: Send + Sync {
    /// List all conversations ordered by `updated_at` DESC.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn list_all(&self) -> StoreFuture<'_, TreeResult<Vec<ConversationMeta>>>;

    /// Get a conversation by ID.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get_by_id(&self, id: ConversationId)
    -> StoreFuture<'_, TreeResult<Option<ConversationMeta>>>;

    /// Insert a new conversation record.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn create(&self, meta: ConversationMeta) -> StoreFuture<'_, TreeResult<()>>;

    /// Update the title of a conversation.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn update_title(&self, id: ConversationId, title: String) -> StoreFuture<'_, TreeResult<()>>;

    /// Touch the `updated_at` timestamp.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn touch_updated(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, TreeResult<()>>;

    /// Delete the conversation record.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete(&self, id: ConversationId) -> StoreFuture<'_, TreeResult<()>>;
}

/// `SQLite` implementation of conversation metadata storage.
pub struct SqliteConversationStore {
    conn: Connection,
    table: String,
}

type ConversationRow = (String, String, i64, i64);

impl SqliteConversationStore {
    /// Initialize the store and create the table if it doesn't exist.
    ///
    /// # Errors
    /// Returns an error if database operations fail.
    pub async fn new(conn: Connection, table: &str) -> TreeResult<Self> {
        let table = table.to_string();
        let table_name = table.clone();

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL DEFAULT '',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table_name}_updated
                    ON {table_name} (updated_at DESC);"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, table })
    }
}

fn meta_from_row((id, title, created_at, updated_at): ConversationRow) -> TreeResult<ConversationMeta> {
    Ok(ConversationMeta {
        id: parse_column(&id, "conversation id")?,
        title,
        created_at: from_millis(created_at)?,
        updated_at: from_millis(updated_at)?,
    })
}

impl ConversationStore for SqliteConversationStore {
    fn list_all(&self) -> StoreFuture<'_, TreeResult<Vec<ConversationMeta>>> {
        Box::pin(async move {
            let table = self.table.clone();
            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT id, title, created_at, updated_at
                         FROM {table}
                         ORDER BY updated_at DESC"
                    ))?;
                    let rows = stmt
                        .query_map([], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                        })?
                        .collect::<Result<Vec<ConversationRow>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;
            rows.into_iter().map(meta_from_row).collect()
        })
    }

    fn get_by_id(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<Option<ConversationMeta>>> {
        Box::pin(async move {
            let table = self.table.clone();
            let id_str = id.to_string();
            let row = self
                .conn
                .call(move |conn| {
                    let row = conn
                        .query_row(
                            &format!(
                                "SELECT id, title, created_at, updated_at
                                 FROM {table}
                                 WHERE id = ?1"
                            ),
                            [&id_str],
                            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                        )
                        .optional()?;
                    Ok(row)
                })
                .await?;
            row.map(meta_from_row).transpose()
        })
    }

    fn create(&self, meta: ConversationMeta) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!(
                            "INSERT INTO {table} (id, title, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4)"
                        ),
                        rusqlite::params![
                            meta.id.to_string(),
                            meta.title,
                            meta.created_at.timestamp_millis(),
                            meta.updated_at.timestamp_millis()
                        ],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn update_title(&self, id: ConversationId, title: String) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            let id_str = id.to_string();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!("UPDATE {table} SET title = ?1 WHERE id = ?2"),
                        rusqlite::params![title, id_str],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn touch_updated(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            let id_str = id.to_string();
            let at_ms = at.timestamp_millis();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!("UPDATE {table} SET updated_at = MAX(updated_at, ?1) WHERE id = ?2"),
                        rusqlite::params![at_ms, id_str],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn delete(&self, id: ConversationId) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            let id_str = id.to_string();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!("DELETE FROM {table} WHERE id = ?1"),
                        rusqlite::params![id_str],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }
}
