//! Persistence for tangents and their turns.

use std::collections::HashMap;
use std::str::FromStr;

use tokio_rusqlite::Connection;

use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::core::ids::{ConversationId, MessageId, TangentId};
use crate::tree::core::tangent::{TangentRecord, TangentRole, TangentTurn};
use crate::tree::storage::{StoreFuture, from_millis, parse_column};

/// Tangent persistence trait.
pub trait TangentStore: Send + Sync {
    /// Insert a tangent together with its opening turns.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn insert_tangent(&self, record: TangentRecord) -> StoreFuture<'_, TreeResult<()>>;

    /// Append a turn to a tangent's conversation.
    ///
    /// # Errors
    /// Returns `NotFound` if the tangent does not exist, or an error if storage
    /// access fails.
    fn append_turn(&self, tangent_id: TangentId, turn: TangentTurn)
    -> StoreFuture<'_, TreeResult<()>>;

    /// Load every tangent of a conversation ordered by `created_at`, turns included.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn load_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<Vec<TangentRecord>>>;

    /// Delete every tangent (and turn) of a conversation.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<()>>;
}

/// `SQLite` implementation of tangent storage.
pub struct SqliteTangentStore {
    conn: Connection,
    tangents: String,
    turns: String,
}

type TangentRow = (String, String, Option<String>, String, i64);
type TurnRow = (String, String, String, String, i64);

impl SqliteTangentStore {
    /// Initialize the tangent store.
    ///
    /// # Errors
    /// Returns an error if the tables cannot be created.
    pub async fn new(conn: Connection, tangents_table: &str, turns_table: &str) -> TreeResult<Self> {
        let tangents = tangents_table.to_string();
        let turns = turns_table.to_string();
        let (t, u) = (tangents.clone(), turns.clone());

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    parent_tangent_id TEXT,
                    highlighted_text TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{t}_conversation_ts
                    ON {t} (conversation_id, created_at);
                CREATE TABLE IF NOT EXISTS {u} (
                    id TEXT PRIMARY KEY,
                    tangent_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{u}_tangent_ts
                    ON {u} (tangent_id, created_at);"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            tangents,
            turns,
        })
    }
}

fn turn_from_row((id, _tangent_id, role, content, created_at): TurnRow) -> TreeResult<TangentTurn> {
    Ok(TangentTurn {
        id: parse_column(&id, "turn id")?,
        role: TangentRole::from_str(&role)
            .map_err(|err| TreeError::Persistence(format!("invalid role: {err}")))?,
        content,
        created_at: from_millis(created_at)?,
    })
}

impl TangentStore for SqliteTangentStore {
    fn insert_tangent(&self, record: TangentRecord) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let tangents = self.tangents.clone();
            let turns = self.turns.clone();
            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    tx.execute(
                        &format!(
                            "INSERT INTO {tangents}
                            (id, conversation_id, message_id, parent_tangent_id,
                             highlighted_text, created_at)
                            VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                        ),
                        rusqlite::params![
                            record.id.to_string(),
                            record.conversation_id.to_string(),
                            record.message_id.to_string(),
                            record.parent_id.map(|id| id.to_string()),
                            record.highlighted_text,
                            record.created_at.timestamp_millis()
                        ],
                    )?;
                    {
                        let mut stmt = tx.prepare(&format!(
                            "INSERT INTO {turns} (id, tangent_id, role, content, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)"
                        ))?;
                        for turn in &record.conversation {
                            stmt.execute(rusqlite::params![
                                turn.id.to_string(),
                                record.id.to_string(),
                                turn.role.as_str(),
                                turn.content,
                                turn.created_at.timestamp_millis()
                            ])?;
                        }
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn append_turn(
        &self,
        tangent_id: TangentId,
        turn: TangentTurn,
    ) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let tangents = self.tangents.clone();
            let turns = self.turns.clone();
            let changed = self
                .conn
                .call(move |conn| {
                    let changed = conn.execute(
                        &format!(
                            "INSERT INTO {turns} (id, tangent_id, role, content, created_at)
                             SELECT ?1, ?2, ?3, ?4, ?5
                             WHERE EXISTS (SELECT 1 FROM {tangents} WHERE id = ?2)"
                        ),
                        rusqlite::params![
                            turn.id.to_string(),
                            tangent_id.to_string(),
                            turn.role.as_str(),
                            turn.content,
                            turn.created_at.timestamp_millis()
                        ],
                    )?;
                    Ok(changed)
                })
                .await?;
            if changed == 0 {
                return Err(TreeError::not_found("tangent", tangent_id));
            }
            Ok(())
        })
    }

    fn load_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<Vec<TangentRecord>>> {
        Box::pin(async move {
            let tangents = self.tangents.clone();
            let turns = self.turns.clone();
            let conversation = conversation_id.to_string();
            let (tangent_rows, turn_rows) = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT id, message_id, parent_tangent_id, highlighted_text, created_at
                         FROM {tangents}
                         WHERE conversation_id = ?1
                         ORDER BY created_at"
                    ))?;
                    let tangent_rows = stmt
                        .query_map(rusqlite::params![conversation], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                        })?
                        .collect::<Result<Vec<TangentRow>, rusqlite::Error>>()?;

                    let mut stmt = conn.prepare(&format!(
                        "SELECT u.id, u.tangent_id, u.role, u.content, u.created_at
                         FROM {turns} u
                         JOIN {tangents} t ON t.id = u.tangent_id
                         WHERE t.conversation_id = ?1
                         ORDER BY u.created_at"
                    ))?;
                    let turn_rows = stmt
                        .query_map(rusqlite::params![conversation], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                        })?
                        .collect::<Result<Vec<TurnRow>, rusqlite::Error>>()?;
                    Ok((tangent_rows, turn_rows))
                })
                .await?;

            let mut turns_by_tangent: HashMap<String, Vec<TangentTurn>> = HashMap::new();
            for row in turn_rows {
                let tangent_id = row.1.clone();
                turns_by_tangent
                    .entry(tangent_id)
                    .or_default()
                    .push(turn_from_row(row)?);
            }

            let mut records = Vec::with_capacity(tangent_rows.len());
            for (id, message_id, parent_id, highlighted_text, created_at) in tangent_rows {
                let conversation = turns_by_tangent.remove(&id).unwrap_or_default();
                records.push(TangentRecord {
                    id: parse_column(&id, "tangent id")?,
                    conversation_id,
                    message_id: parse_column::<MessageId>(&message_id, "message id")?,
                    parent_id: parent_id
                        .as_deref()
                        .map(|raw| parse_column(raw, "parent tangent id"))
                        .transpose()?,
                    highlighted_text,
                    conversation,
                    sub_tangents: Vec::new(),
                    created_at: from_millis(created_at)?,
                });
            }
            Ok(records)
        })
    }

    fn delete_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, TreeResult<()>> {
        Box::pin(async move {
            let tangents = self.tangents.clone();
            let turns = self.turns.clone();
            let conversation = conversation_id.to_string();
            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    tx.execute(
                        &format!(
                            "DELETE FROM {turns} WHERE tangent_id IN
                             (SELECT id FROM {tangents} WHERE conversation_id = ?1)"
                        ),
                        rusqlite::params![conversation],
                    )?;
                    tx.execute(
                        &format!("DELETE FROM {tangents} WHERE conversation_id = ?1"),
                        rusqlite::params![conversation],
                    )?;
                    tx.commit()?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    async fn store() -> SqliteTangentStore {
        let Ok(conn) = Connection::open_in_memory().await else {
            panic!("in-memory sqlite unavailable");
        };
        match SqliteTangentStore::new(conn, "tangents", "tangent_turns").await {
            Ok(store) => store,
            Err(err) => panic!("tangent store init failed: {err}"),
        }
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap_or_default()
    }

    fn record(
        conversation_id: ConversationId,
        message_id: MessageId,
        parent_id: Option<TangentId>,
        ms: i64,
    ) -> TangentRecord {
        TangentRecord {
            id: TangentId::new(),
            conversation_id,
            message_id,
            parent_id,
            highlighted_text: "span".to_string(),
            conversation: vec![TangentTurn::new(TangentRole::User, "opening", at(ms))],
            sub_tangents: Vec::new(),
            created_at: at(ms),
        }
    }

    #[tokio::test]
    async fn tangents_load_with_turns_and_parents() {
        let store = store().await;
        let conversation = ConversationId::new();
        let message = MessageId::new();
        let top = record(conversation, message, None, 10);
        let nested = record(conversation, message, Some(top.id), 20);

        assert!(store.insert_tangent(top.clone()).await.is_ok());
        assert!(store.insert_tangent(nested.clone()).await.is_ok());
        let reply = TangentTurn::new(TangentRole::Assistant, "answer", at(30));
        assert!(store.append_turn(top.id, reply.clone()).await.is_ok());

        let loaded = store
            .load_by_conversation(conversation)
            .await
            .unwrap_or_default();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, top.id);
        assert_eq!(loaded[0].conversation.len(), 2);
        assert_eq!(loaded[0].conversation[1], reply);
        assert_eq!(loaded[1].parent_id, Some(top.id));
        assert_eq!(loaded[1].conversation.len(), 1);
    }

    #[tokio::test]
    async fn append_to_unknown_tangent_is_not_found() {
        let store = store().await;
        let conversation = ConversationId::new();
        let top = record(conversation, MessageId::new(), None, 10);
        assert!(store.insert_tangent(top.clone()).await.is_ok());
        assert!(store.delete_by_conversation(conversation).await.is_ok());

        let late = TangentTurn::new(TangentRole::Assistant, "late answer", at(20));
        let result = store.append_turn(top.id, late).await;
        assert!(matches!(result, Err(TreeError::NotFound { .. })));

        let orphans = store
            .conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM tangent_turns", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .unwrap_or(-1);
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn delete_removes_turns_too() {
        let store = store().await;
        let conversation = ConversationId::new();
        let top = record(conversation, MessageId::new(), None, 10);
        assert!(store.insert_tangent(top).await.is_ok());

        assert!(store.delete_by_conversation(conversation).await.is_ok());
        assert!(
            store
                .load_by_conversation(conversation)
                .await
                .unwrap_or_default()
                .is_empty()
        );
    }
}
