//! Conversation history accessors (spec 3 ConversationState, spec 4.7).

use sqlx::Row;

use crate::types::{ActionTaken, ConversationEntry};

use super::{Store, StoreError};

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationEntry, StoreError> {
    let actions_raw: String = row.try_get("actions_taken")?;
    let actions_taken: Vec<ActionTaken> = serde_json::from_str(&actions_raw)?;
    Ok(ConversationEntry {
        task_id: row.try_get("task_id")?,
        user_id: row.try_get("user_id")?,
        prompt: row.try_get("prompt")?,
        result: row.try_get("result")?,
        timestamp: row.try_get("timestamp")?,
        actions_taken,
    })
}

impl Store {
    /// Record one completed turn of conversation history.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the statement fails.
    pub async fn append_conversation_entry(
        &self,
        entry: &ConversationEntry,
        conversation_token: &str,
    ) -> Result<(), StoreError> {
        let actions_taken = serde_json::to_string(&entry.actions_taken)?;
        sqlx::query(
            r"
            INSERT INTO conversation_entries
                (task_id, user_id, conversation_token, prompt, result, timestamp, actions_taken)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                result = excluded.result,
                actions_taken = excluded.actions_taken
            ",
        )
        .bind(entry.task_id)
        .bind(entry.user_id)
        .bind(conversation_token)
        .bind(&entry.prompt)
        .bind(&entry.result)
        .bind(entry.timestamp)
        .bind(actions_taken)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retrieve the most recent `limit` conversation entries for a token,
    /// ordered oldest-first (spec 4.7 lookback).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn recent_conversation(
        &self,
        conversation_token: &str,
        limit: i64,
    ) -> Result<Vec<ConversationEntry>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM (
                SELECT * FROM conversation_entries
                WHERE conversation_token = ?
                ORDER BY timestamp DESC
                LIMIT ?
            ) ORDER BY timestamp ASC
            ",
        )
        .bind(conversation_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }
}
