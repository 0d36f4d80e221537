//! Key-value store and heartbeat-check state (spec 3 auxiliary tables,
//! spec 4.1 KvGet/KvSet/KvList/KvDelete).
//!
//! The kv store backs, among other things, the prompt assembler's
//! per-user skill-fingerprint changelog (spec 4.3).

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{Store, StoreError};

impl Store {
    /// Fetch a value by (user, namespace, key).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn kv_get(
        &self,
        user_id: i64,
        namespace: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM kv_store WHERE user_id = ? AND namespace = ? AND key = ?",
        )
        .bind(user_id)
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    /// Insert or replace a value at (user, namespace, key).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the statement fails.
    pub async fn kv_set(
        &self,
        user_id: i64,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO kv_store (user_id, namespace, key, value)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, namespace, key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(user_id)
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List all (key, value) pairs in a user's namespace.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn kv_list(
        &self,
        user_id: i64,
        namespace: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM kv_store WHERE user_id = ? AND namespace = ? ORDER BY key")
            .bind(user_id)
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect()
    }

    /// Delete a value at (user, namespace, key).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the statement fails.
    pub async fn kv_delete(&self, user_id: i64, namespace: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_store WHERE user_id = ? AND namespace = ? AND key = ?")
            .bind(user_id)
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Current state of a named heartbeat check, if it has ever run.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn get_heartbeat_check(
        &self,
        name: &str,
    ) -> Result<Option<HeartbeatCheckState>, StoreError> {
        let row = sqlx::query("SELECT * FROM heartbeat_checks WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(HeartbeatCheckState {
                name: row.try_get("name")?,
                user_id: row.try_get("user_id")?,
                last_check_at: row.try_get("last_check_at")?,
                last_alert_at: row.try_get("last_alert_at")?,
                consecutive_errors: row.try_get("consecutive_errors")?,
            })),
        }
    }

    /// Record the result of running a named heartbeat check.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the statement fails.
    pub async fn record_heartbeat_check(
        &self,
        name: &str,
        user_id: i64,
        checked_at: DateTime<Utc>,
        alerted: bool,
        healthy: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO heartbeat_checks (name, user_id, last_check_at, last_alert_at, consecutive_errors)
            VALUES (?1, ?2, ?3, CASE WHEN ?4 THEN ?3 ELSE NULL END, CASE WHEN ?5 THEN 0 ELSE 1 END)
            ON CONFLICT(name) DO UPDATE SET
                last_check_at = ?3,
                last_alert_at = CASE WHEN ?4 THEN ?3 ELSE heartbeat_checks.last_alert_at END,
                consecutive_errors = CASE WHEN ?5 THEN 0 ELSE heartbeat_checks.consecutive_errors + 1 END
            ",
        )
        .bind(name)
        .bind(user_id)
        .bind(checked_at)
        .bind(alerted)
        .bind(healthy)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Persisted state of one named heartbeat check (spec 3 auxiliary tables).
#[derive(Debug, Clone)]
pub struct HeartbeatCheckState {
    /// Check name.
    pub name: String,
    /// Owning user.
    pub user_id: i64,
    /// Last time the check ran.
    pub last_check_at: Option<DateTime<Utc>>,
    /// Last time an alert was sent for this check.
    pub last_alert_at: Option<DateTime<Utc>>,
    /// Consecutive unhealthy results since the last healthy one.
    pub consecutive_errors: i64,
}
