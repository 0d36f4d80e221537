//! Task CRUD operations (spec 4.1): `CreateTask`, `GetTask`, `UpdateStatus`,
//! and the dispatch-support queries the worker pool relies on.

use chrono::Utc;
use sqlx::Row;

use crate::types::{ActionTaken, NewTask, OutputTarget, SourceType, Task, TaskStatus};

use super::{Store, StoreError};

pub(super) fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
    let source_type_raw: String = row.try_get("source_type")?;
    let source_type = SourceType::parse(&source_type_raw).ok_or_else(|| {
        StoreError::Database(sqlx::Error::ColumnDecode {
            index: "source_type".into(),
            source: format!("unknown source_type: {source_type_raw}").into(),
        })
    })?;

    let output_target_raw: String = row.try_get("output_target")?;
    let output_target = OutputTarget::parse(&output_target_raw).ok_or_else(|| {
        StoreError::Database(sqlx::Error::ColumnDecode {
            index: "output_target".into(),
            source: format!("unknown output_target: {output_target_raw}").into(),
        })
    })?;

    let status_raw: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
        StoreError::Database(sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: format!("unknown status: {status_raw}").into(),
        })
    })?;

    let attachments_raw: String = row.try_get("attachments")?;
    let attachments: Vec<String> = serde_json::from_str(&attachments_raw)?;

    let actions_taken_raw: String = row.try_get("actions_taken")?;
    let actions_taken: Vec<ActionTaken> = serde_json::from_str(&actions_taken_raw)?;

    Ok(Task {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        prompt: row.try_get("prompt")?,
        command: row.try_get("command")?,
        source_type,
        source_ref: row.try_get("source_ref")?,
        conversation_token: row.try_get("conversation_token")?,
        attachments,
        output_target,
        status,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
        worker_pid: row.try_get("worker_pid")?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        heartbeat_silent: row.try_get::<i64, _>("heartbeat_silent")? != 0,
        scheduled_job_id: row.try_get("scheduled_job_id")?,
        actions_taken,
        not_before: row.try_get("not_before")?,
        result: row.try_get("result")?,
    })
}

/// Fields accepted by [`Store::update_status`].
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    /// New lifecycle status.
    pub status: Option<TaskStatus>,
    /// Result text to store.
    pub result: Option<String>,
    /// Accumulated tool-use descriptions.
    pub actions_taken: Option<Vec<ActionTaken>>,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// Logical worker slot holding the task.
    pub worker_pid: Option<String>,
    /// Stamp `started_at` to now.
    pub started: bool,
    /// Stamp `completed_at` to now.
    pub completed: bool,
}

impl Store {
    /// Insert a new `pending` task (spec 4.1 CreateTask).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the insert fails.
    pub async fn create_task(&self, fields: NewTask) -> Result<i64, StoreError> {
        let now = Utc::now();
        let attachments = serde_json::to_string(&fields.attachments)?;
        let id = sqlx::query(
            r"
            INSERT INTO tasks (
                user_id, prompt, command, source_type, source_ref,
                conversation_token, attachments, output_target, status,
                priority, created_at, scheduled_job_id, heartbeat_silent
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)
            RETURNING id
            ",
        )
        .bind(fields.user_id)
        .bind(&fields.prompt)
        .bind(&fields.command)
        .bind(fields.source_type.as_str())
        .bind(&fields.source_ref)
        .bind(&fields.conversation_token)
        .bind(attachments)
        .bind(fields.output_target.as_str())
        .bind(fields.priority)
        .bind(now)
        .bind(fields.scheduled_job_id)
        .bind(fields.heartbeat_silent)
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("id")?;

        Ok(id)
    }

    /// Create a task only if `dedup_key` has not been seen in `tasks_file_seen`
    /// (spec 8: tasks-file content-hash idempotent ingestion).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Rejected`] if the hash was already seen, or any
    /// other [`StoreError`] on database failure.
    pub async fn create_task_from_tasks_file(
        &self,
        fields: NewTask,
        content_hash: &str,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let already_seen: Option<i64> =
            sqlx::query_scalar("SELECT task_id FROM tasks_file_seen WHERE content_hash = ?")
                .bind(content_hash)
                .fetch_optional(&mut *tx)
                .await?;
        if already_seen.is_some() {
            return Err(StoreError::Rejected(format!(
                "tasks-file content hash already seen: {content_hash}"
            )));
        }

        let attachments = serde_json::to_string(&fields.attachments)?;
        let now = Utc::now();
        let id: i64 = sqlx::query(
            r"
            INSERT INTO tasks (
                user_id, prompt, command, source_type, source_ref,
                conversation_token, attachments, output_target, status,
                priority, created_at, scheduled_job_id, heartbeat_silent
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)
            RETURNING id
            ",
        )
        .bind(fields.user_id)
        .bind(&fields.prompt)
        .bind(&fields.command)
        .bind(fields.source_type.as_str())
        .bind(&fields.source_ref)
        .bind(&fields.conversation_token)
        .bind(attachments)
        .bind(fields.output_target.as_str())
        .bind(fields.priority)
        .bind(now)
        .bind(fields.scheduled_job_id)
        .bind(fields.heartbeat_silent)
        .fetch_one(&mut *tx)
        .await?
        .try_get::<i64, _>("id")?;

        sqlx::query(
            "INSERT INTO tasks_file_seen (content_hash, task_id, seen_at) VALUES (?, ?, ?)",
        )
        .bind(content_hash)
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Create a task only if `message_id` has not been seen in `email_seen`
    /// (spec 8: processed-email-id idempotent ingestion).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Rejected`] if the message id was already seen,
    /// or any other [`StoreError`] on database failure.
    pub async fn create_task_from_email(
        &self,
        fields: NewTask,
        message_id: &str,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let already_seen: Option<i64> =
            sqlx::query_scalar("SELECT task_id FROM email_seen WHERE message_id = ?")
                .bind(message_id)
                .fetch_optional(&mut *tx)
                .await?;
        if already_seen.is_some() {
            return Err(StoreError::Rejected(format!(
                "email message id already seen: {message_id}"
            )));
        }

        let attachments = serde_json::to_string(&fields.attachments)?;
        let now = Utc::now();
        let id: i64 = sqlx::query(
            r"
            INSERT INTO tasks (
                user_id, prompt, command, source_type, source_ref,
                conversation_token, attachments, output_target, status,
                priority, created_at, scheduled_job_id, heartbeat_silent
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)
            RETURNING id
            ",
        )
        .bind(fields.user_id)
        .bind(&fields.prompt)
        .bind(&fields.command)
        .bind(fields.source_type.as_str())
        .bind(&fields.source_ref)
        .bind(&fields.conversation_token)
        .bind(attachments)
        .bind(fields.output_target.as_str())
        .bind(fields.priority)
        .bind(now)
        .bind(fields.scheduled_job_id)
        .bind(fields.heartbeat_silent)
        .fetch_one(&mut *tx)
        .await?
        .try_get::<i64, _>("id")?;

        sqlx::query("INSERT INTO email_seen (message_id, task_id, seen_at) VALUES (?, ?, ?)")
            .bind(message_id)
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Fetch a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such task exists.
    pub async fn get_task(&self, id: i64) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
        task_from_row(&row)
    }

    /// List tasks, optionally filtered by status and/or user.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        user_id: Option<i64>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM tasks
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR user_id = ?2)
            ORDER BY created_at DESC
            ",
        )
        .bind(status.map(TaskStatus::as_str))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    /// Apply a partial update to a task's lifecycle fields
    /// (spec 4.1 UpdateStatus).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such task exists.
    pub async fn update_status(&self, id: i64, update: StatusUpdate) -> Result<(), StoreError> {
        let now = Utc::now();
        let actions_taken_json = match &update.actions_taken {
            Some(actions) => Some(serde_json::to_string(actions)?),
            None => None,
        };

        let result = sqlx::query(
            r"
            UPDATE tasks SET
                status = COALESCE(?1, status),
                result = COALESCE(?2, result),
                actions_taken = COALESCE(?3, actions_taken),
                last_error = COALESCE(?4, last_error),
                worker_pid = COALESCE(?5, worker_pid),
                started_at = CASE WHEN ?6 THEN ?7 ELSE started_at END,
                completed_at = CASE WHEN ?8 THEN ?7 ELSE completed_at END
            WHERE id = ?9
            ",
        )
        .bind(update.status.map(TaskStatus::as_str))
        .bind(&update.result)
        .bind(actions_taken_json)
        .bind(&update.last_error)
        .bind(&update.worker_pid)
        .bind(update.started)
        .bind(now)
        .bind(update.completed)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Count pending tasks for a user within a queue type
    /// (spec 4.1 CountPendingForUserQueue; spec 4.2 dispatch).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn count_pending_for_user_queue(
        &self,
        user_id: i64,
        source_types: &[SourceType],
    ) -> Result<i64, StoreError> {
        let types: Vec<&str> = source_types.iter().map(|s| s.as_str()).collect();
        let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            r"SELECT COUNT(*) FROM tasks
               WHERE user_id = ? AND status = 'pending'
                 AND (not_before IS NULL OR not_before <= ?)
                 AND source_type IN ({placeholders})"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(user_id)
            .bind(Utc::now());
        for t in &types {
            query = query.bind(*t);
        }
        Ok(query.fetch_one(&self.pool).await?)
    }

    /// Distinct user ids with at least one eligible pending task of the
    /// given source types (spec 4.1 GetUsersWithPending).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn get_users_with_pending(
        &self,
        source_types: &[SourceType],
    ) -> Result<Vec<i64>, StoreError> {
        let types: Vec<&str> = source_types.iter().map(|s| s.as_str()).collect();
        let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            r"SELECT DISTINCT user_id FROM tasks
               WHERE status = 'pending'
                 AND (not_before IS NULL OR not_before <= ?)
                 AND source_type IN ({placeholders})"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(Utc::now());
        for t in &types {
            query = query.bind(*t);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Whether an in-flight, non-cancelled foreground task exists for this
    /// conversation token (spec 4.1 HasActiveForegroundForChannel; spec 4.2
    /// channel gate).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn has_active_foreground_for_channel(
        &self,
        conversation_token: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM tasks
            WHERE conversation_token = ?
              AND status IN ('locked', 'running')
              AND cancel_requested = 0
              AND source_type IN ('talk', 'email', 'cli', 'tasks_file')
            ",
        )
        .bind(conversation_token)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}
