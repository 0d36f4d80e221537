//! Scheduled-job CRUD and cron-file synchronization support (spec 3, 4.5).
//!
//! The per-user cron file is the human-editable source of truth; this
//! table is a synchronized cache the scheduler loop evaluates against.

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::types::{OutputTarget, ScheduledJob};

use super::{Store, StoreError};

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduledJob, StoreError> {
    let target_raw: String = row.try_get("target")?;
    let target = OutputTarget::parse(&target_raw).ok_or_else(|| {
        StoreError::Database(sqlx::Error::ColumnDecode {
            index: "target".into(),
            source: format!("unknown output target: {target_raw}").into(),
        })
    })?;

    Ok(ScheduledJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        cron: row.try_get("cron")?,
        prompt: row.try_get("prompt")?,
        command: row.try_get("command")?,
        target,
        conversation_token: row.try_get("conversation_token")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        last_run_at: row.try_get("last_run_at")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        last_error: row.try_get("last_error")?,
        last_success_at: row.try_get("last_success_at")?,
        once: row.try_get::<i64, _>("once")? != 0,
        silent_unless_action: row.try_get::<i64, _>("silent_unless_action")? != 0,
    })
}

/// Fields parsed from one entry of a user's cron file.
#[derive(Debug, Clone)]
pub struct CronFileEntry {
    /// Owning user.
    pub user_id: i64,
    /// Unique (per user) job name.
    pub name: String,
    /// Standard 5-field cron expression.
    pub cron: String,
    /// Free-form prompt, mutually exclusive with `command`.
    pub prompt: Option<String>,
    /// Shell command, mutually exclusive with `prompt`.
    pub command: Option<String>,
    /// Delivery target.
    pub target: OutputTarget,
    /// Room/conversation the job operates in, if any.
    pub conversation_token: Option<String>,
    /// Whether the entry is active.
    pub enabled: bool,
    /// Delete after first successful run.
    pub once: bool,
    /// Suppress delivery unless the run recorded an action.
    pub silent_unless_action: bool,
}

impl Store {
    /// Synchronize one cron-file entry into the `scheduled_jobs` cache.
    ///
    /// If the job is new, it is inserted. If it exists and only the cron
    /// expression changed, `last_run_at` is reset to avoid catch-up firing
    /// of historical slots, while `consecutive_failures` is preserved. All
    /// other field changes are applied without resetting run history.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the statement fails.
    pub async fn sync_scheduled_job(&self, entry: CronFileEntry) -> Result<i64, StoreError> {
        let existing = sqlx::query("SELECT id, cron FROM scheduled_jobs WHERE user_id = ? AND name = ?")
            .bind(entry.user_id)
            .bind(&entry.name)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            None => {
                let id: i64 = sqlx::query(
                    r"
                    INSERT INTO scheduled_jobs (
                        user_id, name, cron, prompt, command, target,
                        conversation_token, enabled, once, silent_unless_action
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    RETURNING id
                    ",
                )
                .bind(entry.user_id)
                .bind(&entry.name)
                .bind(&entry.cron)
                .bind(&entry.prompt)
                .bind(&entry.command)
                .bind(entry.target.as_str())
                .bind(&entry.conversation_token)
                .bind(entry.enabled)
                .bind(entry.once)
                .bind(entry.silent_unless_action)
                .fetch_one(&self.pool)
                .await?
                .try_get::<i64, _>("id")?;
                Ok(id)
            }
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                let old_cron: String = row.try_get("cron")?;
                let cron_changed = old_cron != entry.cron;

                sqlx::query(
                    r"
                    UPDATE scheduled_jobs SET
                        cron = ?1,
                        prompt = ?2,
                        command = ?3,
                        target = ?4,
                        conversation_token = ?5,
                        enabled = ?6,
                        once = ?7,
                        silent_unless_action = ?8,
                        last_run_at = CASE WHEN ?9 THEN NULL ELSE last_run_at END
                    WHERE id = ?10
                    ",
                )
                .bind(&entry.cron)
                .bind(&entry.prompt)
                .bind(&entry.command)
                .bind(entry.target.as_str())
                .bind(&entry.conversation_token)
                .bind(entry.enabled)
                .bind(entry.once)
                .bind(entry.silent_unless_action)
                .bind(cron_changed)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(id)
            }
        }
    }

    /// Delete scheduled jobs present in the store but absent from the
    /// current cron-file entry names for a user (orphan removal, spec 4.5).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the statement fails.
    pub async fn delete_orphaned_scheduled_jobs(
        &self,
        user_id: i64,
        keep_names: &[String],
    ) -> Result<u64, StoreError> {
        let placeholders = keep_names.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = if keep_names.is_empty() {
            "DELETE FROM scheduled_jobs WHERE user_id = ?".to_owned()
        } else {
            format!("DELETE FROM scheduled_jobs WHERE user_id = ? AND name NOT IN ({placeholders})")
        };
        let mut query = sqlx::query(&sql).bind(user_id);
        for name in keep_names {
            query = query.bind(name);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    /// List all enabled scheduled jobs, for cron evaluation.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn list_enabled_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = sqlx::query("SELECT * FROM scheduled_jobs WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Fetch a scheduled job by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such job exists.
    pub async fn get_scheduled_job(&self, id: i64) -> Result<ScheduledJob, StoreError> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scheduled job {id}")))?;
        job_from_row(&row)
    }

    /// Record the outcome of a fired job: updates `last_run_at` always, and
    /// either resets or increments `consecutive_failures`, auto-disabling
    /// once the configured threshold is reached (spec 3 invariant).
    ///
    /// A `once=true` job that succeeds is deleted rather than updated, per
    /// spec 8 Scenario E — callers must re-check existence afterward.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such job exists.
    pub async fn record_scheduled_job_run(
        &self,
        id: i64,
        ran_at: DateTime<Utc>,
        success: bool,
        error: Option<&str>,
        failure_threshold: i64,
    ) -> Result<(), StoreError> {
        let job = self.get_scheduled_job(id).await?;

        if success && job.once {
            sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        if success {
            sqlx::query(
                r"
                UPDATE scheduled_jobs SET
                    last_run_at = ?,
                    last_success_at = ?,
                    consecutive_failures = 0,
                    last_error = NULL
                WHERE id = ?
                ",
            )
            .bind(ran_at)
            .bind(ran_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            let new_failures = job.consecutive_failures + 1;
            let disable = new_failures >= failure_threshold;
            sqlx::query(
                r"
                UPDATE scheduled_jobs SET
                    last_run_at = ?1,
                    consecutive_failures = ?2,
                    last_error = ?3,
                    enabled = CASE WHEN ?4 THEN 0 ELSE enabled END
                WHERE id = ?5
                ",
            )
            .bind(ran_at)
            .bind(new_failures)
            .bind(error)
            .bind(disable)
            .bind(id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Advance `last_run_at` the moment a job's task is enqueued, so the
    /// next scheduler tick doesn't consider it still due while the task is
    /// in flight. Leaves `consecutive_failures`/`last_error` untouched —
    /// those are only known once the task itself reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such job exists.
    pub async fn mark_scheduled_job_enqueued(&self, id: i64, ran_at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE scheduled_jobs SET last_run_at = ? WHERE id = ?")
            .bind(ran_at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("scheduled job {id}")));
        }
        Ok(())
    }
}
