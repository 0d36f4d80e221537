//! Atomic task claiming with stale-lock recovery (spec 4.1 ClaimTask).
//!
//! The claim itself is a single `UPDATE ... RETURNING` statement selecting
//! its own candidate row via a CTE, so two concurrent callers can never
//! walk away with the same task: SQLite serializes writers, and the CTE's
//! `LIMIT 1` is evaluated under that same write lock.

use chrono::{Duration, Utc};

use crate::types::{QueueType, SourceType, Task};

use super::task::task_from_row;
use super::{Store, StoreError};

/// A task handed back by [`Store::claim_task`], with its dispatch queue
/// type attached for convenience.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    /// The claimed task, already transitioned to `locked`.
    pub task: Task,
}

/// Age thresholds governing stale-lock recovery, sourced from
/// [`crate::config::StoreConfig`] by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ClaimLimits {
    /// Age beyond which a stuck lock is failed outright (minutes).
    pub max_retry_age_minutes: i64,
    /// Lock age beyond which a `locked` task is considered stale (minutes).
    pub stale_lock_minutes: i64,
    /// Lock age beyond which a `running` task is considered stale (minutes).
    pub execution_timeout_minutes: i64,
}

fn source_types_for_queue(queue: QueueType) -> &'static [SourceType] {
    match queue {
        QueueType::Foreground => &[
            SourceType::Talk,
            SourceType::Email,
            SourceType::Cli,
            SourceType::TasksFile,
        ],
        QueueType::Background => &[
            SourceType::Scheduled,
            SourceType::Briefing,
            SourceType::Heartbeat,
        ],
    }
}

impl Store {
    /// Recover stale locks, then atomically claim the next eligible task
    /// for `queue_type` (optionally scoped to one `user_id`).
    ///
    /// Eligibility and ordering are exactly spec 4.1: `priority DESC,
    /// created_at ASC`, `not_before` must be null or past, and source type
    /// must belong to `queue_type`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if any statement fails.
    pub async fn claim_task(
        &self,
        user_id: Option<i64>,
        queue_type: QueueType,
        worker_pid: &str,
        limits: ClaimLimits,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        self.recover_stale_locks(limits).await?;

        let types: Vec<&str> = source_types_for_queue(queue_type)
            .iter()
            .map(|s| s.as_str())
            .collect();
        let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let now = Utc::now();

        let sql = format!(
            r"
            WITH candidate AS (
                SELECT id FROM tasks
                WHERE status = 'pending'
                  AND (not_before IS NULL OR not_before <= ?)
                  AND (? IS NULL OR user_id = ?)
                  AND source_type IN ({placeholders})
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
            )
            UPDATE tasks
            SET status = 'locked',
                worker_pid = ?,
                started_at = ?,
                attempt_count = attempt_count + 1
            WHERE id IN (SELECT id FROM candidate)
            RETURNING *
            "
        );

        let mut query = sqlx::query(&sql)
            .bind(now)
            .bind(user_id)
            .bind(user_id)
            .bind(worker_pid)
            .bind(now);
        for t in &types {
            query = query.bind(*t);
        }

        let row = query.fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(ClaimedTask {
                task: task_from_row(&row)?,
            })),
            None => Ok(None),
        }
    }

    /// Stale-lock recovery preamble run inside [`Store::claim_task`]
    /// (spec 4.1): fail hopelessly stuck tasks, reset recoverable ones to
    /// `pending` with `attempt_count` preserved.
    async fn recover_stale_locks(&self, limits: ClaimLimits) -> Result<(), StoreError> {
        let now = Utc::now();
        let max_retry_cutoff = now - Duration::minutes(limits.max_retry_age_minutes);
        let stale_lock_cutoff = now - Duration::minutes(limits.stale_lock_minutes);
        let exec_timeout_cutoff = now - Duration::minutes(limits.execution_timeout_minutes);

        sqlx::query(
            r"
            UPDATE tasks
            SET status = 'failed',
                last_error = 'stuck past retry age',
                completed_at = ?1
            WHERE status IN ('locked', 'running')
              AND created_at <= ?2
              AND (
                    (status = 'locked' AND started_at <= ?3)
                 OR (status = 'running' AND started_at <= ?4)
              )
            ",
        )
        .bind(now)
        .bind(max_retry_cutoff)
        .bind(stale_lock_cutoff)
        .bind(exec_timeout_cutoff)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            UPDATE tasks
            SET status = 'pending',
                worker_pid = NULL,
                started_at = NULL
            WHERE status IN ('locked', 'running')
              AND created_at > ?1
              AND (
                    (status = 'locked' AND started_at <= ?2)
                 OR (status = 'running' AND started_at <= ?3)
              )
            ",
        )
        .bind(max_retry_cutoff)
        .bind(stale_lock_cutoff)
        .bind(exec_timeout_cutoff)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reset a task to `pending` with an exponential-backoff `not_before`
    /// wakeup, or mark it `failed` outright when attempts or age are
    /// exhausted (spec 4.1 RetryOrFail).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such task exists.
    pub async fn retry_or_fail(
        &self,
        id: i64,
        error: &str,
        max_attempts: i64,
        max_retry_age_minutes: i64,
        backoff_minutes: &[i64],
    ) -> Result<(), StoreError> {
        let task = self.get_task(id).await?;
        let now = Utc::now();
        let age_minutes = now
            .signed_duration_since(task.created_at)
            .num_minutes();

        let should_retry =
            task.attempt_count < max_attempts && age_minutes < max_retry_age_minutes;

        let result = if should_retry {
            // `claim_task` already incremented `attempt_count` for this
            // attempt, so the first retry (attempt_count == 1) must index
            // the first backoff tier.
            let backoff_index = usize::try_from(task.attempt_count.saturating_sub(1).max(0)).unwrap_or(0);
            let delay = backoff_minutes
                .get(backoff_index)
                .or_else(|| backoff_minutes.last())
                .copied()
                .unwrap_or(1);
            let not_before = now + Duration::minutes(delay);

            sqlx::query(
                r"
                UPDATE tasks
                SET status = 'pending',
                    worker_pid = NULL,
                    started_at = NULL,
                    not_before = ?,
                    last_error = ?
                WHERE id = ?
                ",
            )
            .bind(not_before)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r"
                UPDATE tasks
                SET status = 'failed',
                    completed_at = ?,
                    last_error = ?
                WHERE id = ?
                ",
            )
            .bind(now)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
        }?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }
}
