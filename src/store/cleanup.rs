//! Periodic cleanup routines (spec 4.1): confirmation timeout, stale
//! pending failure, and terminal-task retention.

use chrono::{Duration, Utc};

use super::{Store, StoreError};

/// Row counts affected by one [`Store::run_cleanup`] pass, surfaced so the
/// scheduler loop can log them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    /// `pending_confirmation` tasks expired to `cancelled`.
    pub confirmations_expired: u64,
    /// `pending` tasks failed for exceeding `stale_pending_fail_hours`.
    pub stale_pending_failed: u64,
    /// Terminal tasks deleted past `task_retention_days`.
    pub tasks_deleted: u64,
}

impl Store {
    /// Run all three cleanup routines in sequence.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if any statement fails.
    pub async fn run_cleanup(
        &self,
        confirmation_timeout_minutes: i64,
        stale_pending_fail_hours: i64,
        task_retention_days: i64,
    ) -> Result<CleanupReport, StoreError> {
        let now = Utc::now();

        let confirmation_cutoff = now - Duration::minutes(confirmation_timeout_minutes);
        let confirmations_expired = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'cancelled',
                completed_at = ?1,
                last_error = 'confirmation timed out'
            WHERE status = 'pending_confirmation'
              AND created_at <= ?2
            ",
        )
        .bind(now)
        .bind(confirmation_cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let stale_pending_cutoff = now - Duration::hours(stale_pending_fail_hours);
        let stale_pending_failed = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'failed',
                completed_at = ?1,
                last_error = 'stale pending task exceeded fail window'
            WHERE status = 'pending'
              AND created_at <= ?2
            ",
        )
        .bind(now)
        .bind(stale_pending_cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let retention_cutoff = now - Duration::days(task_retention_days);
        let tasks_deleted = sqlx::query(
            r"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at IS NOT NULL
              AND completed_at <= ?
            ",
        )
        .bind(retention_cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(CleanupReport {
            confirmations_expired,
            stale_pending_failed,
            tasks_deleted,
        })
    }
}
