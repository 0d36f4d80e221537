//! Integration tests for the task store: claim ordering, stale-lock
//! recovery, retry backoff, idempotent ingestion, cleanup.

use chrono::Utc;
use marshal::store::{ClaimLimits, StatusUpdate, Store};
use marshal::types::{ConversationEntry, NewTask, OutputTarget, QueueType, SourceType, TaskStatus};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A store backed by a real file (not `:memory:`) so a second, independent
/// connection can be opened against the same database — used by the
/// stale-lock and cleanup tests to backdate timestamps the store's own API
/// has no reason to expose a setter for.
async fn file_store() -> (Store, TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.db");
    let store = Store::connect(&path).await.expect("open store");
    (store, dir, path)
}

async fn raw_pool(path: &std::path::Path) -> SqlitePool {
    SqlitePool::connect(&format!("sqlite://{}", path.display())).await.expect("raw connect")
}

fn limits() -> ClaimLimits {
    ClaimLimits {
        max_retry_age_minutes: 60,
        stale_lock_minutes: 30,
        execution_timeout_minutes: 10,
    }
}

#[tokio::test]
async fn create_and_get_round_trips_every_field() {
    let (store, _dir, _path) = file_store().await;
    let id = store
        .create_task(NewTask {
            user_id: 7,
            prompt: Some("do the thing".to_owned()),
            conversation_token: Some("room-1".to_owned()),
            source_type: SourceType::Talk,
            output_target: OutputTarget::Talk,
            priority: 5,
            ..NewTask::default()
        })
        .await
        .unwrap();

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.user_id, 7);
    assert_eq!(task.prompt.as_deref(), Some("do the thing"));
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, 5);
    assert_eq!(task.attempt_count, 0);
}

#[tokio::test]
async fn claim_task_orders_by_priority_then_age() {
    let (store, _dir, _path) = file_store().await;
    let low = store
        .create_task(NewTask { user_id: 1, prompt: Some("low".into()), source_type: SourceType::Cli, ..NewTask::default() })
        .await
        .unwrap();
    let high = store
        .create_task(NewTask { user_id: 1, prompt: Some("high".into()), source_type: SourceType::Cli, priority: 10, ..NewTask::default() })
        .await
        .unwrap();

    let claimed = store
        .claim_task(None, QueueType::Foreground, "worker-1", limits())
        .await
        .unwrap()
        .expect("a task should be claimable");
    assert_eq!(claimed.task.id, high);
    assert_eq!(claimed.task.status, TaskStatus::Locked);
    assert_eq!(claimed.task.attempt_count, 1);

    let second = store
        .claim_task(None, QueueType::Foreground, "worker-1", limits())
        .await
        .unwrap()
        .expect("the remaining task should still be claimable");
    assert_eq!(second.task.id, low);
}

#[tokio::test]
async fn claim_task_only_dispatches_its_own_queue_type() {
    let (store, _dir, _path) = file_store().await;
    store
        .create_task(NewTask { user_id: 1, prompt: Some("bg".into()), source_type: SourceType::Scheduled, ..NewTask::default() })
        .await
        .unwrap();

    let claimed = store.claim_task(None, QueueType::Foreground, "worker-1", limits()).await.unwrap();
    assert!(claimed.is_none(), "a background-sourced task must never surface on the foreground queue");

    let claimed = store.claim_task(None, QueueType::Background, "worker-1", limits()).await.unwrap();
    assert!(claimed.is_some());
}

#[tokio::test]
async fn claim_task_respects_not_before() {
    let (store, _dir, _path) = file_store().await;
    let id = store
        .create_task(NewTask { user_id: 1, prompt: Some("later".into()), source_type: SourceType::Cli, ..NewTask::default() })
        .await
        .unwrap();

    store.retry_or_fail(id, "transient failure", 5, 60, &[30]).await.unwrap();

    let claimed = store.claim_task(None, QueueType::Foreground, "worker-1", limits()).await.unwrap();
    assert!(claimed.is_none(), "a task whose not_before is in the future must not be claimable yet");
}

#[tokio::test]
async fn retry_or_fail_fails_outright_past_max_attempts() {
    let (store, _dir, _path) = file_store().await;
    let id = store
        .create_task(NewTask { user_id: 1, prompt: Some("x".into()), source_type: SourceType::Cli, ..NewTask::default() })
        .await
        .unwrap();
    store.update_status(id, StatusUpdate { status: Some(TaskStatus::Running), ..StatusUpdate::default() }).await.unwrap();

    // attempt_count starts at 0; max_attempts of 0 means no retry is ever granted.
    store.retry_or_fail(id, "boom", 0, 60, &[1]).await.unwrap();
    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn recover_stale_locks_resets_recoverable_and_fails_hopeless() {
    let (store, _dir, path) = file_store().await;
    let raw = raw_pool(&path).await;

    let recoverable = store
        .create_task(NewTask { user_id: 1, prompt: Some("a".into()), source_type: SourceType::Cli, ..NewTask::default() })
        .await
        .unwrap();
    let hopeless = store
        .create_task(NewTask { user_id: 1, prompt: Some("b".into()), source_type: SourceType::Cli, ..NewTask::default() })
        .await
        .unwrap();

    // Backdate both as if a worker locked them and then crashed; `hopeless`
    // is old enough to cross max_retry_age_minutes, `recoverable` is not.
    sqlx::query("UPDATE tasks SET status = 'locked', started_at = datetime('now', '-2 hours'), created_at = datetime('now', '-2 hours') WHERE id = ?")
        .bind(recoverable)
        .execute(&raw)
        .await
        .unwrap();
    sqlx::query("UPDATE tasks SET status = 'locked', started_at = datetime('now', '-2 hours'), created_at = datetime('now', '-200 hours') WHERE id = ?")
        .bind(hopeless)
        .execute(&raw)
        .await
        .unwrap();

    let tight_limits = ClaimLimits { max_retry_age_minutes: 60, stale_lock_minutes: 30, execution_timeout_minutes: 30 };
    // Any claim_task call runs stale-lock recovery first, regardless of what it then claims.
    let _ = store.claim_task(Some(999), QueueType::Foreground, "worker-2", tight_limits).await.unwrap();

    let recovered = store.get_task(recoverable).await.unwrap();
    assert_eq!(recovered.status, TaskStatus::Pending, "a recoverable stale lock resets to pending");
    assert_eq!(recovered.worker_pid, None);

    let failed = store.get_task(hopeless).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
}

#[tokio::test]
async fn tasks_file_ingestion_is_idempotent_on_content_hash() {
    let (store, _dir, _path) = file_store().await;
    let fields = NewTask { user_id: 1, prompt: Some("row".into()), source_type: SourceType::TasksFile, ..NewTask::default() };
    let first = store.create_task_from_tasks_file(fields.clone(), "hash-abc").await.unwrap();
    let second = store.create_task_from_tasks_file(fields, "hash-abc").await;
    assert!(second.is_err());
    assert_eq!(store.list_tasks(None, Some(1)).await.unwrap().len(), 1);
    assert!(first > 0);
}

#[tokio::test]
async fn email_ingestion_is_idempotent_on_message_id() {
    let (store, _dir, _path) = file_store().await;
    let fields = NewTask { user_id: 1, prompt: Some("reply to this".into()), source_type: SourceType::Email, ..NewTask::default() };
    store.create_task_from_email(fields.clone(), "msg-1").await.unwrap();
    let rejected = store.create_task_from_email(fields, "msg-1").await;
    assert!(matches!(rejected, Err(marshal::store::StoreError::Rejected(_))));
}

#[tokio::test]
async fn has_active_foreground_for_channel_ignores_cancelled_tasks() {
    let (store, _dir, _path) = file_store().await;
    let id = store
        .create_task(NewTask {
            user_id: 1,
            prompt: Some("x".into()),
            conversation_token: Some("room-1".into()),
            source_type: SourceType::Talk,
            ..NewTask::default()
        })
        .await
        .unwrap();
    store.claim_task(None, QueueType::Foreground, "w", limits()).await.unwrap();
    assert!(store.has_active_foreground_for_channel("room-1").await.unwrap());

    store.update_status(id, StatusUpdate { status: Some(TaskStatus::Cancelled), completed: true, ..StatusUpdate::default() }).await.unwrap();
    assert!(!store.has_active_foreground_for_channel("room-1").await.unwrap());
}

#[tokio::test]
async fn recent_conversation_returns_oldest_first_within_limit() {
    let (store, _dir, _path) = file_store().await;
    for i in 0..5i64 {
        let task_id = store
            .create_task(NewTask { user_id: 1, prompt: Some(format!("q{i}")), source_type: SourceType::Talk, ..NewTask::default() })
            .await
            .unwrap();
        let entry = ConversationEntry {
            task_id,
            user_id: 1,
            prompt: format!("q{i}"),
            result: format!("a{i}"),
            timestamp: Utc::now() + chrono::Duration::seconds(i),
            actions_taken: Vec::new(),
        };
        store.append_conversation_entry(&entry, "room-1").await.unwrap();
    }

    let recent = store.recent_conversation("room-1", 3).await.unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].prompt, "q2");
    assert_eq!(recent[2].prompt, "q4");
    assert!(recent.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn run_cleanup_expires_confirmations_fails_stale_pending_and_deletes_old_terminal() {
    let (store, _dir, path) = file_store().await;
    let raw = raw_pool(&path).await;

    let confirming = store
        .create_task(NewTask { user_id: 1, prompt: Some("confirm me".into()), source_type: SourceType::Cli, ..NewTask::default() })
        .await
        .unwrap();
    store.update_status(confirming, StatusUpdate { status: Some(TaskStatus::PendingConfirmation), ..StatusUpdate::default() }).await.unwrap();
    sqlx::query("UPDATE tasks SET created_at = datetime('now', '-3 hours') WHERE id = ?")
        .bind(confirming)
        .execute(&raw)
        .await
        .unwrap();

    let stale_pending = store
        .create_task(NewTask { user_id: 1, prompt: Some("stuck".into()), source_type: SourceType::Cli, ..NewTask::default() })
        .await
        .unwrap();
    sqlx::query("UPDATE tasks SET created_at = datetime('now', '-10 hours') WHERE id = ?")
        .bind(stale_pending)
        .execute(&raw)
        .await
        .unwrap();

    let old_done = store
        .create_task(NewTask { user_id: 1, prompt: Some("finished".into()), source_type: SourceType::Cli, ..NewTask::default() })
        .await
        .unwrap();
    store
        .update_status(old_done, StatusUpdate { status: Some(TaskStatus::Completed), result: Some("ok".into()), completed: true, ..StatusUpdate::default() })
        .await
        .unwrap();
    sqlx::query("UPDATE tasks SET completed_at = datetime('now', '-30 days') WHERE id = ?")
        .bind(old_done)
        .execute(&raw)
        .await
        .unwrap();

    let report = store.run_cleanup(120, 2, 7).await.unwrap();
    assert_eq!(report.confirmations_expired, 1);
    assert_eq!(report.stale_pending_failed, 1);
    assert_eq!(report.tasks_deleted, 1);

    assert_eq!(store.get_task(confirming).await.unwrap().status, TaskStatus::Cancelled);
    assert_eq!(store.get_task(stale_pending).await.unwrap().status, TaskStatus::Failed);
    assert!(store.get_task(old_done).await.is_err());
}

#[tokio::test]
async fn kv_round_trips_and_lists_in_key_order() {
    let (store, _dir, _path) = file_store().await;
    store.kv_set(1, "prefs", "theme", "dark").await.unwrap();
    store.kv_set(1, "prefs", "locale", "en").await.unwrap();
    assert_eq!(store.kv_get(1, "prefs", "theme").await.unwrap().as_deref(), Some("dark"));

    let all = store.kv_list(1, "prefs").await.unwrap();
    assert_eq!(all, vec![("locale".to_owned(), "en".to_owned()), ("theme".to_owned(), "dark".to_owned())]);

    store.kv_delete(1, "prefs", "theme").await.unwrap();
    assert_eq!(store.kv_get(1, "prefs", "theme").await.unwrap(), None);
}
