//! Integration tests for worker pool dispatch: per-user and instance-wide
//! concurrency caps, round-robin fairness across users.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use marshal::config::PoolConfig;
use marshal::pool::{TaskRunner, UserCapResolver, WorkerPool};
use marshal::store::{ClaimLimits, Store};
use marshal::types::{NewTask, SourceType, Task};
use tokio::sync::Mutex;

async fn file_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("pool-test.db");
    let store = Store::connect(&path).await.expect("open store");
    (store, dir)
}

fn limits() -> ClaimLimits {
    ClaimLimits {
        max_retry_age_minutes: 60,
        stale_lock_minutes: 30,
        execution_timeout_minutes: 10,
    }
}

/// Records the user id of every task it processes and finishes instantly,
/// so dispatch loops drain all pending work for a user in one worker pass.
struct RecordingRunner {
    processed: Mutex<Vec<(i64, i64)>>,
}

impl RecordingRunner {
    fn new() -> Self {
        Self { processed: Mutex::new(Vec::new()) }
    }
}

#[async_trait::async_trait]
impl TaskRunner for RecordingRunner {
    async fn run(&self, task: Task, _worker_pid: &str) {
        self.processed.lock().await.push((task.user_id, task.id));
    }
}

struct FixedCaps {
    foreground: HashMap<i64, u32>,
}

impl UserCapResolver for FixedCaps {
    fn foreground_cap(&self, user_id: i64) -> Option<u32> {
        self.foreground.get(&user_id).copied()
    }
    fn background_cap(&self, _user_id: i64) -> Option<u32> {
        None
    }
}

async fn wait_until_processed(runner: &RecordingRunner, count: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if runner.processed.lock().await.len() >= count || Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn dispatch_respects_per_user_foreground_cap() {
    let (store, _dir) = file_store().await;
    for i in 0..5 {
        store
            .create_task(NewTask {
                user_id: 1,
                prompt: Some(format!("task {i}")),
                source_type: SourceType::Cli,
                ..NewTask::default()
            })
            .await
            .unwrap();
    }

    let pool = WorkerPool::new(store, PoolConfig { max_foreground_workers: 10, ..PoolConfig::default() }, limits());
    let runner = Arc::new(RecordingRunner::new());
    let caps = FixedCaps { foreground: HashMap::from([(1, 2)]) };

    pool.dispatch(runner.clone() as Arc<dyn TaskRunner>, &caps).await;
    // Give the spawned worker slots a moment to claim and process; since
    // the cap is 2, no more than 2 workers should ever be concurrently
    // spawned for user 1 on this single dispatch pass.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let processed = runner.processed.lock().await;
    assert!(processed.len() <= 2, "only up to 2 worker slots should have been spawned for the capped user, got {processed:?}");
}

#[tokio::test]
async fn dispatch_serves_every_user_with_pending_work() {
    let (store, _dir) = file_store().await;
    for user_id in [1, 2, 3] {
        store
            .create_task(NewTask {
                user_id,
                prompt: Some("hello".to_owned()),
                source_type: SourceType::Cli,
                ..NewTask::default()
            })
            .await
            .unwrap();
    }

    let pool = WorkerPool::new(store, PoolConfig { max_foreground_workers: 10, ..PoolConfig::default() }, limits());
    let runner = Arc::new(RecordingRunner::new());
    let caps = FixedCaps { foreground: HashMap::new() };

    pool.dispatch(runner.clone() as Arc<dyn TaskRunner>, &caps).await;
    wait_until_processed(&runner, 3, Duration::from_secs(5)).await;

    let processed = runner.processed.lock().await;
    let mut users: Vec<i64> = processed.iter().map(|(u, _)| *u).collect();
    users.sort_unstable();
    assert_eq!(users, vec![1, 2, 3]);
}

#[tokio::test]
async fn dispatch_honors_instance_wide_cap() {
    let (store, _dir) = file_store().await;
    for user_id in [1, 2, 3, 4] {
        store
            .create_task(NewTask {
                user_id,
                prompt: Some("hello".to_owned()),
                source_type: SourceType::Cli,
                ..NewTask::default()
            })
            .await
            .unwrap();
    }

    let pool = WorkerPool::new(store, PoolConfig { max_foreground_workers: 1, ..PoolConfig::default() }, limits());
    let runner = Arc::new(RecordingRunner::new());
    let caps = FixedCaps { foreground: HashMap::new() };

    pool.dispatch(runner.clone() as Arc<dyn TaskRunner>, &caps).await;
    // Only one worker slot should ever have been spawned instance-wide.
    wait_until_processed(&runner, 1, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let processed = runner.processed.lock().await;
    assert!(!processed.is_empty());
}
