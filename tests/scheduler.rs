//! Integration tests for the scheduler loop: cron-file sync, scheduled-job
//! evaluation and auto-disable, briefing idempotence, heartbeat quiet hours.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use marshal::config::{PoolConfig, SchedulerConfig};
use marshal::pool::{TaskRunner, UserCapResolver, WorkerPool};
use marshal::scheduler::{BriefingSchedule, HeartbeatCheck, SchedulerLoop};
use marshal::store::{ClaimLimits, CronFileEntry, Store};
use marshal::types::{OutputTarget, Task};

async fn file_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("scheduler-test.db");
    let store = Store::connect(&path).await.expect("open store");
    (store, dir)
}

fn limits() -> ClaimLimits {
    ClaimLimits { max_retry_age_minutes: 60, stale_lock_minutes: 30, execution_timeout_minutes: 10 }
}

struct NoopRunner;

#[async_trait]
impl TaskRunner for NoopRunner {
    async fn run(&self, _task: Task, _worker_pid: &str) {}
}

struct NoCaps;

impl UserCapResolver for NoCaps {
    fn foreground_cap(&self, _user_id: i64) -> Option<u32> {
        Some(1)
    }
    fn background_cap(&self, _user_id: i64) -> Option<u32> {
        Some(1)
    }
}

fn scheduler_loop(store: Store, briefings: Vec<BriefingSchedule>, heartbeats: Vec<Arc<dyn HeartbeatCheck>>) -> SchedulerLoop {
    let pool = Arc::new(WorkerPool::new(store.clone(), PoolConfig::default(), limits()));
    SchedulerLoop::new(
        store,
        pool,
        SchedulerConfig::default(),
        briefings,
        heartbeats,
        Vec::new(),
        3,
        60,
        24,
        30,
    )
}

fn cron_entry(user_id: i64, name: &str, cron: &str) -> CronFileEntry {
    CronFileEntry {
        user_id,
        name: name.to_owned(),
        cron: cron.to_owned(),
        prompt: Some("do it".to_owned()),
        command: None,
        target: OutputTarget::Talk,
        conversation_token: None,
        enabled: true,
        once: false,
        silent_unless_action: false,
    }
}

#[tokio::test]
async fn sync_cron_file_removes_jobs_dropped_from_the_file() {
    let (store, _dir) = file_store().await;
    let scheduler = scheduler_loop(store.clone(), Vec::new(), Vec::new());

    scheduler
        .sync_cron_file(1, vec![cron_entry(1, "morning", "0 8 * * *"), cron_entry(1, "evening", "0 20 * * *")])
        .await
        .unwrap();
    assert_eq!(store.list_enabled_scheduled_jobs().await.unwrap().len(), 2);

    scheduler.sync_cron_file(1, vec![cron_entry(1, "morning", "0 8 * * *")]).await.unwrap();
    let remaining = store.list_enabled_scheduled_jobs().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "morning");
}

#[tokio::test]
async fn sync_cron_file_preserves_failure_count_across_resync() {
    let (store, _dir) = file_store().await;
    let scheduler = scheduler_loop(store.clone(), Vec::new(), Vec::new());

    scheduler.sync_cron_file(1, vec![cron_entry(1, "nightly", "0 2 * * *")]).await.unwrap();
    let job = store.list_enabled_scheduled_jobs().await.unwrap().into_iter().next().unwrap();
    store
        .record_scheduled_job_run(job.id, Utc::now(), false, Some("boom"), 3)
        .await
        .unwrap();
    let after_failure = store.get_scheduled_job(job.id).await.unwrap();
    assert_eq!(after_failure.consecutive_failures, 1);

    // Re-syncing the same cron expression must not reset the failure streak.
    scheduler.sync_cron_file(1, vec![cron_entry(1, "nightly", "0 2 * * *")]).await.unwrap();
    let after_resync = store.get_scheduled_job(job.id).await.unwrap();
    assert_eq!(after_resync.consecutive_failures, 1);
}

#[tokio::test]
async fn record_scheduled_job_run_auto_disables_past_failure_threshold() {
    let (store, _dir) = file_store().await;
    let id = store.sync_scheduled_job(cron_entry(1, "flaky", "* * * * *")).await.unwrap();

    for _ in 0..3 {
        store.record_scheduled_job_run(id, Utc::now(), false, Some("err"), 3).await.unwrap();
    }

    let job = store.get_scheduled_job(id).await.unwrap();
    assert!(!job.enabled, "job must auto-disable once consecutive failures hit the threshold");
    assert_eq!(job.consecutive_failures, 3);
}

#[tokio::test]
async fn record_scheduled_job_run_deletes_once_job_on_success() {
    let (store, _dir) = file_store().await;
    let mut entry = cron_entry(1, "one-shot", "0 0 1 1 *");
    entry.once = true;
    let id = store.sync_scheduled_job(entry).await.unwrap();

    store.record_scheduled_job_run(id, Utc::now(), true, None, 3).await.unwrap();
    assert!(store.get_scheduled_job(id).await.is_err(), "a successful once-job must be deleted, not updated");
}

#[tokio::test]
async fn check_briefings_is_idempotent_within_the_same_minute() {
    let (store, _dir) = file_store().await;
    let briefings = vec![BriefingSchedule {
        user_id: 1,
        cron: "* * * * *".to_owned(),
        timezone: "UTC".parse::<Tz>().unwrap(),
        target: OutputTarget::Talk,
    }];
    let scheduler = scheduler_loop(store.clone(), briefings, Vec::new());

    scheduler.tick(Arc::new(NoopRunner), &NoCaps).await;
    scheduler.tick(Arc::new(NoopRunner), &NoCaps).await;

    let tasks = store.list_tasks(None, Some(1)).await.unwrap();
    let briefing_tasks = tasks.iter().filter(|t| t.source_type == marshal::types::SourceType::Briefing).count();
    assert_eq!(briefing_tasks, 1, "the same minute must not fire a briefing twice");
}

struct FakeHeartbeat {
    name: String,
    healthy: AtomicBool,
    quiet_hours: Option<(NaiveTime, NaiveTime)>,
    calls: AtomicUsize,
}

#[async_trait]
impl HeartbeatCheck for FakeHeartbeat {
    fn name(&self) -> &str {
        &self.name
    }
    fn user_id(&self) -> i64 {
        1
    }
    fn interval_minutes(&self) -> i64 {
        0
    }
    fn cooldown_minutes(&self) -> i64 {
        60
    }
    fn quiet_hours(&self) -> Option<(NaiveTime, NaiveTime)> {
        self.quiet_hours
    }
    fn timezone(&self) -> Tz {
        chrono_tz::UTC
    }
    async fn run(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn check_heartbeats_suppresses_alerts_during_quiet_hours() {
    let (store, _dir) = file_store().await;
    // A quiet-hours window that always contains the current instant.
    let check = Arc::new(FakeHeartbeat {
        name: "disk-space".to_owned(),
        healthy: AtomicBool::new(false),
        quiet_hours: Some((NaiveTime::from_hms_opt(0, 0, 0).unwrap(), NaiveTime::from_hms_opt(23, 59, 59).unwrap())),
        calls: AtomicUsize::new(0),
    });
    let scheduler = scheduler_loop(store.clone(), Vec::new(), vec![check.clone() as Arc<dyn HeartbeatCheck>]);

    scheduler.tick(Arc::new(NoopRunner), &NoCaps).await;

    assert_eq!(check.calls.load(Ordering::SeqCst), 0, "a check must not even run while inside its quiet hours");
    let tasks = store.list_tasks(None, Some(1)).await.unwrap();
    assert!(tasks.iter().all(|t| t.source_type != marshal::types::SourceType::Heartbeat));
}

#[tokio::test]
async fn check_heartbeats_alerts_once_then_respects_cooldown() {
    let (store, _dir) = file_store().await;
    let check = Arc::new(FakeHeartbeat {
        name: "api-up".to_owned(),
        healthy: AtomicBool::new(false),
        quiet_hours: None,
        calls: AtomicUsize::new(0),
    });
    let scheduler = scheduler_loop(store.clone(), Vec::new(), vec![check.clone() as Arc<dyn HeartbeatCheck>]);

    scheduler.tick(Arc::new(NoopRunner), &NoCaps).await;
    let state = store.get_heartbeat_check("api-up").await.unwrap().expect("state recorded");
    assert!(state.last_alert_at.is_some(), "first unhealthy run must alert");

    // Interval is 0 so the second tick re-runs the check immediately, but the
    // 60-minute cooldown must suppress a second alert/task.
    scheduler.tick(Arc::new(NoopRunner), &NoCaps).await;
    let tasks = store.list_tasks(None, Some(1)).await.unwrap();
    let alerts = tasks.iter().filter(|t| t.source_type == marshal::types::SourceType::Heartbeat).count();
    assert_eq!(alerts, 1, "cooldown must suppress the second alert");
}
