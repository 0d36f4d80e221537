//! The scheduler loop: ticks pollers, the cron evaluator, cleanup,
//! heartbeat evaluation, and dispatches workers (spec 4.5).

mod heartbeat;
mod lock;

pub use heartbeat::{in_quiet_hours, HeartbeatCheck};
pub use lock::SchedulerLock;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::pool::{TaskRunner, UserCapResolver, WorkerPool};
use crate::store::{CronFileEntry, Store};
use crate::types::{NewTask, OutputTarget, SourceType};

/// A collaborator polled on its own interval gate (email/CalDAV/tasks-file
/// ingestion, shared-file organization, nightly memory extraction,
/// invoice-schedule checks). Specified only at this trait boundary per
/// spec 6 — concrete transports are out of core scope.
#[async_trait]
pub trait Poller: Send + Sync {
    /// Stable name, used in interval-gate bookkeeping and logs.
    fn name(&self) -> &str;
    /// Run one polling pass.
    async fn poll(&self);
}

/// A user's briefing cron expression and timezone (spec 4.5 check_briefings).
#[derive(Debug, Clone)]
pub struct BriefingSchedule {
    /// Owning user.
    pub user_id: i64,
    /// Standard 5-field cron expression, evaluated in `timezone`.
    pub cron: String,
    /// The user's IANA timezone.
    pub timezone: Tz,
    /// Delivery target for the resulting task.
    pub target: OutputTarget,
}

struct IntervalGate {
    interval: Duration,
    last_run: Option<Instant>,
}

impl IntervalGate {
    fn new(interval: Duration) -> Self {
        Self { interval, last_run: None }
    }

    fn due(&mut self, now: Instant) -> bool {
        let due = self.last_run.is_none_or_elapsed(now, self.interval);
        if due {
            self.last_run = Some(now);
        }
        due
    }
}

trait OptionInstantExt {
    fn is_none_or_elapsed(&self, now: Instant, interval: Duration) -> bool;
}

impl OptionInstantExt for Option<Instant> {
    fn is_none_or_elapsed(&self, now: Instant, interval: Duration) -> bool {
        match self {
            None => true,
            Some(last) => now.duration_since(*last) >= interval,
        }
    }
}

/// The daemon's main loop driver (spec 4.5).
pub struct SchedulerLoop {
    store: Store,
    pool: Arc<WorkerPool>,
    config: SchedulerConfig,
    briefings: Vec<BriefingSchedule>,
    heartbeats: Vec<Arc<dyn HeartbeatCheck>>,
    pollers: Vec<Arc<dyn Poller>>,
    failure_threshold: i64,
    confirmation_timeout_minutes: i64,
    stale_pending_fail_hours: i64,
    task_retention_days: i64,
    gates: Mutex<HashMap<&'static str, IntervalGate>>,
}

impl SchedulerLoop {
    /// Build a new scheduler loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        pool: Arc<WorkerPool>,
        config: SchedulerConfig,
        briefings: Vec<BriefingSchedule>,
        heartbeats: Vec<Arc<dyn HeartbeatCheck>>,
        pollers: Vec<Arc<dyn Poller>>,
        failure_threshold: i64,
        confirmation_timeout_minutes: i64,
        stale_pending_fail_hours: i64,
        task_retention_days: i64,
    ) -> Self {
        let phase_interval = Duration::from_secs(config.phase_interval_secs);
        let mut gates = HashMap::new();
        for name in [
            "check_briefings",
            "check_scheduled_jobs",
            "check_heartbeats",
            "run_cleanup_checks",
        ] {
            gates.insert(name, IntervalGate::new(phase_interval));
        }
        for poller in &pollers {
            gates.insert(
                Box::leak(poller.name().to_owned().into_boxed_str()),
                IntervalGate::new(phase_interval),
            );
        }

        Self {
            store,
            pool,
            config,
            briefings,
            heartbeats,
            pollers,
            failure_threshold,
            confirmation_timeout_minutes,
            stale_pending_fail_hours,
            task_retention_days,
            gates: Mutex::new(gates),
        }
    }

    /// Run the daemon loop forever, ticking every `poll_interval_secs`.
    pub async fn run_forever(&self, runner: Arc<dyn TaskRunner>, caps: Arc<dyn UserCapResolver>) {
        let tick_interval = Duration::from_secs(self.config.poll_interval_secs);
        loop {
            self.tick(Arc::clone(&runner), caps.as_ref()).await;
            tokio::time::sleep(tick_interval).await;
        }
    }

    /// Run exactly one tick: every interval-gated phase in order, then
    /// dispatch (spec 4.5 phase ordering).
    pub async fn tick(&self, runner: Arc<dyn TaskRunner>, caps: &dyn UserCapResolver) {
        let now = Instant::now();

        if self.gate_due("check_briefings", now).await {
            self.check_briefings().await;
        }
        if self.gate_due("check_scheduled_jobs", now).await {
            self.check_scheduled_jobs().await;
        }
        for poller in &self.pollers {
            if self.gate_due_dynamic(poller.name(), now).await {
                poller.poll().await;
            }
        }
        if self.gate_due("check_heartbeats", now).await {
            self.check_heartbeats().await;
        }
        if self.gate_due("run_cleanup_checks", now).await {
            self.run_cleanup_checks().await;
        }

        self.pool.dispatch(runner, caps).await;
    }

    async fn gate_due(&self, name: &'static str, now: Instant) -> bool {
        let mut gates = self.gates.lock().await;
        gates.get_mut(name).is_some_and(|gate| gate.due(now))
    }

    async fn gate_due_dynamic(&self, name: &str, now: Instant) -> bool {
        let mut gates = self.gates.lock().await;
        gates.get_mut(name).is_some_and(|gate| gate.due(now))
    }

    async fn check_briefings(&self) {
        let now = Utc::now();
        for briefing in &self.briefings {
            let local_now = now.with_timezone(&briefing.timezone);
            let key = format!("briefing-fired:{}", local_now.format("%Y-%m-%d %H:%M"));
            let already_fired = self
                .store
                .kv_get(briefing.user_id, "scheduler", &key)
                .await
                .unwrap_or(None)
                .is_some();
            if already_fired {
                continue;
            }

            let Ok(schedule) = Schedule::from_str(&briefing.cron) else {
                warn!(user_id = briefing.user_id, cron = %briefing.cron, "invalid briefing cron expression");
                continue;
            };
            let due = schedule
                .after(&(local_now - chrono::Duration::minutes(1)))
                .next()
                .is_some_and(|next| next <= local_now);
            if !due {
                continue;
            }

            if let Err(err) = self
                .store
                .create_task(NewTask {
                    user_id: briefing.user_id,
                    source_type: SourceType::Briefing,
                    output_target: briefing.target,
                    ..NewTask::default()
                })
                .await
            {
                warn!(?err, user_id = briefing.user_id, "failed to enqueue briefing task");
                continue;
            }
            let _ = self.store.kv_set(briefing.user_id, "scheduler", &key, "1").await;
        }
    }

    async fn check_scheduled_jobs(&self) {
        let jobs = match self.store.list_enabled_scheduled_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(?err, "failed to list scheduled jobs");
                return;
            }
        };

        let now = Utc::now();
        for job in jobs {
            let Ok(schedule) = Schedule::from_str(&job.cron) else {
                warn!(job_id = job.id, cron = %job.cron, "invalid scheduled job cron expression");
                continue;
            };
            let anchor = job.last_run_at.unwrap_or(now - chrono::Duration::minutes(1));
            let due = schedule.after(&anchor).next().is_some_and(|next| next <= now);
            if !due {
                continue;
            }

            let enqueue_result = self
                .store
                .create_task(NewTask {
                    user_id: job.user_id,
                    prompt: job.prompt.clone(),
                    command: job.command.clone(),
                    source_type: SourceType::Scheduled,
                    conversation_token: job.conversation_token.clone(),
                    output_target: job.target,
                    scheduled_job_id: Some(job.id),
                    heartbeat_silent: job.silent_unless_action,
                    ..NewTask::default()
                })
                .await;

            // Enqueuing only ever tells us the job *fired*, not whether the
            // work it scheduled actually succeeded. A failed enqueue is a
            // genuine terminal failure (no task will ever run to report
            // back), so it goes straight to `record_scheduled_job_run`. A
            // successful enqueue just advances `last_run_at`; the real
            // outcome is recorded later, once the dispatched task reaches a
            // terminal state (see `Engine::finish_task`).
            match enqueue_result {
                Ok(_) => {
                    if let Err(err) = self.store.mark_scheduled_job_enqueued(job.id, now).await {
                        warn!(?err, job_id = job.id, "failed to advance scheduled job last_run_at");
                    }
                }
                Err(err) => {
                    warn!(?err, job_id = job.id, "failed to enqueue scheduled job task");
                    if let Err(err) = self
                        .store
                        .record_scheduled_job_run(job.id, now, false, Some(&err.to_string()), self.failure_threshold)
                        .await
                    {
                        warn!(?err, job_id = job.id, "failed to record scheduled job run");
                    }
                }
            }
        }
    }

    /// Synchronize a user's cron file into the store (spec 4.5, 8 Scenario E).
    ///
    /// # Errors
    ///
    /// Returns a [`crate::store::StoreError`] if any statement fails.
    pub async fn sync_cron_file(
        &self,
        user_id: i64,
        entries: Vec<CronFileEntry>,
    ) -> Result<(), crate::store::StoreError> {
        let keep_names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        for entry in entries {
            self.store.sync_scheduled_job(entry).await?;
        }
        self.store.delete_orphaned_scheduled_jobs(user_id, &keep_names).await?;
        Ok(())
    }

    async fn check_heartbeats(&self) {
        let now = Utc::now();
        for check in &self.heartbeats {
            let local_now = now.with_timezone(&check.timezone());
            if let Some((start, end)) = check.quiet_hours() {
                if in_quiet_hours(local_now.time(), start, end) {
                    continue;
                }
            }

            let state = match self.store.get_heartbeat_check(check.name()).await {
                Ok(state) => state,
                Err(err) => {
                    warn!(?err, check = check.name(), "failed to load heartbeat state");
                    continue;
                }
            };

            if let Some(state) = &state {
                if let Some(last_check) = state.last_check_at {
                    let elapsed = now.signed_duration_since(last_check).num_minutes();
                    if elapsed < check.interval_minutes() {
                        continue;
                    }
                }
            }

            let healthy = check.run().await;
            let should_alert = !healthy
                && state
                    .as_ref()
                    .and_then(|s| s.last_alert_at)
                    .is_none_or(|last| now.signed_duration_since(last).num_minutes() >= check.cooldown_minutes());

            if should_alert {
                if let Err(err) = self
                    .store
                    .create_task(NewTask {
                        user_id: check.user_id(),
                        prompt: Some(format!("Heartbeat check '{}' is unhealthy.", check.name())),
                        source_type: SourceType::Heartbeat,
                        output_target: OutputTarget::Talk,
                        heartbeat_silent: false,
                        ..NewTask::default()
                    })
                    .await
                {
                    warn!(?err, check = check.name(), "failed to enqueue heartbeat alert task");
                }
            }

            if let Err(err) = self
                .store
                .record_heartbeat_check(check.name(), check.user_id(), now, should_alert, healthy)
                .await
            {
                warn!(?err, check = check.name(), "failed to record heartbeat check");
            }
        }
    }

    async fn run_cleanup_checks(&self) {
        match self
            .store
            .run_cleanup(
                self.confirmation_timeout_minutes,
                self.stale_pending_fail_hours,
                self.task_retention_days,
            )
            .await
        {
            Ok(report) => {
                if report.confirmations_expired > 0 || report.stale_pending_failed > 0 || report.tasks_deleted > 0 {
                    info!(
                        confirmations_expired = report.confirmations_expired,
                        stale_pending_failed = report.stale_pending_failed,
                        tasks_deleted = report.tasks_deleted,
                        "cleanup pass complete"
                    );
                }
            }
            Err(err) => warn!(?err, "cleanup pass failed"),
        }
    }
}
