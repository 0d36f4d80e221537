//! Wires every component together and drives one claimed task from prompt
//! assembly through execution, store write-back, deferred post-processing,
//! and delivery (spec 4, the `pool::TaskRunner` implementation `main.rs`
//! hands to the worker pool and scheduler).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::adapters::talk::TalkAdapter;
use crate::adapters::{DeliverFailure, DeliverResult};
use crate::config::{AdminSet, EngineConfig, RuntimePaths};
use crate::context::Triage;
use crate::deferred::DeferredProcessor;
use crate::executor::{CancelCheck, ErrorKind, Executor, ProgressCallback};
use crate::pool::TaskRunner;
use crate::prompt::{AssembleContext, PromptAssembler};
use crate::store::{ClaimLimits, StatusUpdate, Store, StoreError};
use crate::types::{ActionTaken, ConversationEntry, OutputTarget, Task, TaskStatus};

/// A [`Triage`] that always falls back to recent-only selection.
///
/// Wiring in an LLM-backed triage means running a second, cheaper child
/// invocation through the same [`Executor`]; the reference engine ships
/// this pass-through so the context selector's timeout-fallback path is
/// always exercised rather than depending on an extra subprocess call.
pub struct PassthroughTriage;

#[async_trait]
impl Triage for PassthroughTriage {
    async fn triage(&self, _candidates: &[ConversationEntry], _task_prompt: &str) -> Option<Vec<i64>> {
        None
    }
}

/// A [`UserCapResolver`] backed by [`EngineConfig::users`] overrides
/// (spec 4.2 per-user caps).
pub struct ConfigCapResolver {
    users: std::collections::HashMap<i64, crate::config::UserOverride>,
}

impl ConfigCapResolver {
    /// Build a resolver from the engine's user override table.
    pub fn new(users: std::collections::HashMap<i64, crate::config::UserOverride>) -> Self {
        Self { users }
    }
}

impl crate::pool::UserCapResolver for ConfigCapResolver {
    fn foreground_cap(&self, user_id: i64) -> Option<u32> {
        self.users.get(&user_id).and_then(|o| (o.max_foreground_workers > 0).then_some(o.max_foreground_workers))
    }

    fn background_cap(&self, user_id: i64) -> Option<u32> {
        self.users.get(&user_id).and_then(|o| (o.max_background_workers > 0).then_some(o.max_background_workers))
    }
}

/// Everything the engine needs to drive a task to completion, owned by
/// `main` and shared (via `Arc`) with the worker pool and scheduler.
pub struct Engine {
    store: Store,
    config: EngineConfig,
    paths: RuntimePaths,
    admins: AdminSet,
    prompt: PromptAssembler,
    executor: Executor,
    deferred: DeferredProcessor,
    triage: Arc<dyn Triage>,
    talk: Option<Arc<TalkAdapter>>,
}

impl Engine {
    /// Build a new engine from its already-constructed parts.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        config: EngineConfig,
        paths: RuntimePaths,
        admins: AdminSet,
        prompt: PromptAssembler,
        executor: Executor,
        deferred: DeferredProcessor,
        triage: Arc<dyn Triage>,
        talk: Option<Arc<TalkAdapter>>,
    ) -> Self {
        Self {
            store,
            config,
            paths,
            admins,
            prompt,
            executor,
            deferred,
            triage,
            talk,
        }
    }

    /// The claim-limit tunables derived from this engine's store config,
    /// for the worker pool to use when claiming tasks.
    pub fn claim_limits(&self) -> ClaimLimits {
        ClaimLimits {
            max_retry_age_minutes: self.config.store.max_retry_age_minutes,
            stale_lock_minutes: self.config.store.stale_lock_minutes,
            execution_timeout_minutes: i64::try_from(self.config.executor.execution_timeout_secs.div_ceil(60))
                .unwrap_or(i64::MAX),
        }
    }

    /// Run exactly one already-claimed task and return the refreshed row
    /// (used directly by the CLI's `-x` immediate-execution flag, bypassing
    /// the pool's claim step since the caller already knows the task id).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the task cannot be loaded or the final
    /// refetch fails.
    pub async fn run_task_by_id(&self, id: i64) -> Result<Task, StoreError> {
        let task = self.store.get_task(id).await?;
        self.process_task(task, "cli:inline").await;
        self.store.get_task(id).await
    }

    /// Admin policy, exposed for the CLI's `user` subcommands.
    pub fn admins(&self) -> &AdminSet {
        &self.admins
    }

    /// Runtime filesystem layout, exposed for the CLI's `user` subcommands.
    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    /// Shared store handle, exposed for CLI subcommands that read/write
    /// directly (`list`, `show`, `resource`, `kv`).
    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn process_task(&self, task: Task, worker_pid: &str) {
        let is_admin = self.admins.is_admin(task.user_id);
        let timezone: Tz = Tz::UTC;
        let deferred_dir = self.paths.deferred_dir_for_user(task.user_id);
        if let Err(err) = std::fs::create_dir_all(&deferred_dir) {
            warn!(%err, task_id = task.id, "failed to create deferred dir");
        }

        let attachment_extensions: HashSet<String> = task
            .attachments
            .iter()
            .filter_map(|p| PathBuf::from(p).extension().map(|e| e.to_string_lossy().to_lowercase()))
            .collect();

        let ctx = AssembleContext {
            is_admin,
            bot_name: &self.config.namespace,
            bot_dir: &self.paths.root,
            user_timezone: timezone,
            deferred_dir: &deferred_dir,
            reply_to_task_id: None,
            attachment_extensions,
            data_store_path: Some(&self.paths.db_path),
        };

        if let Err(err) = self.store.update_status(
            task.id,
            StatusUpdate {
                status: Some(TaskStatus::Running),
                worker_pid: Some(worker_pid.to_owned()),
                started: true,
                ..StatusUpdate::default()
            },
        ).await {
            warn!(%err, task_id = task.id, "failed to mark task running");
        }

        let outcome = if let Some(command) = &task.command {
            self.run_command(task.id, command, &deferred_dir).await
        } else {
            let assembled = match self.prompt.assemble(&task, &ctx, self.triage.as_ref()).await {
                Ok(assembled) => assembled,
                Err(err) => {
                    error!(%err, task_id = task.id, "prompt assembly failed");
                    let _ = self
                        .store
                        .retry_or_fail(
                            task.id,
                            &err.to_string(),
                            self.config.store.max_attempts,
                            self.config.store.max_retry_age_minutes,
                            &self.config.store.backoff_minutes,
                        )
                        .await;
                    return;
                }
            };

            let cancel = self.spawn_cancel_watcher(task.id);
            let progress: ProgressCallback = Arc::new(move |_msg| {});

            match self
                .executor
                .execute(&assembled.text, &assembled.env, &self.paths.root, self.config.prompt.restricted_env, &[], cancel, progress)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    error!(%err, task_id = task.id, "executor failed to spawn");
                    let _ = self
                        .store
                        .retry_or_fail(
                            task.id,
                            &err.to_string(),
                            self.config.store.max_attempts,
                            self.config.store.max_retry_age_minutes,
                            &self.config.store.backoff_minutes,
                        )
                        .await;
                    return;
                }
            }
        };

        self.finish_task(&task, outcome, &deferred_dir, is_admin).await;
    }

    async fn run_command(
        &self,
        task_id: i64,
        command: &str,
        deferred_dir: &std::path::Path,
    ) -> crate::executor::ExecResult {
        use tokio::process::Command;

        let env = crate::prompt::assemble_environment(true, &[], &crate::credentials::Credentials::default(), true, deferred_dir);
        match Command::new("sh").arg("-c").arg(command).env_clear().envs(&env).output().await {
            Ok(output) => {
                let text = String::from_utf8_lossy(&output.stdout).into_owned();
                if output.status.success() {
                    crate::executor::ExecResult {
                        success: true,
                        result_text: text,
                        actions_taken: Vec::new(),
                        error_kind: None,
                    }
                } else {
                    crate::executor::ExecResult {
                        success: false,
                        result_text: String::from_utf8_lossy(&output.stderr).into_owned(),
                        actions_taken: Vec::new(),
                        error_kind: Some(ErrorKind::TerminalSubprocessError),
                    }
                }
            }
            Err(err) => {
                warn!(%err, task_id, "command task failed to spawn");
                crate::executor::ExecResult {
                    success: false,
                    result_text: err.to_string(),
                    actions_taken: Vec::new(),
                    error_kind: Some(ErrorKind::TerminalSubprocessError),
                }
            }
        }
    }

    fn spawn_cancel_watcher(&self, task_id: i64) -> CancelCheck {
        let flag = Arc::new(AtomicBool::new(false));
        let store = self.store.clone();
        let watcher_flag = Arc::clone(&flag);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                match store.get_task(task_id).await {
                    Ok(task) => {
                        if task.cancel_requested {
                            watcher_flag.store(true, Ordering::Relaxed);
                            return;
                        }
                        if task.status.is_terminal() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
        Arc::new(move || flag.load(Ordering::Relaxed))
    }

    async fn finish_task(
        &self,
        task: &Task,
        outcome: crate::executor::ExecResult,
        deferred_dir: &std::path::Path,
        is_admin: bool,
    ) {
        if outcome.success {
            let actions_taken: Vec<ActionTaken> = outcome.actions_taken;
            if let Err(err) = self
                .store
                .update_status(
                    task.id,
                    StatusUpdate {
                        status: Some(TaskStatus::Completed),
                        result: Some(outcome.result_text.clone()),
                        actions_taken: Some(actions_taken.clone()),
                        completed: true,
                        ..StatusUpdate::default()
                    },
                )
                .await
            {
                warn!(%err, task_id = task.id, "failed to mark task completed");
            }

            if task.source_type.is_interactive() {
                if let Some(token) = &task.conversation_token {
                    let entry = ConversationEntry {
                        task_id: task.id,
                        user_id: task.user_id,
                        prompt: task.prompt.clone().unwrap_or_default(),
                        result: outcome.result_text.clone(),
                        timestamp: chrono::Utc::now(),
                        actions_taken,
                    };
                    if let Err(err) = self.store.append_conversation_entry(&entry, token).await {
                        warn!(%err, task_id = task.id, "failed to append conversation entry");
                    }
                }
            }

            self.deferred.apply_for_task(task.id, is_admin, deferred_dir).await;

            if let Some(job_id) = task.scheduled_job_id {
                self.record_scheduled_job_outcome(job_id, true, None).await;
            }

            let Ok(refreshed) = self.store.get_task(task.id).await else { return };
            self.deliver_result(&refreshed).await;
            return;
        }

        match outcome.error_kind {
            Some(ErrorKind::Cancelled) => {
                if let Err(err) = self
                    .store
                    .update_status(
                        task.id,
                        StatusUpdate {
                            status: Some(TaskStatus::Cancelled),
                            result: Some("cancelled".to_owned()),
                            completed: true,
                            ..StatusUpdate::default()
                        },
                    )
                    .await
                {
                    warn!(%err, task_id = task.id, "failed to mark task cancelled");
                }
            }
            _ => {
                if let Err(err) = self
                    .store
                    .retry_or_fail(
                        task.id,
                        &outcome.result_text,
                        self.config.store.max_attempts,
                        self.config.store.max_retry_age_minutes,
                        &self.config.store.backoff_minutes,
                    )
                    .await
                {
                    warn!(%err, task_id = task.id, "failed to record retry/fail outcome");
                    return;
                }

                let Ok(refreshed) = self.store.get_task(task.id).await else { return };
                if refreshed.status == TaskStatus::Failed {
                    if let Some(job_id) = task.scheduled_job_id {
                        self.record_scheduled_job_outcome(job_id, false, refreshed.last_error.as_deref()).await;
                    }
                    self.deliver_failure(&refreshed).await;
                }
            }
        }
    }

    /// Report a scheduled job's *actual* task outcome once the task has
    /// reached a terminal state, not merely once it has been enqueued
    /// (spec 4.5 auto-disable bookkeeping).
    async fn record_scheduled_job_outcome(&self, job_id: i64, success: bool, error: Option<&str>) {
        if let Err(err) = self
            .store
            .record_scheduled_job_run(
                job_id,
                chrono::Utc::now(),
                success,
                error,
                self.config.scheduler.consecutive_failure_threshold,
            )
            .await
        {
            warn!(%err, job_id, "failed to record scheduled job run");
        }
    }

    async fn deliver_result(&self, task: &Task) {
        match task.output_target {
            OutputTarget::None => {}
            OutputTarget::Talk | OutputTarget::Both | OutputTarget::All => {
                if let Some(talk) = &self.talk {
                    talk.deliver_result(task).await;
                } else {
                    info!(task_id = task.id, "no talk adapter configured, result logged only");
                }
                if matches!(task.output_target, OutputTarget::Both | OutputTarget::All) {
                    info!(task_id = task.id, "email/ntfy delivery not wired, result logged only");
                }
            }
            OutputTarget::Email | OutputTarget::Ntfy => {
                info!(task_id = task.id, target = task.output_target.as_str(), "delivery transport not wired, result logged only");
            }
        }
    }

    async fn deliver_failure(&self, task: &Task) {
        match task.output_target {
            OutputTarget::None => {}
            OutputTarget::Talk | OutputTarget::Both | OutputTarget::All => {
                if let Some(talk) = &self.talk {
                    talk.deliver_failure(task).await;
                } else {
                    info!(task_id = task.id, "no talk adapter configured, failure logged only");
                }
            }
            OutputTarget::Email | OutputTarget::Ntfy => {
                info!(task_id = task.id, target = task.output_target.as_str(), "failure delivery transport not wired, logged only");
            }
        }
    }
}

#[async_trait]
impl TaskRunner for Engine {
    async fn run(&self, task: Task, worker_pid: &str) {
        self.process_task(task, worker_pid).await;
    }
}
