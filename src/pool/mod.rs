//! The worker pool: per-user worker slots, two-tier dispatch with instance
//! and per-user concurrency caps (spec 4.2).
//!
//! Dispatch and worker lifecycle are deliberately separate from task
//! processing itself: the pool only decides *whether* to spawn a worker
//! and hands it a [`TaskRunner`] to drive one claimed task to completion.
//! What "processing a task" means (prompt assembly, execution, delivery)
//! is the engine's concern, not the pool's.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::store::{ClaimLimits, Store};
use crate::types::{QueueType, SourceType, Task};

/// Drives one claimed task to completion: prompt assembly, execution,
/// result write-back, deferred post-processing, and delivery.
///
/// Implemented by the engine; the pool only calls it.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Process one claimed task. Must not panic: any internal failure is
    /// the runner's responsibility to record via the store.
    async fn run(&self, task: Task, worker_pid: &str);
}

type SlotKey = (i64, QueueType);

/// In-process registry of live worker slots and round-robin cursors.
struct Registry {
    /// Occupied slot indices per (user_id, queue_type).
    slots: HashMap<SlotKey, HashSet<u32>>,
    /// Index into the sorted user list dispatch last started from, per queue type.
    round_robin_cursor: HashMap<QueueType, usize>,
}

impl Registry {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            round_robin_cursor: HashMap::new(),
        }
    }

    fn active_count(&self, key: SlotKey) -> u32 {
        u32::try_from(self.slots.get(&key).map_or(0, HashSet::len)).unwrap_or(u32::MAX)
    }

    fn instance_active(&self, queue_type: QueueType) -> u32 {
        self.slots
            .iter()
            .filter(|((_, qt), _)| *qt == queue_type)
            .map(|(_, s)| u32::try_from(s.len()).unwrap_or(u32::MAX))
            .sum()
    }

    /// Lowest unused slot index for this (user, queue_type), filling gaps.
    fn next_free_slot(&self, key: SlotKey) -> u32 {
        let used = self.slots.get(&key);
        let mut idx = 0u32;
        loop {
            if used.map_or(true, |s| !s.contains(&idx)) {
                return idx;
            }
            idx += 1;
        }
    }

    fn occupy(&mut self, key: SlotKey, slot: u32) {
        self.slots.entry(key).or_default().insert(slot);
    }

    fn release(&mut self, key: SlotKey, slot: u32) {
        if let Some(set) = self.slots.get_mut(&key) {
            set.remove(&slot);
            if set.is_empty() {
                self.slots.remove(&key);
            }
        }
    }
}

/// Resolves per-user worker caps, falling back to instance defaults when a
/// user has no override (0 = inherit, per spec 4.2).
pub trait UserCapResolver: Send + Sync {
    /// Foreground worker cap for a user; `None` inherits the instance default.
    fn foreground_cap(&self, user_id: i64) -> Option<u32>;
    /// Background worker cap for a user; `None` inherits the instance default.
    fn background_cap(&self, user_id: i64) -> Option<u32>;
}

/// The worker pool itself.
pub struct WorkerPool {
    store: Store,
    config: PoolConfig,
    claim_limits: ClaimLimits,
    registry: Arc<Mutex<Registry>>,
}

impl WorkerPool {
    /// Build a new, empty worker pool.
    pub fn new(store: Store, config: PoolConfig, claim_limits: ClaimLimits) -> Self {
        Self {
            store,
            config,
            claim_limits,
            registry: Arc::new(Mutex::new(Registry::new())),
        }
    }

    fn instance_cap(&self, queue_type: QueueType) -> u32 {
        match queue_type {
            QueueType::Foreground => self.config.max_foreground_workers,
            QueueType::Background => self.config.max_background_workers,
        }
    }

    fn default_user_cap(&self, queue_type: QueueType) -> u32 {
        match queue_type {
            QueueType::Foreground => self.config.user_max_foreground_workers,
            QueueType::Background => self.config.user_max_background_workers,
        }
    }

    fn source_types_for(queue_type: QueueType) -> &'static [SourceType] {
        match queue_type {
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

    /// Run one dispatch pass: for each queue type, round-robin across
    /// users with pending work, spawning workers up to the instance and
    /// per-user caps (spec 4.2 dispatch algorithm).
    pub async fn dispatch(&self, runner: Arc<dyn TaskRunner>, caps: &dyn UserCapResolver) {
        for queue_type in [QueueType::Foreground, QueueType::Background] {
            self.dispatch_queue(queue_type, &runner, caps).await;
        }
    }

    async fn dispatch_queue(
        &self,
        queue_type: QueueType,
        runner: &Arc<dyn TaskRunner>,
        caps: &dyn UserCapResolver,
    ) {
        let cap = self.instance_cap(queue_type);
        let mut headroom = {
            let registry = self.registry.lock().await;
            cap.saturating_sub(registry.instance_active(queue_type))
        };
        if headroom == 0 {
            return;
        }

        let mut users = match self.store.get_users_with_pending(Self::source_types_for(queue_type)).await
        {
            Ok(users) => users,
            Err(err) => {
                warn!(?err, "failed to list users with pending tasks");
                return;
            }
        };
        if users.is_empty() {
            return;
        }
        users.sort_unstable();

        let start = {
            let registry = self.registry.lock().await;
            registry
                .round_robin_cursor
                .get(&queue_type)
                .copied()
                .unwrap_or(0)
                % users.len()
        };

        let default_cap = self.default_user_cap(queue_type);
        let mut served = 0usize;
        let mut cursor = start;

        while served < users.len() && headroom > 0 {
            let user_id = users[cursor];
            cursor = (cursor + 1) % users.len();
            served += 1;

            let user_cap = match queue_type {
                QueueType::Foreground => caps.foreground_cap(user_id),
                QueueType::Background => caps.background_cap(user_id),
            }
            .filter(|c| *c > 0)
            .unwrap_or(default_cap);

            let user_active = {
                let registry = self.registry.lock().await;
                registry.active_count((user_id, queue_type))
            };
            let user_headroom = user_cap.saturating_sub(user_active);
            if user_headroom == 0 {
                continue;
            }

            let pending = match self
                .store
                .count_pending_for_user_queue(user_id, Self::source_types_for(queue_type))
                .await
            {
                Ok(n) => u32::try_from(n).unwrap_or(0),
                Err(err) => {
                    warn!(?err, user_id, "failed to count pending tasks");
                    continue;
                }
            };
            if pending == 0 {
                continue;
            }

            let to_spawn = user_headroom.min(pending).min(headroom);
            for _ in 0..to_spawn {
                self.spawn_worker(user_id, queue_type, Arc::clone(runner)).await;
                headroom -= 1;
            }
        }

        let mut registry = self.registry.lock().await;
        registry.round_robin_cursor.insert(queue_type, cursor);
    }

    async fn spawn_worker(&self, user_id: i64, queue_type: QueueType, runner: Arc<dyn TaskRunner>) {
        let key = (user_id, queue_type);
        let slot = {
            let mut registry = self.registry.lock().await;
            let slot = registry.next_free_slot(key);
            registry.occupy(key, slot);
            slot
        };

        let worker_pid = format!("{}:{}:{}", queue_type.as_str(), user_id, slot);
        info!(user_id, queue_type = queue_type.as_str(), slot, "spawning worker");

        let store = self.store.clone();
        let idle_timeout = Duration::from_secs(self.config.worker_idle_timeout_secs);
        let limits = self.claim_limits;
        let registry_slots = Arc::clone(&self.registry);

        tokio::spawn(async move {
            // Run the worker body as its own task so a panic inside
            // `runner.run()` is caught at this inner join rather than
            // unwinding straight past the slot release below.
            let handle = tokio::spawn(worker_loop(
                store,
                runner,
                user_id,
                queue_type,
                worker_pid,
                idle_timeout,
                limits,
            ));
            if let Err(err) = handle.await {
                warn!(user_id, queue_type = queue_type.as_str(), slot, %err, "worker task panicked");
            }

            let mut registry = registry_slots.lock().await;
            registry.release(key, slot);
        });
    }
}

async fn worker_loop(
    store: Store,
    runner: Arc<dyn TaskRunner>,
    user_id: i64,
    queue_type: QueueType,
    worker_pid: String,
    idle_timeout: Duration,
    limits: ClaimLimits,
) {
    loop {
        let claimed = match store
            .claim_task(Some(user_id), queue_type, &worker_pid, limits)
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                warn!(?err, user_id, "claim_task failed, worker exiting");
                return;
            }
        };

        match claimed {
            Some(claimed) => {
                debug!(task_id = claimed.task.id, %worker_pid, "worker claimed task");
                runner.run(claimed.task, &worker_pid).await;
            }
            None => {
                tokio::time::sleep(idle_timeout).await;
                return;
            }
        }
    }
}
