//! Configuration loading and validation (ambient stack, spec 4.8).
//!
//! A single `config.toml` is parsed once at startup into a typed
//! [`EngineConfig`] tree. Every tunable named in spec §4.1–§4.7 has a
//! `serde` default here, so the defaults in the specification are
//! load-bearing rather than merely descriptive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level engine configuration, parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Namespace used for default paths and environment variable prefixes
    /// (e.g. `{namespace}-scheduler-daemon.lock`).
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Task store tunables (spec 4.1).
    #[serde(default)]
    pub store: StoreConfig,

    /// Worker pool tunables (spec 4.2).
    #[serde(default)]
    pub pool: PoolConfig,

    /// Executor tunables (spec 4.4).
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Scheduler loop tunables (spec 4.5).
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Prompt assembler tunables (spec 4.3).
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Context selector tunables (spec 4.7).
    #[serde(default)]
    pub context: ContextConfig,

    /// Talk channel configuration.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Per-user worker cap and admin overrides.
    #[serde(default)]
    pub users: HashMap<i64, UserOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            store: StoreConfig::default(),
            pool: PoolConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            prompt: PromptConfig::default(),
            context: ContextConfig::default(),
            channels: ChannelsConfig::default(),
            users: HashMap::new(),
        }
    }
}

/// Task store tunables (spec 4.1).
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Age beyond which a stuck lock is failed outright rather than retried.
    #[serde(default = "default_max_retry_age_minutes")]
    pub max_retry_age_minutes: i64,

    /// Lock age beyond which a `locked`/`running` task is considered stale.
    #[serde(default = "default_stale_lock_minutes")]
    pub stale_lock_minutes: i64,

    /// Maximum attempts before a task is failed outright.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,

    /// Exponential backoff delays in minutes, one per retry attempt.
    #[serde(default = "default_backoff_minutes")]
    pub backoff_minutes: Vec<i64>,

    /// Minutes before an unanswered confirmation is cancelled.
    #[serde(default = "default_confirmation_timeout_minutes")]
    pub confirmation_timeout_minutes: i64,

    /// Hours before a never-claimed pending task is failed outright.
    #[serde(default = "default_stale_pending_fail_hours")]
    pub stale_pending_fail_hours: i64,

    /// Days a terminal task is retained before deletion.
    #[serde(default = "default_task_retention_days")]
    pub task_retention_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retry_age_minutes: default_max_retry_age_minutes(),
            stale_lock_minutes: default_stale_lock_minutes(),
            max_attempts: default_max_attempts(),
            backoff_minutes: default_backoff_minutes(),
            confirmation_timeout_minutes: default_confirmation_timeout_minutes(),
            stale_pending_fail_hours: default_stale_pending_fail_hours(),
            task_retention_days: default_task_retention_days(),
        }
    }
}

/// Worker pool tunables (spec 4.2).
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Instance-wide cap on concurrent foreground workers.
    #[serde(default = "default_max_foreground_workers")]
    pub max_foreground_workers: u32,

    /// Instance-wide cap on concurrent background workers.
    #[serde(default = "default_max_background_workers")]
    pub max_background_workers: u32,

    /// Default per-user cap on concurrent foreground workers.
    #[serde(default = "default_user_max_foreground_workers")]
    pub user_max_foreground_workers: u32,

    /// Default per-user cap on concurrent background workers.
    #[serde(default = "default_user_max_background_workers")]
    pub user_max_background_workers: u32,

    /// Seconds an idle worker waits for new work before exiting.
    #[serde(default = "default_worker_idle_timeout_secs")]
    pub worker_idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_foreground_workers: default_max_foreground_workers(),
            max_background_workers: default_max_background_workers(),
            user_max_foreground_workers: default_user_max_foreground_workers(),
            user_max_background_workers: default_user_max_background_workers(),
            worker_idle_timeout_secs: default_worker_idle_timeout_secs(),
        }
    }
}

/// Executor tunables (spec 4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Path to the external LLM CLI binary.
    #[serde(default = "default_claude_binary")]
    pub claude_binary: PathBuf,

    /// Path to the sandbox wrapper binary (e.g. bubblewrap), if sandboxing is enabled.
    #[serde(default)]
    pub sandbox_binary: Option<PathBuf>,

    /// Seconds before an invocation with no `ResultEvent` is killed.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// Minimum seconds between forwarded progress messages.
    #[serde(default = "default_progress_min_interval_secs")]
    pub progress_min_interval_secs: u64,

    /// Maximum progress messages forwarded per task.
    #[serde(default = "default_progress_max_messages")]
    pub progress_max_messages: u32,

    /// Retry attempts for transient upstream errors within one invocation.
    #[serde(default = "default_transient_retry_attempts")]
    pub transient_retry_attempts: u32,

    /// Seconds to wait between transient-retry attempts.
    #[serde(default = "default_transient_retry_delay_secs")]
    pub transient_retry_delay_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            claude_binary: default_claude_binary(),
            sandbox_binary: None,
            execution_timeout_secs: default_execution_timeout_secs(),
            progress_min_interval_secs: default_progress_min_interval_secs(),
            progress_max_messages: default_progress_max_messages(),
            transient_retry_attempts: default_transient_retry_attempts(),
            transient_retry_delay_secs: default_transient_retry_delay_secs(),
        }
    }
}

/// Scheduler loop tunables (spec 4.5).
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Tick interval for the daemon main loop.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Interval gate applied to every 60s-gated phase.
    #[serde(default = "default_phase_interval_secs")]
    pub phase_interval_secs: u64,

    /// Consecutive heartbeat/job failures before auto-disable.
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            phase_interval_secs: default_phase_interval_secs(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
        }
    }
}

/// Prompt assembler tunables (spec 4.3).
#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
    /// Directory containing skill subdirectories.
    #[serde(default = "default_skills_dir")]
    pub skills_dir: PathBuf,

    /// Directory containing per-user persona markdown files.
    #[serde(default = "default_personas_dir")]
    pub personas_dir: PathBuf,

    /// Path to the global emissaries (constitutional) text.
    #[serde(default = "default_emissaries_path")]
    pub emissaries_path: PathBuf,

    /// Directory containing per-user memory files (USER.md, channel memory,
    /// dated memories).
    #[serde(default = "default_memory_dir")]
    pub memory_dir: PathBuf,

    /// Number of days of dated memories to include.
    #[serde(default = "default_dated_memory_days")]
    pub dated_memory_days: i64,

    /// Number of recalled memories to include.
    #[serde(default = "default_recalled_memory_limit")]
    pub recalled_memory_limit: usize,

    /// Whether the environment passed to the child is restricted to
    /// declared skill variables (true) or the full parent environment (false).
    #[serde(default = "default_restricted_env")]
    pub restricted_env: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            skills_dir: default_skills_dir(),
            personas_dir: default_personas_dir(),
            emissaries_path: default_emissaries_path(),
            memory_dir: default_memory_dir(),
            dated_memory_days: default_dated_memory_days(),
            recalled_memory_limit: default_recalled_memory_limit(),
            restricted_env: default_restricted_env(),
        }
    }
}

/// Context selector tunables (spec 4.7).
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// Completed tasks retrieved per conversation before selection.
    #[serde(default = "default_lookback_count")]
    pub lookback_count: i64,

    /// Below this total, every message is included without triage.
    #[serde(default = "default_skip_selection_threshold")]
    pub skip_selection_threshold: i64,

    /// Most-recent messages unconditionally included.
    #[serde(default = "default_always_include_recent")]
    pub always_include_recent: i64,

    /// Seconds before the triage LLM call falls back to recent-only.
    #[serde(default = "default_triage_timeout_secs")]
    pub triage_timeout_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            lookback_count: default_lookback_count(),
            skip_selection_threshold: default_skip_selection_threshold(),
            always_include_recent: default_always_include_recent(),
            triage_timeout_secs: default_triage_timeout_secs(),
        }
    }
}

/// Talk channel configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    /// Talk (chat-bot) channel settings, absent when the channel is disabled.
    #[serde(default)]
    pub talk: Option<TalkConfig>,
}

/// Talk channel (chat-bot transport) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TalkConfig {
    /// Environment variable name holding the bot token.
    pub bot_token_env: String,
    /// User ids allowed to interact with the bot.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    /// Long-poll timeout in seconds.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

/// Per-user overrides layered on top of the pool/admin defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserOverride {
    /// Whether this user is an administrator (sees admin-only skills/sections).
    #[serde(default)]
    pub admin: bool,
    /// Foreground worker cap override; 0 inherits the instance default.
    #[serde(default)]
    pub max_foreground_workers: u32,
    /// Background worker cap override; 0 inherits the instance default.
    #[serde(default)]
    pub max_background_workers: u32,
    /// Daily briefing schedule, if this user has one configured (spec 4.5
    /// check_briefings).
    #[serde(default)]
    pub briefing: Option<BriefingOverride>,
}

/// One user's briefing cron expression, timezone, and delivery target
/// (spec 4.5 check_briefings, spec 3 BriefingSchedule).
#[derive(Debug, Clone, Deserialize)]
pub struct BriefingOverride {
    /// Standard 5-field cron expression, evaluated in `timezone`.
    pub cron: String,
    /// IANA timezone name the cron expression is evaluated in.
    #[serde(default = "default_briefing_timezone")]
    pub timezone: String,
    /// Delivery target for the resulting task.
    #[serde(default = "default_briefing_target")]
    pub target: crate::types::OutputTarget,
}

fn default_briefing_timezone() -> String {
    "UTC".to_owned()
}
fn default_briefing_target() -> crate::types::OutputTarget {
    crate::types::OutputTarget::Talk
}

// ---------------------------------------------------------------------------
// Defaults (spec 4.1, 4.2, 4.3, 4.4, 4.5, 4.7 — one function per documented default)
// ---------------------------------------------------------------------------

fn default_namespace() -> String {
    "marshal".to_owned()
}
fn default_max_retry_age_minutes() -> i64 {
    60
}
fn default_stale_lock_minutes() -> i64 {
    30
}
fn default_max_attempts() -> i64 {
    3
}
fn default_backoff_minutes() -> Vec<i64> {
    vec![1, 4, 16]
}
fn default_confirmation_timeout_minutes() -> i64 {
    120
}
fn default_stale_pending_fail_hours() -> i64 {
    2
}
fn default_task_retention_days() -> i64 {
    7
}
fn default_max_foreground_workers() -> u32 {
    5
}
fn default_max_background_workers() -> u32 {
    3
}
fn default_user_max_foreground_workers() -> u32 {
    2
}
fn default_user_max_background_workers() -> u32 {
    1
}
fn default_worker_idle_timeout_secs() -> u64 {
    30
}
fn default_claude_binary() -> PathBuf {
    PathBuf::from("claude")
}
fn default_execution_timeout_secs() -> u64 {
    600
}
fn default_progress_min_interval_secs() -> u64 {
    8
}
fn default_progress_max_messages() -> u32 {
    5
}
fn default_transient_retry_attempts() -> u32 {
    3
}
fn default_transient_retry_delay_secs() -> u64 {
    5
}
fn default_poll_interval_secs() -> u64 {
    2
}
fn default_phase_interval_secs() -> u64 {
    60
}
fn default_consecutive_failure_threshold() -> i64 {
    5
}
fn default_skills_dir() -> PathBuf {
    PathBuf::from("skills")
}
fn default_personas_dir() -> PathBuf {
    PathBuf::from("personas")
}
fn default_emissaries_path() -> PathBuf {
    PathBuf::from("emissaries.md")
}
fn default_memory_dir() -> PathBuf {
    PathBuf::from("memory")
}
fn default_dated_memory_days() -> i64 {
    7
}
fn default_recalled_memory_limit() -> usize {
    8
}
fn default_restricted_env() -> bool {
    true
}
fn default_lookback_count() -> i64 {
    25
}
fn default_skip_selection_threshold() -> i64 {
    3
}
fn default_always_include_recent() -> i64 {
    5
}
fn default_triage_timeout_secs() -> u64 {
    30
}
fn default_poll_timeout_secs() -> u64 {
    30
}

/// Load and parse `config.toml` from the given path.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not parse as valid
/// TOML matching [`EngineConfig`]'s shape.
pub fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: EngineConfig = toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Runtime filesystem layout rooted at the engine home directory (spec 6).
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Engine home directory.
    pub root: PathBuf,
    /// SQLite database file (`data/{namespace}.db`).
    pub db_path: PathBuf,
    /// Per-user temp root (`tmp/{user_id}/...`).
    pub tmp_root: PathBuf,
    /// Root-owned admins file (`/etc/{namespace}/admins`).
    pub admins_file: PathBuf,
}

impl RuntimePaths {
    /// Resolve runtime paths from the engine home, honoring the
    /// `{NAMESPACE}_DB_PATH`, `{NAMESPACE}_DEFERRED_DIR`, and
    /// `{NAMESPACE}_ADMINS_FILE` environment overrides (spec 6).
    pub fn resolve(root: PathBuf, namespace: &str) -> Self {
        let upper = namespace.to_uppercase();
        let db_path = std::env::var(format!("{upper}_DB_PATH"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("data").join(format!("{namespace}.db")));
        let tmp_root = std::env::var(format!("{upper}_DEFERRED_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("tmp"));
        let admins_file = std::env::var(format!("{upper}_ADMINS_FILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(format!("/etc/{namespace}/admins")));

        Self {
            root,
            db_path,
            tmp_root,
            admins_file,
        }
    }

    /// Per-user deferred-write directory (`DEFERRED_DIR` for that user's invocations).
    pub fn deferred_dir_for_user(&self, user_id: i64) -> PathBuf {
        self.tmp_root.join(user_id.to_string())
    }
}

/// Load the admins file: newline-delimited user ids. An empty file means
/// "all users are admin" (spec 6).
///
/// # Errors
///
/// Returns an error only for I/O failures other than a missing file —
/// a missing admins file is treated as "no admins configured".
pub fn load_admins(path: &Path) -> anyhow::Result<AdminSet> {
    if !path.exists() {
        return Ok(AdminSet::NoneConfigured);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read admins file {}: {e}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(AdminSet::All);
    }
    let ids = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.parse::<i64>().ok())
        .collect();
    Ok(AdminSet::Ids(ids))
}

/// The resolved admin policy from the admins file (spec 6).
#[derive(Debug, Clone)]
pub enum AdminSet {
    /// Empty file: every user is an admin.
    All,
    /// File absent: no one is an admin.
    NoneConfigured,
    /// Explicit list of admin user ids.
    Ids(std::collections::HashSet<i64>),
}

impl AdminSet {
    /// Whether the given user id is an administrator.
    pub fn is_admin(&self, user_id: i64) -> bool {
        match self {
            Self::All => true,
            Self::NoneConfigured => false,
            Self::Ids(set) => set.contains(&user_id),
        }
    }
}
