//! Core domain types shared across the engine (spec sections 3, 9).
//!
//! Every data shape here is an explicit struct or enum — no dynamic
//! or stringly-typed task fields leak past the store boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The channel or trigger that produced a task (spec 3, 9).
///
/// The prompt assembler dispatches several of its sections on this
/// variant (e.g. briefings suppress resource/memory sections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Interactive chat-room message.
    Talk,
    /// Inbound email.
    Email,
    /// Operator CLI invocation.
    Cli,
    /// Row ingested from a shared tasks file.
    TasksFile,
    /// Enqueued by the cron evaluator.
    Scheduled,
    /// Enqueued by the daily briefing cron.
    Briefing,
    /// Enqueued by a health-check failure.
    Heartbeat,
}

impl SourceType {
    /// Queue type a source type is dispatched through (spec 4.2).
    pub fn queue_type(self) -> QueueType {
        match self {
            Self::Talk | Self::Email | Self::Cli | Self::TasksFile => QueueType::Foreground,
            Self::Scheduled | Self::Briefing | Self::Heartbeat => QueueType::Background,
        }
    }

    /// Whether interactive context (§4.7) is assembled for this source.
    pub fn is_interactive(self) -> bool {
        !matches!(self, Self::Scheduled | Self::Briefing | Self::Heartbeat)
    }

    /// Whether this source suppresses the briefing-excluded memory sections
    /// (resources, user/channel memory, dated/recalled memories, §4.3).
    pub fn is_briefing(self) -> bool {
        matches!(self, Self::Briefing)
    }

    /// Lowercase string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Talk => "talk",
            Self::Email => "email",
            Self::Cli => "cli",
            Self::TasksFile => "tasks_file",
            Self::Scheduled => "scheduled",
            Self::Briefing => "briefing",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Parse from the database's lowercase string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "talk" => Some(Self::Talk),
            "email" => Some(Self::Email),
            "cli" => Some(Self::Cli),
            "tasks_file" => Some(Self::TasksFile),
            "scheduled" => Some(Self::Scheduled),
            "briefing" => Some(Self::Briefing),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Dispatch tier a worker slot belongs to (spec 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Interactive, user-driven work.
    Foreground,
    /// Scheduled, system-driven work.
    Background,
}

impl QueueType {
    /// Lowercase string form stored in the database and used in slot keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
        }
    }
}

/// Where a task's result should be delivered (spec 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    /// Deliver via the Talk channel.
    Talk,
    /// Deliver via email.
    Email,
    /// Deliver via both Talk and email.
    Both,
    /// Deliver via push notification only.
    Ntfy,
    /// Deliver via every configured transport.
    All,
    /// Suppress delivery; the result is still stored (spec 3 invariant).
    None,
}

impl OutputTarget {
    /// Lowercase string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Talk => "talk",
            Self::Email => "email",
            Self::Both => "both",
            Self::Ntfy => "ntfy",
            Self::All => "all",
            Self::None => "none",
        }
    }

    /// Parse from the database's lowercase string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "talk" => Some(Self::Talk),
            "email" => Some(Self::Email),
            "both" => Some(Self::Both),
            "ntfy" => Some(Self::Ntfy),
            "all" => Some(Self::All),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// A task's lifecycle status (spec 3).
///
/// `pending → locked → running → {completed | failed | pending_confirmation | cancelled}`.
/// Terminal states never transition further except
/// `pending_confirmation → cancelled` on confirmation timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Newly created, eligible for claim.
    Pending,
    /// Claimed by a worker, about to start.
    Locked,
    /// Actively being processed by a worker.
    Running,
    /// Waiting on a confirmation step before delivery.
    PendingConfirmation,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully, no further retry.
    Failed,
    /// Stopped by user request.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status has no further lifecycle transitions
    /// (barring the one permitted `pending_confirmation → cancelled` timeout).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::Running => "running",
            Self::PendingConfirmation => "pending_confirmation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the database's lowercase string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "locked" => Some(Self::Locked),
            "running" => Some(Self::Running),
            "pending_confirmation" => Some(Self::PendingConfirmation),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A single recorded tool invocation surfaced during execution (spec 4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTaken {
    /// Human-readable description of what the tool did.
    pub description: String,
    /// When the action was recorded.
    pub at: DateTime<Utc>,
}

/// The unit of work owned by one user (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Row identity.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Free-form prompt text. Mutually exclusive with `command`.
    pub prompt: Option<String>,
    /// Shell command to run directly, bypassing the LLM. Mutually exclusive with `prompt`.
    pub command: Option<String>,
    /// Triggering channel/source.
    pub source_type: SourceType,
    /// Channel message id or file hash identifying the trigger.
    pub source_ref: Option<String>,
    /// Opaque conversation/room/thread identifier.
    pub conversation_token: Option<String>,
    /// Attachment file paths.
    pub attachments: Vec<String>,
    /// Where the result should be delivered.
    pub output_target: OutputTarget,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Dispatch priority; higher claims first.
    pub priority: i64,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// When a worker started processing this task.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of execution attempts so far.
    pub attempt_count: i64,
    /// Most recent error message, if any.
    pub last_error: Option<String>,
    /// Logical id of the worker slot currently holding this task.
    pub worker_pid: Option<String>,
    /// Set by an adapter to request cooperative cancellation.
    pub cancel_requested: bool,
    /// Suppresses delivery for heartbeat tasks with no actionable result.
    pub heartbeat_silent: bool,
    /// The scheduled job that created this task, if any.
    pub scheduled_job_id: Option<i64>,
    /// Tool-use descriptions accumulated during execution.
    pub actions_taken: Vec<ActionTaken>,
    /// Earliest instant this task becomes eligible for claim again
    /// (durable exponential-backoff gate, spec 9 open question).
    pub not_before: Option<DateTime<Utc>>,
    /// Result text, once completed.
    pub result: Option<String>,
}

impl Task {
    /// Age of this task since creation.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }

    /// Whether this task dispatches via the command path rather than the LLM
    /// (spec 3 invariant: `command` and free-form `prompt` are mutually exclusive).
    pub fn is_command(&self) -> bool {
        self.command.is_some()
    }
}

/// Fields accepted by `Store::create_task` (spec 4.1).
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Owning user.
    pub user_id: i64,
    /// Free-form prompt text.
    pub prompt: Option<String>,
    /// Shell command, mutually exclusive with `prompt`.
    pub command: Option<String>,
    /// Triggering channel/source.
    pub source_type: SourceType,
    /// Channel message id or file hash identifying the trigger.
    pub source_ref: Option<String>,
    /// Opaque conversation/room/thread identifier.
    pub conversation_token: Option<String>,
    /// Attachment file paths.
    pub attachments: Vec<String>,
    /// Where the result should be delivered.
    pub output_target: OutputTarget,
    /// Dispatch priority; higher claims first.
    pub priority: i64,
    /// The scheduled job that created this task, if any.
    pub scheduled_job_id: Option<i64>,
    /// Suppresses delivery for heartbeat tasks with no actionable result.
    pub heartbeat_silent: bool,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            user_id: 0,
            prompt: None,
            command: None,
            source_type: SourceType::Cli,
            source_ref: None,
            conversation_token: None,
            attachments: Vec::new(),
            output_target: OutputTarget::None,
            priority: 0,
            scheduled_job_id: None,
            heartbeat_silent: false,
        }
    }
}

/// A recurring work definition synchronized from a user's cron file (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Row identity.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Unique (per user) job name.
    pub name: String,
    /// Standard 5-field cron expression.
    pub cron: String,
    /// Free-form prompt. Mutually exclusive with `command`.
    pub prompt: Option<String>,
    /// Shell command. Mutually exclusive with `prompt`.
    pub command: Option<String>,
    /// Delivery target for the resulting task.
    pub target: OutputTarget,
    /// Room/conversation the job operates in, if any.
    pub conversation_token: Option<String>,
    /// Whether the job is currently active.
    pub enabled: bool,
    /// Last time this job fired.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Consecutive failures since the last success.
    pub consecutive_failures: i64,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// Last time this job completed successfully.
    pub last_success_at: Option<DateTime<Utc>>,
    /// If true, delete this job after its first successful run.
    pub once: bool,
    /// Suppress delivery unless the run recorded at least one action.
    pub silent_unless_action: bool,
}

/// A named external artifact a user has granted to the system (spec 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResource {
    /// Row identity.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Resource kind (e.g. "calendar", "folder", "reminders").
    pub resource_type: String,
    /// Display name.
    pub name: String,
    /// Filesystem path or URL.
    pub path_or_url: String,
    /// Permission string (e.g. "read", "read_write").
    pub permissions: String,
    /// Arbitrary key-value extras (mount options, credentials refs, etc.).
    pub extras: serde_json::Value,
}

/// One turn of stored conversation history (spec 3, 4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    /// The task that produced this turn.
    pub task_id: i64,
    /// Owning user.
    pub user_id: i64,
    /// The original prompt text.
    pub prompt: String,
    /// The task's result text.
    pub result: String,
    /// When the turn was recorded.
    pub timestamp: DateTime<Utc>,
    /// Tool-use descriptions recorded for this turn.
    pub actions_taken: Vec<ActionTaken>,
}
