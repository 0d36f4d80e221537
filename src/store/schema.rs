//! Embedded schema creation for the task store (spec 3).
//!
//! No separate migrations directory: the engine owns a single SQLite file
//! and brings it to the current schema with idempotent `CREATE TABLE IF
//! NOT EXISTS` statements run once at startup.

use sqlx::SqlitePool;

use super::StoreError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id             INTEGER NOT NULL,
    prompt              TEXT,
    command             TEXT,
    source_type         TEXT NOT NULL,
    source_ref          TEXT,
    conversation_token  TEXT,
    attachments         TEXT NOT NULL DEFAULT '[]',
    output_target       TEXT NOT NULL DEFAULT 'none',
    status              TEXT NOT NULL DEFAULT 'pending',
    priority            INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT,
    attempt_count       INTEGER NOT NULL DEFAULT 0,
    last_error          TEXT,
    worker_pid          TEXT,
    cancel_requested    INTEGER NOT NULL DEFAULT 0,
    heartbeat_silent    INTEGER NOT NULL DEFAULT 0,
    scheduled_job_id    INTEGER,
    actions_taken       TEXT NOT NULL DEFAULT '[]',
    not_before          TEXT,
    result              TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim
    ON tasks (status, source_type, user_id, priority DESC, created_at ASC);

CREATE INDEX IF NOT EXISTS idx_tasks_conversation
    ON tasks (conversation_token, status);

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id              INTEGER NOT NULL,
    name                 TEXT NOT NULL,
    cron                 TEXT NOT NULL,
    prompt               TEXT,
    command              TEXT,
    target               TEXT NOT NULL DEFAULT 'none',
    conversation_token   TEXT,
    enabled              INTEGER NOT NULL DEFAULT 1,
    last_run_at          TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_error           TEXT,
    last_success_at      TEXT,
    once                 INTEGER NOT NULL DEFAULT 0,
    silent_unless_action INTEGER NOT NULL DEFAULT 0,
    UNIQUE(user_id, name)
);

CREATE TABLE IF NOT EXISTS user_resources (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       INTEGER NOT NULL,
    resource_type TEXT NOT NULL,
    name          TEXT NOT NULL,
    path_or_url   TEXT NOT NULL,
    permissions   TEXT NOT NULL DEFAULT 'read',
    extras        TEXT NOT NULL DEFAULT '{}',
    UNIQUE(user_id, resource_type, name)
);

CREATE TABLE IF NOT EXISTS conversation_entries (
    task_id        INTEGER PRIMARY KEY,
    user_id        INTEGER NOT NULL,
    conversation_token TEXT NOT NULL,
    prompt         TEXT NOT NULL,
    result         TEXT NOT NULL,
    timestamp      TEXT NOT NULL,
    actions_taken  TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_conversation_entries_token
    ON conversation_entries (conversation_token, timestamp);

CREATE TABLE IF NOT EXISTS kv_store (
    user_id    INTEGER NOT NULL,
    namespace  TEXT NOT NULL,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    PRIMARY KEY (user_id, namespace, key)
);

CREATE TABLE IF NOT EXISTS tasks_file_seen (
    content_hash TEXT PRIMARY KEY,
    task_id      INTEGER NOT NULL,
    seen_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS email_seen (
    message_id TEXT PRIMARY KEY,
    task_id    INTEGER NOT NULL,
    seen_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS heartbeat_checks (
    name              TEXT PRIMARY KEY,
    user_id           INTEGER NOT NULL,
    last_check_at     TEXT,
    last_alert_at     TEXT,
    consecutive_errors INTEGER NOT NULL DEFAULT 0
);
"#;

/// Create every table and index the store needs, if not already present.
///
/// # Errors
///
/// Returns a [`StoreError`] if any statement fails.
pub async fn init(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(StoreError::from)?;
    Ok(())
}
