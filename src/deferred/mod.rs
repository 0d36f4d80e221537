//! Deferred-write post-processing (spec 4.6).
//!
//! The child process runs inside a read-only-store sandbox, so it cannot
//! write to the data store directly. Instead it drops JSON files into its
//! `DEFERRED_DIR`; after the executor reports success, this module scans
//! for files matching the completed task's id and applies each exactly
//! once, deleting it afterward.

use std::path::Path;

use serde::Deserialize;

use crate::store::{NewResource, Store, StoreError};
use crate::types::{NewTask, OutputTarget, SourceType};

/// A subtask request written by the child (spec 6:
/// `task_{id}_subtasks.json`).
#[derive(Debug, Deserialize)]
struct SubtaskRequest {
    user_id: i64,
    prompt: String,
}

/// A structured email reply payload (spec 6: `task_{id}_email_output.json`).
#[derive(Debug, Deserialize, serde::Serialize)]
pub struct EmailOutput {
    /// Email subject line.
    pub subject: String,
    /// Email body.
    pub body: String,
    /// Body format: `"plain"` or `"html"`.
    pub format: String,
}

/// Errors applying one deferred file; logged by the caller, never
/// propagated into task status (spec 4.6, 7).
#[derive(Debug, thiserror::Error)]
pub enum DeferredError {
    /// The file could not be read.
    #[error("failed to read deferred file {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    /// The file's JSON did not match the expected shape.
    #[error("failed to parse deferred file {0}: {1}")]
    Parse(std::path::PathBuf, serde_json::Error),
    /// A non-admin task attempted to create subtasks.
    #[error("rejected deferred subtasks from non-admin task {0}")]
    NotAdmin(i64),
    /// The store rejected the write.
    #[error("store error applying deferred file: {0}")]
    Store(#[from] StoreError),

    /// A value failed to re-serialize before being persisted.
    #[error("serialization error applying deferred file: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Applies a completed task's deferred files (spec 4.6).
pub struct DeferredProcessor {
    store: Store,
}

impl DeferredProcessor {
    /// Build a processor over `store`.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Scan `deferred_dir` for every file belonging to `task_id` and apply
    /// it. Each failure is logged and skipped; the caller's task is never
    /// marked failed as a result (spec 4.6, 7).
    pub async fn apply_for_task(&self, task_id: i64, is_admin: bool, deferred_dir: &Path) {
        let kinds = ["subtasks", "tracked_transactions", "email_output"];
        for kind in kinds {
            let path = deferred_dir.join(format!("task_{task_id}_{kind}.json"));
            if !path.exists() {
                continue;
            }
            let result = match kind {
                "subtasks" => self.apply_subtasks(task_id, is_admin, &path).await,
                "tracked_transactions" => self.apply_tracked_transactions(task_id, &path).await,
                "email_output" => self.apply_email_output(task_id, &path).await,
                _ => unreachable!(),
            };
            match result {
                Ok(()) => {
                    if let Err(err) = std::fs::remove_file(&path) {
                        tracing::warn!(%err, path = %path.display(), "failed to remove applied deferred file");
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, path = %path.display(), "failed to apply deferred file");
                }
            }
        }
    }

    async fn apply_subtasks(
        &self,
        task_id: i64,
        is_admin: bool,
        path: &Path,
    ) -> Result<(), DeferredError> {
        if !is_admin {
            return Err(DeferredError::NotAdmin(task_id));
        }
        let raw = std::fs::read_to_string(path).map_err(|e| DeferredError::Read(path.to_path_buf(), e))?;
        let requests: Vec<SubtaskRequest> =
            serde_json::from_str(&raw).map_err(|e| DeferredError::Parse(path.to_path_buf(), e))?;

        for request in requests {
            self.store
                .create_task(NewTask {
                    user_id: request.user_id,
                    prompt: Some(request.prompt),
                    source_type: SourceType::Scheduled,
                    output_target: OutputTarget::None,
                    ..NewTask::default()
                })
                .await?;
        }
        Ok(())
    }

    async fn apply_tracked_transactions(&self, task_id: i64, path: &Path) -> Result<(), DeferredError> {
        let raw = std::fs::read_to_string(path).map_err(|e| DeferredError::Read(path.to_path_buf(), e))?;
        let records: Vec<serde_json::Value> =
            serde_json::from_str(&raw).map_err(|e| DeferredError::Parse(path.to_path_buf(), e))?;

        let task = self.store.get_task(task_id).await?;
        for (idx, record) in records.iter().enumerate() {
            let value = serde_json::to_string(record)?;
            self.store
                .kv_set(task.user_id, "tracked_transactions", &format!("{task_id}:{idx}"), &value)
                .await?;
        }
        Ok(())
    }

    async fn apply_email_output(&self, task_id: i64, path: &Path) -> Result<(), DeferredError> {
        let raw = std::fs::read_to_string(path).map_err(|e| DeferredError::Read(path.to_path_buf(), e))?;
        let output: EmailOutput =
            serde_json::from_str(&raw).map_err(|e| DeferredError::Parse(path.to_path_buf(), e))?;

        let task = self.store.get_task(task_id).await?;
        let value = serde_json::to_string(&output)?;
        self.store
            .kv_set(task.user_id, "email_output", &task_id.to_string(), &value)
            .await?;
        Ok(())
    }
}

/// Register a user resource from an operator CLI invocation (spec 6
/// `resource add`). Lives here rather than the CLI module since it shares
/// the store's resource accessor with deferred application paths.
pub async fn register_resource(store: &Store, resource: NewResource) -> Result<i64, StoreError> {
    store.upsert_resource(resource).await
}
