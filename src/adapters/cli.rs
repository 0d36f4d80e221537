//! CLI adapter: the operator-facing surface (spec 6), backing `main.rs`'s
//! clap subcommands. Argument parsing lives in `main.rs`; this module holds
//! the store-facing logic and human-readable rendering so the binary entry
//! point stays a thin dispatcher.

use std::path::Path;

use async_trait::async_trait;

use crate::config::AdminSet;
use crate::store::{NewResource, Store};
use crate::types::{NewTask, OutputTarget, SourceType, Task, TaskStatus};

use super::{CreateTaskFromMessage, DeliverFailure, DeliverResult, InboundMessage};

/// Enqueues a task from an operator's `task "<text>"` invocation
/// (spec 6 CLI surface).
pub struct CliAdapter {
    store: Store,
}

impl CliAdapter {
    /// Build a new adapter over `store`.
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CreateTaskFromMessage for CliAdapter {
    async fn create_task(&self, raw: InboundMessage) -> anyhow::Result<i64> {
        let mut task = raw.into_new_task();
        task.source_type = SourceType::Cli;
        task.output_target = OutputTarget::None;
        let id = self.store.create_task(task).await?;
        Ok(id)
    }
}

#[async_trait]
impl DeliverResult for CliAdapter {
    async fn deliver_result(&self, task: &Task) {
        println!("{}", task.result.as_deref().unwrap_or(""));
    }
}

#[async_trait]
impl DeliverFailure for CliAdapter {
    async fn deliver_failure(&self, task: &Task) {
        eprintln!("task {} failed: {}", task.id, task.last_error.as_deref().unwrap_or("unknown error"));
    }
}

/// `task "<text>" -u USER [-t TOKEN] [--source-type TYPE]`: enqueue a task
/// and return its id.
///
/// # Errors
///
/// Returns an error if the store rejects the insert.
pub async fn enqueue(
    store: &Store,
    user_id: i64,
    text: String,
    conversation_token: Option<String>,
    source_type: SourceType,
) -> anyhow::Result<i64> {
    let id = store
        .create_task(NewTask {
            user_id,
            prompt: Some(text),
            conversation_token,
            source_type,
            output_target: OutputTarget::None,
            ..NewTask::default()
        })
        .await?;
    Ok(id)
}

/// `list [-s STATUS] [-u USER]`: print queue introspection.
///
/// # Errors
///
/// Returns an error if the store query fails.
pub async fn list(store: &Store, status: Option<TaskStatus>, user_id: Option<i64>) -> anyhow::Result<()> {
    let tasks = store.list_tasks(status, user_id).await?;
    if tasks.is_empty() {
        println!("no matching tasks");
        return Ok(());
    }
    for task in tasks {
        println!(
            "{:>6}  {:<10}  user={:<8}  {:<9}  {}",
            task.id,
            task.status.as_str(),
            task.user_id,
            task.source_type.as_str(),
            task.prompt.as_deref().unwrap_or(task.command.as_deref().unwrap_or("")),
        );
    }
    Ok(())
}

/// `show <id>`: print one task in full.
///
/// # Errors
///
/// Returns [`crate::store::StoreError::NotFound`] if no such task exists.
pub async fn show(store: &Store, id: i64) -> anyhow::Result<()> {
    let task = store.get_task(id).await?;
    println!("id:                 {}", task.id);
    println!("user_id:            {}", task.user_id);
    println!("status:             {}", task.status.as_str());
    println!("source_type:        {}", task.source_type.as_str());
    println!("output_target:      {}", task.output_target.as_str());
    println!("conversation_token: {}", task.conversation_token.as_deref().unwrap_or("-"));
    println!("attempt_count:      {}", task.attempt_count);
    println!("created_at:         {}", task.created_at);
    println!("started_at:         {:?}", task.started_at);
    println!("completed_at:       {:?}", task.completed_at);
    println!("last_error:         {}", task.last_error.as_deref().unwrap_or("-"));
    if let Some(prompt) = &task.prompt {
        println!("prompt:\n{prompt}");
    }
    if let Some(result) = &task.result {
        println!("result:\n{result}");
    }
    Ok(())
}

/// `resource add`: register a user resource.
///
/// # Errors
///
/// Returns an error if the store rejects the insert.
pub async fn resource_add(store: &Store, resource: NewResource) -> anyhow::Result<i64> {
    Ok(store.upsert_resource(resource).await?)
}

/// `resource list`: print a user's registered resources.
///
/// # Errors
///
/// Returns an error if the store query fails.
pub async fn resource_list(store: &Store, user_id: i64) -> anyhow::Result<()> {
    let resources = store.list_resources(user_id, None).await?;
    if resources.is_empty() {
        println!("no resources for user {user_id}");
        return Ok(());
    }
    for r in resources {
        println!("{:<12} {:<20} {} ({})", r.resource_type, r.name, r.path_or_url, r.permissions);
    }
    Ok(())
}

/// `kv get|set|list|delete`.
pub mod kv {
    use super::Store;

    /// `kv get`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn get(store: &Store, user_id: i64, namespace: &str, key: &str) -> anyhow::Result<()> {
        match store.kv_get(user_id, namespace, key).await? {
            Some(value) => println!("{value}"),
            None => println!("(not set)"),
        }
        Ok(())
    }

    /// `kv set`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store statement fails.
    pub async fn set(store: &Store, user_id: i64, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
        store.kv_set(user_id, namespace, key, value).await?;
        Ok(())
    }

    /// `kv list`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn list(store: &Store, user_id: i64, namespace: &str) -> anyhow::Result<()> {
        let pairs = store.kv_list(user_id, namespace).await?;
        for (key, value) in pairs {
            println!("{key} = {value}");
        }
        Ok(())
    }

    /// `kv delete`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store statement fails.
    pub async fn delete(store: &Store, user_id: i64, namespace: &str, key: &str) -> anyhow::Result<()> {
        store.kv_delete(user_id, namespace, key).await?;
        Ok(())
    }
}

/// `user list|lookup|init|status` (spec 6, operator surface over the admins
/// file and per-user filesystem layout).
pub mod user {
    use super::{AdminSet, Path};

    /// `user list`: print every id in the admins file, or a note when every
    /// user is implicitly an admin.
    pub fn list(admins: &AdminSet) {
        match admins {
            AdminSet::All => println!("(admins file empty: every user is an admin)"),
            AdminSet::NoneConfigured => println!("(no admins file configured)"),
            AdminSet::Ids(ids) => {
                let mut ids: Vec<_> = ids.iter().collect();
                ids.sort_unstable();
                for id in ids {
                    println!("{id}");
                }
            }
        }
    }

    /// `user lookup`: print whether a given user id is an admin.
    pub fn lookup(admins: &AdminSet, user_id: i64) {
        println!("admin: {}", admins.is_admin(user_id));
    }

    /// `user init`: create a user's persona/memory directory skeleton.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn init(memory_dir: &Path, user_id: i64) -> anyhow::Result<()> {
        let root = memory_dir.join(user_id.to_string());
        std::fs::create_dir_all(root.join("channels"))?;
        std::fs::create_dir_all(root.join("dated"))?;
        let user_md = root.join("USER.md");
        if !user_md.exists() {
            std::fs::write(&user_md, "")?;
        }
        println!("initialized user directory at {}", root.display());
        Ok(())
    }

    /// `user status`: print a user's memory directory layout and admin flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn status(memory_dir: &Path, admins: &AdminSet, user_id: i64) -> anyhow::Result<()> {
        let root = memory_dir.join(user_id.to_string());
        println!("user_id: {user_id}");
        println!("admin:   {}", admins.is_admin(user_id));
        println!("memory dir exists: {}", root.exists());
        if root.exists() {
            let dated = root.join("dated");
            let count = std::fs::read_dir(&dated).map(|d| d.count()).unwrap_or(0);
            println!("dated memory files: {count}");
        }
        Ok(())
    }
}
