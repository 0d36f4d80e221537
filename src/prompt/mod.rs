//! The prompt assembler: builds the final prompt string and environment
//! map handed to the executor (spec 4.3).

mod env;
mod skill;

pub use env::assemble_environment;
pub use skill::{
    fingerprint_skills, load_skills, select_skills, SelectionContext, Skill, SkillLoadError,
};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::RwLock;

use crate::config::PromptConfig;
use crate::context::{format_context_block, ContextSelector, Triage};
use crate::credentials::Credentials;
use crate::memory::MemoryQuery;
use crate::store::{Store, StoreError};
use crate::types::{ConversationEntry, Task};

const SKILL_FINGERPRINT_NAMESPACE: &str = "skills";
const SKILL_FINGERPRINT_KEY: &str = "fingerprint";

/// The output of [`PromptAssembler::assemble`].
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    /// The final prompt text, written to the child's stdin.
    pub text: String,
    /// The environment variable map for the child process.
    pub env: HashMap<String, String>,
}

/// Errors from prompt assembly.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// The store returned an error while loading resources, memory state,
    /// or conversation history.
    #[error("store error during prompt assembly: {0}")]
    Store(#[from] StoreError),
}

/// Extra per-task context the caller supplies to [`PromptAssembler::assemble`].
pub struct AssembleContext<'a> {
    /// Whether the task's user is an administrator.
    pub is_admin: bool,
    /// The bot's display name, substituted into persona placeholders.
    pub bot_name: &'a str,
    /// The bot's home directory, substituted into persona placeholders.
    pub bot_dir: &'a Path,
    /// The user's IANA timezone, for the header's current datetime.
    pub user_timezone: Tz,
    /// Per-user deferred-write directory, injected as `DEFERRED_DIR`.
    pub deferred_dir: &'a Path,
    /// Reply-to parent task id, if the triggering message was a reply.
    pub reply_to_task_id: Option<i64>,
    /// Attachment file extensions, lowercase, no leading dot.
    pub attachment_extensions: HashSet<String>,
    /// Data-store path, shown in the header for admin users only.
    pub data_store_path: Option<&'a Path>,
}

/// Assembles prompts and environments for the executor (spec 4.3).
pub struct PromptAssembler {
    store: Store,
    config: PromptConfig,
    credentials: Credentials,
    skills: Arc<RwLock<Vec<Skill>>>,
    memory: Arc<dyn MemoryQuery>,
    context: ContextSelector,
}

impl PromptAssembler {
    /// Build a new assembler, loading skills once from `config.skills_dir`.
    pub fn new(
        store: Store,
        config: PromptConfig,
        context_config: crate::config::ContextConfig,
        credentials: Credentials,
        memory: Arc<dyn MemoryQuery>,
    ) -> Self {
        let skills = load_skills(&config.skills_dir).unwrap_or_default();
        let context = ContextSelector::new(store.clone(), context_config);
        Self {
            store,
            config,
            credentials,
            skills: Arc::new(RwLock::new(skills)),
            memory,
            context,
        }
    }

    /// Reload skills from disk, replacing the cached set. Called by the
    /// skills-directory watcher on filesystem change events.
    pub async fn reload_skills(&self) {
        match load_skills(&self.config.skills_dir) {
            Ok(skills) => {
                *self.skills.write().await = skills;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to reload skills directory");
            }
        }
    }

    /// Assemble the full prompt and environment for one task.
    ///
    /// # Errors
    ///
    /// Returns a [`PromptError`] if a required store read fails.
    pub async fn assemble(
        &self,
        task: &Task,
        ctx: &AssembleContext<'_>,
        triage: &dyn Triage,
    ) -> Result<AssembledPrompt, PromptError> {
        let resources = self.store.list_resources(task.user_id, None).await?;
        let user_resource_types: HashSet<String> =
            resources.iter().map(|r| r.resource_type.clone()).collect();

        let prompt_text = task.prompt.clone().unwrap_or_default();

        let skills_guard = self.skills.read().await;
        let selection_ctx = SelectionContext {
            prompt_text: &prompt_text,
            source_type: task.source_type,
            user_resource_types: &user_resource_types,
            attachment_extensions: &ctx.attachment_extensions,
            is_admin: ctx.is_admin,
        };
        let selected = select_skills(&skills_guard, &selection_ctx);
        let fingerprint = fingerprint_skills(&selected);

        let previous_fingerprint = self
            .store
            .kv_get(task.user_id, SKILL_FINGERPRINT_NAMESPACE, SKILL_FINGERPRINT_KEY)
            .await?;
        let changelog = if task.source_type.is_interactive()
            && previous_fingerprint.as_deref() != Some(fingerprint.as_str())
        {
            self.store
                .kv_set(
                    task.user_id,
                    SKILL_FINGERPRINT_NAMESPACE,
                    SKILL_FINGERPRINT_KEY,
                    &fingerprint,
                )
                .await?;
            Some(render_skills_changelog(&selected))
        } else {
            None
        };

        let is_briefing = task.source_type.is_briefing();
        let is_interactive = task.source_type.is_interactive();

        let mut sections = Vec::new();
        sections.push(self.header_section(task, ctx));
        sections.push(self.emissaries_section());
        sections.push(self.persona_section(task.user_id, ctx));

        if !is_briefing {
            sections.push(render_resources_section(&resources, is_briefing));
            sections.push(self.user_memory_section(task.user_id));
        }
        if !is_briefing {
            if let Some(token) = &task.conversation_token {
                sections.push(self.channel_memory_section(task.user_id, token));
            }
        }
        if !is_briefing {
            sections.push(self.dated_memories_section(task.user_id));
        }
        if !is_briefing {
            let recalled = self
                .memory
                .query(
                    task.user_id,
                    task.conversation_token.as_deref(),
                    &prompt_text,
                    self.config.recalled_memory_limit,
                )
                .await;
            sections.push(render_recalled_memories(&recalled));
        }

        sections.push(render_tools_section());
        sections.push(render_rules_section());

        if is_interactive {
            if let Some(token) = &task.conversation_token {
                let entries = self
                    .context
                    .select(token, &prompt_text, ctx.reply_to_task_id, triage)
                    .await;
                sections.push(format_context_block(&entries));
            }
        }

        sections.push(render_request_section(task));
        sections.push(render_guidelines_section(task));

        let mut skills_section = String::new();
        if let Some(changelog) = changelog {
            skills_section.push_str(&changelog);
            skills_section.push('\n');
        }
        for skill in &selected {
            skills_section.push_str(&format!("### {}\n\n{}\n\n", skill.manifest.dir_name, skill.doc));
        }
        sections.push(skills_section);

        let text = sections.into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join("\n\n");

        let declared_vars: Vec<String> = selected
            .iter()
            .flat_map(|s| s.manifest.env.iter().cloned())
            .collect();
        let strip_sensitive = matches!(task.source_type, crate::types::SourceType::Heartbeat) || task.is_command();
        let env = assemble_environment(
            self.config.restricted_env,
            &declared_vars,
            &self.credentials,
            strip_sensitive,
            ctx.deferred_dir,
        );

        Ok(AssembledPrompt { text, env })
    }

    fn header_section(&self, task: &Task, ctx: &AssembleContext<'_>) -> String {
        let now = Utc::now().with_timezone(&ctx.user_timezone);
        let mut header = format!(
            "## Header\nuser_id: {}\ndatetime: {}\ntask_id: {}\nconversation_token: {}\nsource_type: {}\noutput_target: {}",
            task.user_id,
            now.to_rfc3339(),
            task.id,
            task.conversation_token.as_deref().unwrap_or("none"),
            task.source_type.as_str(),
            task.output_target.as_str(),
        );
        if ctx.is_admin {
            if let Some(path) = ctx.data_store_path {
                header.push_str(&format!("\ndata_store_path: {}", path.display()));
            }
        }
        header
    }

    fn emissaries_section(&self) -> String {
        std::fs::read_to_string(&self.config.emissaries_path)
            .map(|text| format!("## Emissaries\n\n{text}"))
            .unwrap_or_default()
    }

    fn persona_section(&self, user_id: i64, ctx: &AssembleContext<'_>) -> String {
        let per_user = self.config.personas_dir.join(format!("{user_id}.md"));
        let fallback = self.config.personas_dir.join("default.md");
        let raw = std::fs::read_to_string(&per_user)
            .or_else(|_| std::fs::read_to_string(&fallback))
            .unwrap_or_default();
        let substituted = raw
            .replace("{BOT_NAME}", ctx.bot_name)
            .replace("{BOT_DIR}", &ctx.bot_dir.display().to_string());
        if substituted.is_empty() {
            String::new()
        } else {
            format!("## Persona\n\n{substituted}")
        }
    }

    fn user_memory_section(&self, user_id: i64) -> String {
        let path = self.config.memory_dir.join(user_id.to_string()).join("USER.md");
        std::fs::read_to_string(path)
            .map(|text| format!("## User memory\n\n{text}"))
            .unwrap_or_default()
    }

    fn channel_memory_section(&self, user_id: i64, token: &str) -> String {
        let path = self
            .config
            .memory_dir
            .join(user_id.to_string())
            .join("channels")
            .join(format!("{token}.md"));
        std::fs::read_to_string(path)
            .map(|text| format!("## Channel memory\n\n{text}"))
            .unwrap_or_default()
    }

    fn dated_memories_section(&self, user_id: i64) -> String {
        let dated_dir = self.config.memory_dir.join(user_id.to_string()).join("dated");
        let Ok(entries) = std::fs::read_dir(&dated_dir) else {
            return String::new();
        };
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(self.config.dated_memory_days);
        let mut blocks = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(date) = chrono::NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
                continue;
            };
            if date < cutoff {
                continue;
            }
            if let Ok(text) = std::fs::read_to_string(&path) {
                blocks.push(format!("### {stem}\n\n{text}"));
            }
        }
        if blocks.is_empty() {
            String::new()
        } else {
            format!("## Dated memories\n\n{}", blocks.join("\n\n"))
        }
    }
}

fn render_resources_section(resources: &[crate::types::UserResource], is_briefing: bool) -> String {
    if resources.is_empty() {
        return String::new();
    }
    let mut by_type: HashMap<&str, Vec<&crate::types::UserResource>> = HashMap::new();
    for r in resources {
        if is_briefing && r.resource_type == "reminders" {
            continue;
        }
        by_type.entry(r.resource_type.as_str()).or_default().push(r);
    }
    if by_type.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Resources\n\n");
    for (resource_type, items) in by_type {
        out.push_str(&format!("### {resource_type}\n"));
        for item in items {
            out.push_str(&format!("- {} ({})\n", item.name, item.path_or_url));
        }
    }
    out
}

fn render_recalled_memories(hits: &[crate::memory::MemoryHit]) -> String {
    if hits.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Recalled memories\n\n");
    for hit in hits {
        out.push_str(&format!("- ({}) {}\n", hit.source, hit.excerpt));
    }
    out
}

fn render_tools_section() -> String {
    "## Tools\n\nYou may read and write files under your workspace, query the data store \
     through the read-only path provided, and invoke any skill CLI documented below."
        .to_owned()
}

fn render_rules_section() -> String {
    "## Rules\n\nConfirm before taking an irreversible action. Prefer creating a subtask over \
     blocking on a long-running operation. Respond in the output format requested by the \
     channel's guidelines."
        .to_owned()
}

fn render_request_section(task: &Task) -> String {
    let mut out = format!("## Request\n\n{}", task.prompt.as_deref().unwrap_or(""));
    if !task.attachments.is_empty() {
        out.push_str("\n\nAttachments:\n");
        for path in &task.attachments {
            out.push_str(&format!("- {path}\n"));
        }
    }
    out
}

fn render_guidelines_section(task: &Task) -> String {
    match task.source_type {
        crate::types::SourceType::Email => {
            "## Guidelines\n\nFormat the reply as plain text suitable for an email body."
                .to_owned()
        }
        _ => "## Guidelines\n\nKeep responses concise and use the channel's native formatting."
            .to_owned(),
    }
}

fn render_skills_changelog(selected: &[&Skill]) -> String {
    let names: Vec<&str> = selected.iter().map(|s| s.manifest.dir_name.as_str()).collect();
    format!("## What's new\n\nAvailable skills for this request: {}", names.join(", "))
}

/// Spawn a filesystem watcher that reloads the skill cache whenever
/// `skills_dir` changes. The returned watcher must be kept alive by the
/// caller for the duration of the process.
///
/// # Errors
///
/// Returns a [`notify::Error`] if the watcher cannot be started.
pub fn watch_skills_dir(
    assembler: Arc<PromptAssembler>,
    skills_dir: PathBuf,
) -> notify::Result<notify::RecommendedWatcher> {
    use notify::{Event, RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;
    watcher.watch(&skills_dir, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            assembler.reload_skills().await;
        }
    });

    Ok(watcher)
}
