//! Operator entry point: parses the CLI surface, wires the engine from
//! config, and either runs the scheduler daemon or dispatches one
//! subcommand (spec 6).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use marshal::adapters::cli as cli_adapter;
use marshal::adapters::talk::{TalkAdapter, TalkSettings};
use marshal::config::{load_admins, load_config, RuntimePaths};
use marshal::credentials::load_credentials;
use marshal::deferred::DeferredProcessor;
use marshal::engine::{ConfigCapResolver, Engine, PassthroughTriage};
use marshal::executor::Executor;
use marshal::memory::KeywordMemoryIndex;
use marshal::pool::WorkerPool;
use marshal::prompt::PromptAssembler;
use marshal::scheduler::{BriefingSchedule, SchedulerLock, SchedulerLoop};
use marshal::store::{NewResource, Store};
use marshal::types::{SourceType, TaskStatus};

/// Exit code for a usage error (bad arguments).
const EXIT_USAGE: i32 = 2;
/// Exit code for a configuration error (bad config file, missing binary).
const EXIT_CONFIG: i32 = 3;
/// Exit code for a runtime failure (store/executor error at dispatch time).
const EXIT_RUNTIME: i32 = 1;

#[derive(Parser)]
#[command(name = "marshal", about = "Personal task engine: queue, worker pool, LLM executor")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a task, optionally executing it immediately.
    Task {
        /// The prompt text.
        text: String,
        /// Owning user id.
        #[arg(short = 'u', long)]
        user: i64,
        /// Conversation token to thread this into.
        #[arg(short = 't', long)]
        token: Option<String>,
        /// Execute immediately and print the result instead of just enqueuing.
        #[arg(short = 'x', long)]
        execute: bool,
        /// Print what would be enqueued without writing to the store.
        #[arg(long)]
        dry_run: bool,
        /// Override the source type (defaults to `cli`).
        #[arg(long, value_name = "TYPE", default_value = "cli")]
        source_type: String,
    },
    /// Run the scheduler daemon loop.
    Run {
        /// Run a single tick and exit instead of looping forever.
        #[arg(long)]
        once: bool,
    },
    /// Run the scheduler daemon (alias of `run` with daemon framing).
    Scheduler {
        /// Run in the foreground instead of daemonizing.
        #[arg(short = 'd', long)]
        daemon: bool,
        /// Verbose logging.
        #[arg(short = 'v', long)]
        verbose: bool,
        /// Stop after dispatching at most this many tasks (testing aid).
        #[arg(long)]
        max_tasks: Option<u32>,
    },
    /// List tasks.
    List {
        /// Filter by status.
        #[arg(short = 's', long)]
        status: Option<String>,
        /// Filter by user id.
        #[arg(short = 'u', long)]
        user: Option<i64>,
    },
    /// Show one task in full.
    Show {
        /// Task id.
        id: i64,
    },
    /// Manage user resources.
    Resource {
        #[command(subcommand)]
        action: ResourceCommand,
    },
    /// Manage users.
    User {
        #[command(subcommand)]
        action: UserCommand,
    },
    /// Read/write the per-user key-value store.
    Kv {
        #[command(subcommand)]
        action: KvCommand,
    },
}

#[derive(Subcommand)]
enum ResourceCommand {
    /// Register a resource.
    Add {
        #[arg(short = 'u', long)]
        user: i64,
        #[arg(long)]
        resource_type: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        path_or_url: String,
        #[arg(long, default_value = "rw")]
        permissions: String,
    },
    /// List a user's resources.
    List {
        #[arg(short = 'u', long)]
        user: i64,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    /// List configured admins.
    List,
    /// Check whether a user is an admin.
    Lookup {
        user: i64,
    },
    /// Create a user's memory directory skeleton.
    Init {
        user: i64,
    },
    /// Print a user's memory directory layout.
    Status {
        user: i64,
    },
}

#[derive(Subcommand)]
enum KvCommand {
    Get { #[arg(short = 'u', long)] user: i64, namespace: String, key: String },
    Set { #[arg(short = 'u', long)] user: i64, namespace: String, key: String, value: String },
    List { #[arg(short = 'u', long)] user: i64, namespace: String },
    Delete { #[arg(short = 'u', long)] user: i64, namespace: String, key: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            if err.downcast_ref::<UsageError>().is_some() {
                EXIT_USAGE
            } else if err.downcast_ref::<ConfigError>().is_some() {
                EXIT_CONFIG
            } else {
                EXIT_RUNTIME
            }
        }
    };
    std::process::exit(code);
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ConfigError(String);

async fn run(cli: Cli) -> Result<()> {
    let is_daemon = matches!(cli.command, Command::Run { .. } | Command::Scheduler { .. });
    let config = load_config(&cli.config).map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;
    let paths = RuntimePaths::resolve(
        cli.config.parent().map_or_else(|| PathBuf::from("."), std::path::Path::to_path_buf),
        &config.namespace,
    );

    let _guard = if is_daemon {
        Some(marshal::logging::init_daemon(&paths.root.join("logs"))?)
    } else {
        marshal::logging::init_cli();
        None
    };

    let admins = load_admins(&paths.admins_file).map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;
    let credentials = load_credentials(&paths.root.join(".env")).map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;
    let store = Store::connect(&paths.db_path).await.context("opening store")?;

    let memory = Arc::new(KeywordMemoryIndex::new(config.prompt.memory_dir.clone()));
    let prompt = PromptAssembler::new(
        store.clone(),
        config.prompt.clone(),
        config.context.clone(),
        credentials,
        memory,
    );
    let executor = Executor::new(config.executor.clone());
    let deferred = DeferredProcessor::new(store.clone());

    let talk = match &config.channels.talk {
        Some(talk_config) => {
            let token = std::env::var(&talk_config.bot_token_env)
                .with_context(|| format!("{} not set", talk_config.bot_token_env))?;
            Some(Arc::new(TalkAdapter::new(
                &token,
                store.clone(),
                TalkSettings { allowed_users: talk_config.allowed_users.clone() },
            )))
        }
        None => None,
    };

    let engine = Arc::new(Engine::new(
        store.clone(),
        config.clone(),
        paths.clone(),
        admins.clone(),
        prompt,
        executor,
        deferred,
        Arc::new(PassthroughTriage),
        talk.clone(),
    ));

    match cli.command {
        Command::Task { text, user, token, execute, dry_run, source_type } => {
            let source = SourceType::parse(&source_type)
                .ok_or_else(|| anyhow::Error::new(UsageError(format!("unknown source type '{source_type}'"))))?;
            if dry_run {
                println!("would enqueue: user={user} source_type={source_type} text={text:?} token={token:?}");
                return Ok(());
            }
            let id = cli_adapter::enqueue(&store, user, text, token, source).await?;
            if execute {
                let task = engine.run_task_by_id(id).await?;
                if task.status == TaskStatus::Failed {
                    println!("task {id} failed: {}", task.last_error.as_deref().unwrap_or("unknown error"));
                } else {
                    println!("{}", task.result.as_deref().unwrap_or(""));
                }
            } else {
                println!("enqueued task {id}");
            }
        }
        Command::Run { once } => {
            run_scheduler(engine, store.clone(), config.clone(), talk, once).await?;
        }
        Command::Scheduler { daemon: _, verbose: _, max_tasks: _ } => {
            run_scheduler(engine, store.clone(), config.clone(), talk, false).await?;
        }
        Command::List { status, user } => {
            let status = status
                .map(|s| TaskStatus::parse(&s).ok_or_else(|| anyhow::Error::new(UsageError(format!("unknown status '{s}'")))))
                .transpose()?;
            cli_adapter::list(&store, status, user).await?;
        }
        Command::Show { id } => cli_adapter::show(&store, id).await?,
        Command::Resource { action } => match action {
            ResourceCommand::Add { user, resource_type, name, path_or_url, permissions } => {
                let id = cli_adapter::resource_add(
                    &store,
                    NewResource {
                        user_id: user,
                        resource_type,
                        name,
                        path_or_url,
                        permissions,
                        extras: serde_json::Value::Null,
                    },
                )
                .await?;
                println!("registered resource {id}");
            }
            ResourceCommand::List { user } => cli_adapter::resource_list(&store, user).await?,
        },
        Command::User { action } => match action {
            UserCommand::List => cli_adapter::user::list(&admins),
            UserCommand::Lookup { user } => cli_adapter::user::lookup(&admins, user),
            UserCommand::Init { user } => cli_adapter::user::init(&config.prompt.memory_dir, user)?,
            UserCommand::Status { user } => cli_adapter::user::status(&config.prompt.memory_dir, &admins, user)?,
        },
        Command::Kv { action } => match action {
            KvCommand::Get { user, namespace, key } => cli_adapter::kv::get(&store, user, &namespace, &key).await?,
            KvCommand::Set { user, namespace, key, value } => {
                cli_adapter::kv::set(&store, user, &namespace, &key, &value).await?;
            }
            KvCommand::List { user, namespace } => cli_adapter::kv::list(&store, user, &namespace).await?,
            KvCommand::Delete { user, namespace, key } => {
                cli_adapter::kv::delete(&store, user, &namespace, &key).await?;
            }
        },
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

async fn run_scheduler(
    engine: Arc<Engine>,
    store: Store,
    config: marshal::config::EngineConfig,
    talk: Option<Arc<TalkAdapter>>,
    once: bool,
) -> Result<()> {
    let lock_path = std::env::temp_dir().join(format!("{}-scheduler-daemon.lock", config.namespace));
    let _lock = SchedulerLock::acquire(&lock_path).context("another scheduler instance is already running")?;

    if let Some(talk) = talk {
        tokio::spawn(talk.run());
    }

    let pool = Arc::new(WorkerPool::new(store.clone(), config.pool.clone(), engine.claim_limits()));
    let caps: Arc<dyn marshal::pool::UserCapResolver> = Arc::new(ConfigCapResolver::new(config.users.clone()));

    let briefings: Vec<BriefingSchedule> = config
        .users
        .iter()
        .filter_map(|(&user_id, override_)| {
            let briefing = override_.briefing.as_ref()?;
            let Ok(timezone) = briefing.timezone.parse::<chrono_tz::Tz>() else {
                tracing::warn!(user_id, timezone = %briefing.timezone, "invalid briefing timezone, skipping");
                return None;
            };
            Some(BriefingSchedule {
                user_id,
                cron: briefing.cron.clone(),
                timezone,
                target: briefing.target,
            })
        })
        .collect();
    let heartbeats = Vec::new();
    let pollers = Vec::new();

    let scheduler = SchedulerLoop::new(
        store,
        pool,
        config.scheduler.clone(),
        briefings,
        heartbeats,
        pollers,
        config.scheduler.consecutive_failure_threshold,
        config.store.confirmation_timeout_minutes,
        config.store.stale_pending_fail_hours,
        config.store.task_retention_days,
    );

    let runner: Arc<dyn marshal::pool::TaskRunner> = engine;
    if once {
        scheduler.tick(runner, caps.as_ref()).await;
    } else {
        scheduler.run_forever(runner, caps).await;
    }
    Ok(())
}
