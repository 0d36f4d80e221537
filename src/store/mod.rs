//! The task store: a durable queue of tasks, scheduled jobs, and the
//! auxiliary state the queue's liveness and idempotence laws depend on
//! (resources, conversation history, kv, dedup sets).
//!
//! A single SQLite database in WAL mode backs every table. Every worker
//! and poller opens its own connection through a shared pool; a busy
//! timeout absorbs write-lock contention instead of an in-process mutex.

mod claim;
mod cleanup;
mod conversation;
mod kv;
mod resource;
mod schema;
mod scheduled_job;
mod task;

pub use claim::{ClaimLimits, ClaimedTask};
pub use cleanup::CleanupReport;
pub use kv::HeartbeatCheckState;
pub use resource::NewResource;
pub use scheduled_job::CronFileEntry;
pub use task::StatusUpdate;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Errors surfaced by any store operation.
///
/// No store method panics or swallows a failure; every mutation either
/// succeeds or returns one of these variants.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying SQLite driver returned an error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A JSON column failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint the caller opted into was violated
    /// (e.g. a tasks-file content hash or email message id already seen).
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Handle to the engine's SQLite-backed store.
///
/// Cheap to clone: internally an [`SqlitePool`], which already pools
/// connections.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `path` and bring
    /// its schema up to date.
    ///
    /// WAL mode and a 30-second busy timeout are set per spec 5's
    /// shared-resource policy: atomic single-statement updates replace
    /// mutexes for task claiming, and lock contention is absorbed by the
    /// busy timeout rather than failing fast.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the database cannot be opened or the
    /// schema cannot be created.
    pub async fn connect(path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(sqlx::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        schema::init(&pool).await?;

        Ok(Self { pool })
    }

    /// Build a store around an already-open pool (used by tests against
    /// an in-memory database).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if schema creation fails.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        schema::init(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) async fn open_in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite connect");
        Self::from_pool(pool).await.expect("schema init")
    }
}
