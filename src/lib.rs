//! A single-binary personal task engine: receives requests from chat,
//! email, shared files, cron, and an operator CLI; runs each one through
//! an LLM-backed executor under a two-tier worker pool; and delivers the
//! result back to its origin channel.
//!
//! [`engine::Engine`] is the orchestration root. `main.rs` wires it from
//! [`config::EngineConfig`] and drives it from either the scheduler loop
//! (daemon mode) or a one-shot CLI subcommand.

pub mod adapters;
pub mod config;
pub mod context;
pub mod credentials;
pub mod deferred;
pub mod engine;
pub mod executor;
pub mod logging;
pub mod memory;
pub mod pool;
pub mod prompt;
pub mod scheduler;
pub mod store;
pub mod types;
