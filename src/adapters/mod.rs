//! Channel adapter traits (spec 4, 6): the boundary between an inbound
//! transport (chat room, email, shared file, operator CLI) and the task
//! store, and between a completed task and outbound delivery.
//!
//! The pool and executor never know which adapter produced a task or will
//! deliver its result; they only see [`crate::types::Task`]. Concrete
//! transports live one level below this module: [`talk`] is the reference
//! chat-room implementation, [`cli`] is the operator surface used by
//! `main.rs`.

pub mod cli;
pub mod talk;

use async_trait::async_trait;

use crate::types::{NewTask, Task};

/// Turns an inbound channel message into a stored task (spec 4.1 CreateTask
/// callers: Talk, email, tasks-file ingestion).
#[async_trait]
pub trait CreateTaskFromMessage: Send + Sync {
    /// Build and submit a [`NewTask`] for one inbound message.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter cannot construct a valid task (e.g.
    /// an unresolvable sender identity) or the store rejects it.
    async fn create_task(&self, raw: InboundMessage) -> anyhow::Result<i64>;
}

/// A channel-agnostic inbound message, already stripped of transport framing.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Resolved application user id.
    pub user_id: i64,
    /// Message text, already extracted from the transport's native shape.
    pub text: String,
    /// Opaque conversation/room/thread token.
    pub conversation_token: String,
    /// Paths of any attachments already downloaded to local disk.
    pub attachments: Vec<String>,
    /// Task id this message replies to, if the transport exposes reply threading.
    pub reply_to_task_id: Option<i64>,
}

impl InboundMessage {
    /// Build the [`NewTask`] this message maps to for the Talk channel
    /// (spec 3: `source_type = talk`, `output_target = talk`).
    pub fn into_new_task(self) -> NewTask {
        NewTask {
            user_id: self.user_id,
            prompt: Some(self.text),
            conversation_token: Some(self.conversation_token),
            attachments: self.attachments,
            source_type: crate::types::SourceType::Talk,
            output_target: crate::types::OutputTarget::Talk,
            ..NewTask::default()
        }
    }
}

/// Delivers a completed task's result back to its origin channel
/// (spec 4 delivery step, run after deferred post-processing).
#[async_trait]
pub trait DeliverResult: Send + Sync {
    /// Deliver `task`'s successful result.
    async fn deliver_result(&self, task: &Task);
}

/// Delivers a failure notice for a task that exhausted its retries
/// (spec 4.1 RetryOrFail terminal path).
#[async_trait]
pub trait DeliverFailure: Send + Sync {
    /// Deliver `task`'s failure notice.
    async fn deliver_failure(&self, task: &Task);
}
