//! Talk channel adapter: a teloxide-backed chat room transport (spec 6).
//!
//! Reference implementation of [`super::CreateTaskFromMessage`] and
//! [`super::DeliverResult`]/[`super::DeliverFailure`]. Demonstrates the
//! per-channel foreground gate (spec 4.2): a chat room with an in-flight
//! foreground task still gets its message enqueued, but also gets a
//! "still working" courtesy reply rather than silence until the first
//! task completes.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::warn;

use crate::store::Store;
use crate::types::Task;

use super::{DeliverFailure, DeliverResult, InboundMessage};

/// Talk channel configuration resolved from [`crate::config::TalkConfig`].
#[derive(Debug, Clone)]
pub struct TalkSettings {
    /// User ids allowed to interact with the bot.
    pub allowed_users: Vec<i64>,
}

/// The Talk adapter: owns the bot handle and the store it enqueues into.
pub struct TalkAdapter {
    bot: Bot,
    store: Store,
    settings: TalkSettings,
}

impl TalkAdapter {
    /// Build a new adapter from a bot token and channel settings.
    pub fn new(bot_token: &str, store: Store, settings: TalkSettings) -> Self {
        Self {
            bot: Bot::new(bot_token),
            store,
            settings,
        }
    }

    /// Run the inbound dispatch loop. Blocks until the process is signalled
    /// to stop (SIGINT).
    pub async fn run(self: Arc<Self>) {
        let handler = dptree::entry().branch(Update::filter_message().endpoint(
            |bot: Bot, msg: Message, adapter: Arc<TalkAdapter>| async move {
                adapter.handle_message(&bot, &msg).await;
                ResponseResult::Ok(())
            },
        ));

        Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![self.clone()])
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    }

    async fn handle_message(&self, bot: &Bot, msg: &Message) {
        let Some(from) = &msg.from else { return };
        let user_id = i64::try_from(from.id.0).unwrap_or(0);
        if !self.settings.allowed_users.contains(&user_id) {
            warn!(user_id, "talk message dropped: user not in allowed_users");
            return;
        }
        let Some(text) = msg.text() else { return };

        let conversation_token = msg.chat.id.0.to_string();
        let busy = self
            .store
            .has_active_foreground_for_channel(&conversation_token)
            .await
            .unwrap_or(false);

        let inbound = InboundMessage {
            user_id,
            text: text.to_owned(),
            conversation_token,
            attachments: Vec::new(),
            reply_to_task_id: None,
        };

        if let Err(err) = self.create_task(inbound).await {
            warn!(%err, user_id, "failed to enqueue talk task");
            let _ = bot.send_message(msg.chat.id, "Sorry, something went wrong queuing that.").await;
            return;
        }

        if busy {
            let _ = bot
                .send_message(msg.chat.id, "Still working on your last request, one moment.")
                .await;
        }
    }
}

#[async_trait]
impl super::CreateTaskFromMessage for TalkAdapter {
    async fn create_task(&self, raw: InboundMessage) -> anyhow::Result<i64> {
        let id = self.store.create_task(raw.into_new_task()).await?;
        Ok(id)
    }
}

#[async_trait]
impl DeliverResult for TalkAdapter {
    async fn deliver_result(&self, task: &Task) {
        if task.heartbeat_silent {
            return;
        }
        let Some(token) = &task.conversation_token else { return };
        let Ok(chat_id) = token.parse::<i64>() else { return };
        let text = task.result.as_deref().unwrap_or("(no result)");
        if let Err(err) = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await
        {
            warn!(%err, task_id = task.id, "failed to deliver talk result");
        }
    }
}

#[async_trait]
impl DeliverFailure for TalkAdapter {
    async fn deliver_failure(&self, task: &Task) {
        let Some(token) = &task.conversation_token else { return };
        let Ok(chat_id) = token.parse::<i64>() else { return };
        let text = format!(
            "That request failed after retrying: {}",
            task.last_error.as_deref().unwrap_or("unknown error")
        );
        if let Err(err) = self.bot.send_message(ChatId(chat_id), text).await {
            warn!(%err, task_id = task.id, "failed to deliver talk failure notice");
        }
    }
}
