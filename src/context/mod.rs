//! Hybrid recent + LLM-triage conversation context selection (spec 4.7).

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::ContextConfig;
use crate::store::Store;
use crate::types::ConversationEntry;

/// A fast auxiliary LLM call that triages older conversation entries,
/// returning the task ids it judges relevant to the current request.
#[async_trait]
pub trait Triage: Send + Sync {
    /// Return relevant task ids from `candidates`, or `None` on parse
    /// failure — the caller interprets `None` as "use the timeout fallback".
    async fn triage(&self, candidates: &[ConversationEntry], task_prompt: &str) -> Option<Vec<i64>>;
}

/// Selects conversation history for one task (spec 4.7).
pub struct ContextSelector {
    store: Store,
    config: ContextConfig,
}

impl ContextSelector {
    /// Build a selector over `store` with the given tunables.
    pub fn new(store: Store, config: ContextConfig) -> Self {
        Self { store, config }
    }

    /// Select the conversation entries to include for `conversation_token`,
    /// given the current task's prompt text and an optional reply-to
    /// parent task id that must always be included.
    ///
    /// Never returns an error that should block task processing: a
    /// store failure here degrades to an empty context rather than
    /// failing the whole task, since context is an enrichment, not a
    /// correctness requirement.
    pub async fn select(
        &self,
        conversation_token: &str,
        task_prompt: &str,
        reply_to_task_id: Option<i64>,
        triage: &dyn Triage,
    ) -> Vec<ConversationEntry> {
        let entries = match self
            .store
            .recent_conversation(conversation_token, self.config.lookback_count)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(?err, conversation_token, "failed to load conversation history");
                return Vec::new();
            }
        };

        let skip_threshold = usize::try_from(self.config.skip_selection_threshold).unwrap_or(usize::MAX);
        if entries.len() <= skip_threshold {
            return entries;
        }

        let always_include_recent = usize::try_from(self.config.always_include_recent).unwrap_or(0);
        let split_at = entries.len().saturating_sub(always_include_recent);
        let (older, recent) = entries.split_at(split_at);

        let triaged = tokio::time::timeout(
            Duration::from_secs(self.config.triage_timeout_secs),
            triage.triage(older, task_prompt),
        )
        .await;

        let selected_ids: Option<Vec<i64>> = match triaged {
            Ok(Some(ids)) => Some(ids),
            Ok(None) | Err(_) => None,
        };

        let mut result: Vec<ConversationEntry> = match selected_ids {
            Some(ids) => {
                let id_set: std::collections::HashSet<i64> = ids.into_iter().collect();
                older
                    .iter()
                    .filter(|e| id_set.contains(&e.task_id))
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        };

        if let Some(parent_id) = reply_to_task_id {
            if !result.iter().any(|e| e.task_id == parent_id) {
                if let Some(parent) = older.iter().find(|e| e.task_id == parent_id) {
                    result.insert(0, parent.clone());
                }
            }
        }

        result.extend(recent.iter().cloned());
        result.sort_by_key(|e| e.timestamp);
        result
    }
}

/// Render a selected context into the prompt block inserted at §4.3
/// position 11.
pub fn format_context_block(entries: &[ConversationEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Conversation context\n\n");
    for entry in entries {
        out.push_str(&format!("**User** ({}): {}\n", entry.timestamp, entry.prompt));
        out.push_str(&format!("**Assistant**: {}\n\n", entry.result));
    }
    out
}
