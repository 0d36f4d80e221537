//! Integration tests for conversation context selection: below-threshold
//! short-circuit, triage-driven filtering, timeout fallback, forced
//! reply-to-parent inclusion, and final chronological ordering.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use marshal::config::ContextConfig;
use marshal::context::{ContextSelector, Triage};
use marshal::store::Store;
use marshal::types::ConversationEntry;

async fn file_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("context-test.db");
    let store = Store::connect(&path).await.expect("open store");
    (store, dir)
}

fn entry(task_id: i64, minute: i64, prompt: &str) -> ConversationEntry {
    ConversationEntry {
        task_id,
        user_id: 1,
        prompt: prompt.to_owned(),
        result: format!("result for {prompt}"),
        timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, minute as u32, 0).unwrap(),
        actions_taken: Vec::new(),
    }
}

async fn seed(store: &Store, entries: &[ConversationEntry]) {
    for e in entries {
        store.append_conversation_entry(e, "room-1").await.unwrap();
    }
}

struct FixedTriage(Vec<i64>);

#[async_trait]
impl Triage for FixedTriage {
    async fn triage(&self, _candidates: &[ConversationEntry], _task_prompt: &str) -> Option<Vec<i64>> {
        Some(self.0.clone())
    }
}

struct NeverRespondsTriage;

#[async_trait]
impl Triage for NeverRespondsTriage {
    async fn triage(&self, _candidates: &[ConversationEntry], _task_prompt: &str) -> Option<Vec<i64>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Some(Vec::new())
    }
}

struct ParseFailureTriage;

#[async_trait]
impl Triage for ParseFailureTriage {
    async fn triage(&self, _candidates: &[ConversationEntry], _task_prompt: &str) -> Option<Vec<i64>> {
        None
    }
}

#[tokio::test]
async fn below_threshold_returns_everything_without_calling_triage() {
    let (store, _dir) = file_store().await;
    seed(&store, &[entry(1, 0, "a"), entry(2, 1, "b")]).await;

    let config = ContextConfig { skip_selection_threshold: 5, ..ContextConfig::default() };
    let selector = ContextSelector::new(store, config);

    let result = selector.select("room-1", "current prompt", None, &ParseFailureTriage).await;
    assert_eq!(result.len(), 2, "under the threshold, triage must not prune anything");
}

#[tokio::test]
async fn triage_selects_only_the_ids_it_returns_plus_always_recent() {
    let (store, _dir) = file_store().await;
    let entries: Vec<_> = (1..=6).map(|i| entry(i, i, &format!("msg {i}"))).collect();
    seed(&store, &entries).await;

    let config = ContextConfig {
        lookback_count: 10,
        skip_selection_threshold: 1,
        always_include_recent: 2,
        triage_timeout_secs: 5,
    };
    let selector = ContextSelector::new(store, config);
    let triage = FixedTriage(vec![2]);

    let result = selector.select("room-1", "current prompt", None, &triage).await;
    let ids: Vec<i64> = result.iter().map(|e| e.task_id).collect();
    // task 2 (triaged in) plus the two always-include-recent tail entries (5, 6).
    assert_eq!(ids, vec![2, 5, 6]);
}

#[tokio::test]
async fn triage_timeout_drops_older_entries_but_keeps_recent_tail() {
    let (store, _dir) = file_store().await;
    let entries: Vec<_> = (1..=6).map(|i| entry(i, i, &format!("msg {i}"))).collect();
    seed(&store, &entries).await;

    let config = ContextConfig {
        lookback_count: 10,
        skip_selection_threshold: 1,
        always_include_recent: 2,
        triage_timeout_secs: 1,
    };
    let selector = ContextSelector::new(store, config);

    let result = selector.select("room-1", "current prompt", None, &NeverRespondsTriage).await;
    let ids: Vec<i64> = result.iter().map(|e| e.task_id).collect();
    assert_eq!(ids, vec![5, 6], "a triage timeout must fall back to recent-only, dropping the untriaged older entries");
}

#[tokio::test]
async fn reply_to_parent_is_always_included_even_when_triage_excludes_it() {
    let (store, _dir) = file_store().await;
    let entries: Vec<_> = (1..=6).map(|i| entry(i, i, &format!("msg {i}"))).collect();
    seed(&store, &entries).await;

    let config = ContextConfig {
        lookback_count: 10,
        skip_selection_threshold: 1,
        always_include_recent: 2,
        triage_timeout_secs: 5,
    };
    let selector = ContextSelector::new(store, config);
    let triage = FixedTriage(vec![2]);

    let result = selector.select("room-1", "current prompt", Some(3), &triage).await;
    let ids: Vec<i64> = result.iter().map(|e| e.task_id).collect();
    assert_eq!(ids, vec![2, 3, 5, 6], "the reply-to parent task must be force-included and the result chronologically sorted");
}

#[tokio::test]
async fn store_failure_degrades_to_empty_context_rather_than_erroring() {
    let dir = tempfile::TempDir::new().unwrap();
    // A store pointed at a path whose directory does not exist yields no
    // rows for any conversation token without this call itself panicking.
    let store = Store::connect(&dir.path().join("ctx.db")).await.unwrap();
    let selector = ContextSelector::new(store, ContextConfig::default());
    let result = selector.select("no-such-room", "prompt", None, &ParseFailureTriage).await;
    assert!(result.is_empty());
}
