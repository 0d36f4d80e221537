//! Memory search contract (spec 6): `Query(user_id, channel_token?,
//! query_text, limit) → list of (source, excerpt)`.
//!
//! The vector/full-text index itself is out of core scope (spec 3); what
//! belongs here is the query interface and a keyword-only implementation
//! that the recalled-memories prompt section degrades to when no richer
//! backing is configured (spec 4.3).

use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// One memory search hit.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    /// Where the excerpt came from (file path, or a logical source name).
    pub source: String,
    /// The matched excerpt text.
    pub excerpt: String,
}

/// Memory search, implemented by whatever indexing backend is configured.
#[async_trait]
pub trait MemoryQuery: Send + Sync {
    /// Return up to `limit` relevant excerpts for `query_text`, optionally
    /// scoped to one channel.
    async fn query(
        &self,
        user_id: i64,
        channel_token: Option<&str>,
        query_text: &str,
        limit: usize,
    ) -> Vec<MemoryHit>;
}

/// Degrades gracefully: scans a user's dated-memory files for
/// case-insensitive keyword overlap with the query text. Used whenever no
/// vector backing is configured (spec 4.3, 6).
pub struct KeywordMemoryIndex {
    memory_dir: PathBuf,
}

impl KeywordMemoryIndex {
    /// Build an index rooted at `memory_dir` (spec 4.8 `prompt.memory_dir`).
    pub fn new(memory_dir: PathBuf) -> Self {
        Self { memory_dir }
    }

    fn user_dir(&self, user_id: i64) -> PathBuf {
        self.memory_dir.join(user_id.to_string())
    }
}

#[async_trait]
impl MemoryQuery for KeywordMemoryIndex {
    async fn query(
        &self,
        user_id: i64,
        _channel_token: Option<&str>,
        query_text: &str,
        limit: usize,
    ) -> Vec<MemoryHit> {
        let dir = self.user_dir(user_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let keywords: Vec<String> = query_text
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .map(str::to_lowercase)
            .collect();
        if keywords.is_empty() {
            return Vec::new();
        }

        let mut hits = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            for paragraph in contents.split("\n\n") {
                let lower = paragraph.to_lowercase();
                if keywords.iter().any(|kw| lower.contains(kw.as_str())) {
                    hits.push(MemoryHit {
                        source: path_source(&path),
                        excerpt: paragraph.trim().to_owned(),
                    });
                    if hits.len() >= limit {
                        return hits;
                    }
                }
            }
        }
        hits
    }
}

fn path_source(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
