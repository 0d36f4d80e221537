//! Structured stream-JSON events emitted by the LLM subprocess (spec 4.4).

use serde::Deserialize;

use crate::types::ActionTaken;

/// One line of the child's structured stdout stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A tool invocation, surfaced to the progress callback.
    ToolUse {
        /// Human-readable description of what the tool did.
        description: String,
    },
    /// Intermediate assistant text.
    Text {
        /// The text chunk.
        text: String,
        /// Whether this chunk was truncated by the child before emission.
        #[serde(default)]
        truncated: bool,
    },
    /// The final result; terminates streaming.
    Result {
        /// Whether the invocation succeeded.
        success: bool,
        /// Final result text (error message when `success` is false).
        text: String,
        /// Upstream error classification hint, when `success` is false.
        #[serde(default)]
        error_kind: Option<String>,
    },
}

/// A progress message forwarded to the caller while streaming.
#[derive(Debug, Clone)]
pub enum ProgressMessage {
    /// A tool was used.
    ToolUse(ActionTaken),
    /// Intermediate text, truncated per configuration if requested.
    Text(String),
}

/// Buffers bytes until a newline and parses each line independently.
///
/// Line framing is not assumed to be newline-lossless: a non-JSON or
/// partial line is logged and skipped rather than treated as fatal
/// (spec 4.4, 9).
pub struct LineParser {
    buffer: String,
}

impl LineParser {
    /// A fresh parser with an empty buffer.
    pub fn new() -> Self {
        Self { buffer: String::new() }
    }

    /// Feed one chunk of child output, returning every complete event
    /// parsed from newline-terminated lines found so far.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(%err, line, "skipping unparsable executor stream line");
                }
            }
        }
        events
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_splits_on_newline_boundaries_across_chunks() {
        let mut parser = LineParser::new();
        assert!(parser.feed(r#"{"type":"text","text":"hel"#).is_empty());
        let events = parser.feed("lo\"}\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Text { text, .. } if text == "hello"));
    }

    #[test]
    fn feed_parses_multiple_events_in_one_chunk() {
        let mut parser = LineParser::new();
        let events = parser.feed(
            "{\"type\":\"tool_use\",\"description\":\"ls\"}\n{\"type\":\"result\",\"success\":true,\"text\":\"done\"}\n",
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::ToolUse { description } if description == "ls"));
        assert!(matches!(&events[1], StreamEvent::Result { success: true, .. }));
    }

    #[test]
    fn feed_skips_unparsable_lines_without_losing_later_events() {
        let mut parser = LineParser::new();
        let events = parser.feed("not json at all\n{\"type\":\"result\",\"success\":false,\"text\":\"bad\"}\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Result { success: false, .. }));
    }

    #[test]
    fn feed_ignores_blank_lines() {
        let mut parser = LineParser::new();
        let events = parser.feed("\n\n{\"type\":\"result\",\"success\":true,\"text\":\"ok\"}\n");
        assert_eq!(events.len(), 1);
    }
}
