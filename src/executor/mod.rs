//! Spawns the LLM subprocess, streams structured events, surfaces
//! progress, enforces timeout and cancellation, classifies and retries
//! transient errors (spec 4.4).
//!
//! Grounded on a line-delimited JSON-RPC-over-stdio child process
//! transport: the prompt goes in on stdin, never as a command-line
//! argument, and the child's stdout is read line-by-line with each line
//! parsed independently.

mod events;

pub use events::{ProgressMessage, StreamEvent};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use crate::config::ExecutorConfig;
use crate::types::ActionTaken;

use events::LineParser;

/// Classified error kinds an invocation can terminate with (spec 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upstream 5xx/429/timeout reported by the child, retried in-executor.
    TransientUpstream,
    /// The caller requested cancellation.
    Cancelled,
    /// No `ResultEvent` arrived within the execution timeout.
    Timeout,
    /// Auth, OOM, parse failure, or any other non-transient child failure.
    TerminalSubprocessError,
}

/// Outcome of one [`Executor::execute`] call.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Whether the invocation ultimately succeeded.
    pub success: bool,
    /// Final result text (or a user-facing error message on failure).
    pub result_text: String,
    /// Tool-use descriptions accumulated during streaming.
    pub actions_taken: Vec<ActionTaken>,
    /// Set when `success` is false.
    pub error_kind: Option<ErrorKind>,
}

/// Errors that prevent an invocation from producing any [`ExecResult`] at all.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The child process could not be spawned.
    #[error("failed to spawn executor child: {0}")]
    Spawn(#[source] std::io::Error),
    /// Writing the prompt to the child's stdin failed.
    #[error("failed to write prompt to executor stdin: {0}")]
    Stdin(#[source] std::io::Error),
}

/// Poll function the caller supplies to check whether cancellation has
/// been requested for the task being executed (typically backed by a
/// periodic store read, not a per-event query).
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Progress callback invoked as tool-use and text events arrive.
pub type ProgressCallback = Arc<dyn Fn(ProgressMessage) + Send + Sync>;

/// Drives one or more child invocations to a final [`ExecResult`]
/// (spec 4.4 state machine: `spawned → streaming →
/// {completed | cancelled | timed_out | transient_error (retry) | terminal_error}`).
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    /// Build an executor with the given tunables.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Run the external LLM tool to completion for one task.
    ///
    /// Permissive mode passes no explicit tool allow-list flag; restricted
    /// mode passes `--allowed-tools` built from `allowed_tools`.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutorError`] only when the child cannot be spawned
    /// or its stdin cannot be written; classified runtime failures
    /// (timeout, cancellation, transient/terminal subprocess errors) are
    /// reported via [`ExecResult`], not this error type.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        prompt: &str,
        env: &HashMap<String, String>,
        working_dir: &Path,
        restricted: bool,
        allowed_tools: &[String],
        cancel: CancelCheck,
        progress: ProgressCallback,
    ) -> Result<ExecResult, ExecutorError> {
        let mut attempt = 0u32;
        loop {
            let outcome = self
                .run_once(prompt, env, working_dir, restricted, allowed_tools, &cancel, &progress)
                .await?;

            match outcome.error_kind {
                Some(ErrorKind::TransientUpstream) if attempt < self.config.transient_retry_attempts => {
                    attempt += 1;
                    tracing::warn!(attempt, "transient upstream error, retrying within invocation");
                    tokio::time::sleep(Duration::from_secs(self.config.transient_retry_delay_secs)).await;
                    continue;
                }
                _ => return Ok(outcome),
            }
        }
    }

    async fn run_once(
        &self,
        prompt: &str,
        env: &HashMap<String, String>,
        working_dir: &Path,
        restricted: bool,
        allowed_tools: &[String],
        cancel: &CancelCheck,
        progress: &ProgressCallback,
    ) -> Result<ExecResult, ExecutorError> {
        let mut command = match &self.config.sandbox_binary {
            Some(sandbox) => {
                let mut cmd = Command::new(sandbox);
                cmd.arg(&self.config.claude_binary);
                cmd
            }
            None => Command::new(&self.config.claude_binary),
        };

        command.arg("--stream-json").arg("--input-format").arg("stdin");
        if restricted {
            command.arg("--allowed-tools").arg(allowed_tools.join(","));
        } else {
            command.arg("--permissive");
        }

        command
            .current_dir(working_dir)
            .env_clear()
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(ExecutorError::Spawn)?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(ExecutorError::Stdin)?;
        drop(stdin);

        let stdout = child.stdout.take().expect("piped stdout");
        let mut reader = BufReader::new(stdout);
        let mut parser = LineParser::new();

        let mut actions_taken: Vec<ActionTaken> = Vec::new();
        let mut sent_progress_texts: Vec<String> = Vec::new();
        let mut progress_count = 0u32;
        let mut last_progress_at: Option<Instant> = None;

        let deadline = Instant::now() + Duration::from_secs(self.config.execution_timeout_secs);

        loop {
            if cancel() {
                let _ = child.start_kill();
                return Ok(ExecResult {
                    success: false,
                    result_text: "cancelled".to_owned(),
                    actions_taken,
                    error_kind: Some(ErrorKind::Cancelled),
                });
            }

            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Ok(ExecResult {
                    success: false,
                    result_text: "execution timed out".to_owned(),
                    actions_taken,
                    error_kind: Some(ErrorKind::Timeout),
                });
            }

            let mut line = String::new();
            let read = tokio::time::timeout(Duration::from_millis(500), reader.read_line(&mut line)).await;

            let bytes_read = match read {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    tracing::warn!(%err, "error reading executor stdout");
                    0
                }
                Err(_) => continue, // poll loop tick: re-check cancel/timeout
            };

            if bytes_read == 0 {
                // EOF with no ResultEvent: treat as a terminal subprocess error.
                let _ = child.wait().await;
                return Ok(ExecResult {
                    success: false,
                    result_text: "executor exited without a result".to_owned(),
                    actions_taken,
                    error_kind: Some(ErrorKind::TerminalSubprocessError),
                });
            }

            for event in parser.feed(&line) {
                match event {
                    StreamEvent::ToolUse { description } => {
                        let action = ActionTaken {
                            description: description.clone(),
                            at: chrono::Utc::now(),
                        };
                        actions_taken.push(action.clone());

                        let should_send = last_progress_at
                            .map(|t| t.elapsed() >= Duration::from_secs(self.config.progress_min_interval_secs))
                            .unwrap_or(true);
                        if should_send && progress_count < self.config.progress_max_messages {
                            progress(ProgressMessage::ToolUse(action));
                            progress_count += 1;
                            last_progress_at = Some(Instant::now());
                        }
                    }
                    StreamEvent::Text { text, truncated } => {
                        let should_send = last_progress_at
                            .map(|t| t.elapsed() >= Duration::from_secs(self.config.progress_min_interval_secs))
                            .unwrap_or(true);
                        if should_send && progress_count < self.config.progress_max_messages {
                            progress(ProgressMessage::Text(text.clone()));
                            progress_count += 1;
                            last_progress_at = Some(Instant::now());
                            if !truncated {
                                sent_progress_texts.push(text);
                            }
                        }
                    }
                    StreamEvent::Result { success, text, error_kind } => {
                        let _ = child.wait().await;

                        if !success {
                            let kind = classify_error_kind(error_kind.as_deref());
                            return Ok(ExecResult {
                                success: false,
                                result_text: text,
                                actions_taken,
                                error_kind: Some(kind),
                            });
                        }

                        let final_text = dedup_against_progress(&text, &sent_progress_texts);
                        return Ok(ExecResult {
                            success: true,
                            result_text: final_text,
                            actions_taken,
                            error_kind: None,
                        });
                    }
                }
            }
        }
    }
}

fn classify_error_kind(hint: Option<&str>) -> ErrorKind {
    match hint {
        Some("transient") | Some("5xx") | Some("429") | Some("timeout") => ErrorKind::TransientUpstream,
        _ => ErrorKind::TerminalSubprocessError,
    }
}

/// Progress deduplication (spec 4.4): suppress an exact repeat of already
/// sent progress text; strip a sent prefix from the final delivery.
fn dedup_against_progress(final_text: &str, sent: &[String]) -> String {
    for prior in sent {
        if prior == final_text {
            return String::new();
        }
        if let Some(stripped) = final_text.strip_prefix(prior.as_str()) {
            return stripped.trim_start().to_owned();
        }
    }
    final_text.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_error_kind_recognizes_transient_hints() {
        assert_eq!(classify_error_kind(Some("transient")), ErrorKind::TransientUpstream);
        assert_eq!(classify_error_kind(Some("5xx")), ErrorKind::TransientUpstream);
        assert_eq!(classify_error_kind(Some("429")), ErrorKind::TransientUpstream);
        assert_eq!(classify_error_kind(Some("timeout")), ErrorKind::TransientUpstream);
    }

    #[test]
    fn classify_error_kind_defaults_to_terminal() {
        assert_eq!(classify_error_kind(Some("auth_failed")), ErrorKind::TerminalSubprocessError);
        assert_eq!(classify_error_kind(None), ErrorKind::TerminalSubprocessError);
    }

    #[test]
    fn dedup_suppresses_exact_repeat() {
        let sent = vec!["partial answer".to_owned()];
        assert_eq!(dedup_against_progress("partial answer", &sent), "");
    }

    #[test]
    fn dedup_strips_sent_prefix_from_final_text() {
        let sent = vec!["Step 1 done. ".to_owned()];
        assert_eq!(dedup_against_progress("Step 1 done. Step 2 done.", &sent), "Step 2 done.");
    }

    #[test]
    fn dedup_passes_through_unrelated_text() {
        let sent = vec!["something else".to_owned()];
        assert_eq!(dedup_against_progress("final answer", &sent), "final answer");
    }
}
