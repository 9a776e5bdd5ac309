//! Helper process adapter.
//!
//! Spawns a configured local helper (typically a Python script owning the
//! Dedalus call) and reads newline-delimited JSON events from its stdout:
//!
//! ```text
//! {"type": "token", "token": "Hel"}
//! {"type": "final", "text": "Hello.", "finish_reason": "stop"}
//! {"type": "error", "message": "Missing DEDALUS_API_KEY."}
//! ```
//!
//! The child is spawned `kill_on_drop`, so dropping the stream mid-turn
//! (client abort) terminates the process.

use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};

use verdant_domain::config::HelperConfig;
use verdant_domain::error::{Error, Result};
use verdant_domain::event::{BackendEvent, BoxStream, FinishReason};

use crate::traits::{Completion, CompletionBackend, CompletionRequest};

/// Backend name used in the empty-response error shown to clients.
const DISPLAY_NAME: &str = "The completion helper";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One NDJSON line on the helper's stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HelperEvent {
    Token {
        token: String,
    },
    Final {
        text: String,
        #[serde(default)]
        finish_reason: Option<String>,
    },
    Error {
        message: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HelperBackend {
    command: String,
    args: Vec<String>,
}

impl HelperBackend {
    pub fn new(cfg: &HelperConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
        }
    }

    fn spawn(&self, req: &CompletionRequest, stream: bool) -> Result<Child> {
        let message = req.latest_user_message().unwrap_or_default();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("--message")
            .arg(message)
            .arg("--conversation-json-path")
            .arg(&req.bundle_path)
            .arg("--conversation-id")
            .arg(&req.conversation_id)
            .arg("--model")
            .arg(&req.model)
            .arg(if stream { "--stream" } else { "--no-stream" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            command = %self.command,
            model = %req.model,
            conversation_id = %req.conversation_id,
            "spawning completion helper"
        );

        cmd.spawn().map_err(|e| Error::BackendTransient {
            backend: "helper".into(),
            message: format!("failed to spawn {}: {e}", self.command),
        })
    }
}

/// Interpret the helper's exit after stdout closed.
///
/// Precedence: an explicit `error` event wins, then a non-zero exit (with
/// captured stderr when there is any), then an empty transcript.
async fn finish_child(
    mut child: Child,
    saw_error: Option<String>,
    accumulated: &str,
) -> Result<()> {
    let mut stderr_buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut stderr_buf).await;
    }

    let status = child.wait().await.map_err(Error::Io)?;

    if let Some(message) = saw_error {
        return Err(Error::BackendFatal {
            backend: "helper".into(),
            message,
        });
    }

    if !status.success() {
        let detail = stderr_buf.trim();
        let message = if detail.is_empty() {
            format!(
                "helper exited with status {}",
                status.code().unwrap_or(-1)
            )
        } else {
            detail.chars().take(500).collect()
        };
        return Err(Error::BackendFatal {
            backend: "helper".into(),
            message,
        });
    }

    if accumulated.trim().is_empty() {
        return Err(Error::EmptyResponse(DISPLAY_NAME.into()));
    }

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl CompletionBackend for HelperBackend {
    async fn stream(
        &self,
        req: &CompletionRequest,
    ) -> Result<BoxStream<'static, Result<BackendEvent>>> {
        let mut child = self.spawn(req, true)?;
        let stdout = child.stdout.take().ok_or_else(|| Error::BackendFatal {
            backend: "helper".into(),
            message: "failed to capture helper stdout".into(),
        })?;

        let stream = async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            let mut accumulated = String::new();
            let mut saw_error: Option<String> = None;
            let mut done_emitted = false;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Io(e));
                        return;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_str::<HelperEvent>(line) {
                    Ok(HelperEvent::Token { token }) => {
                        accumulated.push_str(&token);
                        yield Ok(BackendEvent::Token { text: token });
                    }
                    Ok(HelperEvent::Final { text, finish_reason }) => {
                        // In non-token runs the final event carries all text.
                        if accumulated.trim().is_empty() && !text.trim().is_empty() {
                            accumulated.push_str(&text);
                            yield Ok(BackendEvent::Token { text });
                        }
                        let finish_reason = finish_reason
                            .as_deref()
                            .map(FinishReason::from_wire)
                            .unwrap_or_default();
                        done_emitted = true;
                        yield Ok(BackendEvent::Done { finish_reason });
                    }
                    Ok(HelperEvent::Error { message }) => {
                        saw_error = Some(message);
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(line, "skipping non-event helper output");
                    }
                }
            }

            if let Err(e) = finish_child(child, saw_error, &accumulated).await {
                yield Err(e);
                return;
            }

            if !done_emitted {
                yield Ok(BackendEvent::Done {
                    finish_reason: FinishReason::Stop,
                });
            }
        };

        Ok(Box::pin(stream))
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        let mut child = self.spawn(req, false)?;
        let stdout = child.stdout.take().ok_or_else(|| Error::BackendFatal {
            backend: "helper".into(),
            message: "failed to capture helper stdout".into(),
        })?;

        let mut lines = BufReader::new(stdout).lines();
        let mut accumulated = String::new();
        let mut finish_reason = FinishReason::Stop;
        let mut saw_error: Option<String> = None;

        while let Some(line) = lines.next_line().await.map_err(Error::Io)? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HelperEvent>(line) {
                Ok(HelperEvent::Token { token }) => accumulated.push_str(&token),
                Ok(HelperEvent::Final { text, finish_reason: reason }) => {
                    if accumulated.trim().is_empty() {
                        accumulated = text;
                    }
                    if let Some(reason) = reason.as_deref() {
                        finish_reason = FinishReason::from_wire(reason);
                    }
                }
                Ok(HelperEvent::Error { message }) => {
                    saw_error = Some(message);
                    break;
                }
                Err(_) => {
                    tracing::debug!(line, "skipping non-event helper output");
                }
            }
        }

        finish_child(child, saw_error, &accumulated).await?;

        Ok(Completion {
            text: accumulated,
            finish_reason,
        })
    }

    fn backend_id(&self) -> &str {
        "helper"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
