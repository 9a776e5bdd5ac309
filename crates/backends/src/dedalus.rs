//! Dedalus HTTP adapter.
//!
//! Talks to the Dedalus chat completions API (OpenAI-compatible wire
//! format). Streaming goes over SSE; the buffered path is used as the
//! one-shot fallback when a streaming attempt yields nothing.

use serde_json::Value;

use verdant_domain::config::CompletionConfig;
use verdant_domain::error::{Error, Result};
use verdant_domain::event::{BackendEvent, BoxStream, FinishReason};

use crate::sse::sse_response_stream;
use crate::traits::{Completion, CompletionBackend, CompletionRequest};
use crate::util::{extract_error_message, from_reqwest};

/// Backend name used in errors shown to operators and clients.
const DISPLAY_NAME: &str = "Dedalus";

/// Some upstream providers reject non-browser user agents.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DedalusBackend {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl DedalusBackend {
    pub fn new(cfg: &CompletionConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| from_reqwest("dedalus", e))?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn authed_post(&self, stream: bool) -> reqwest::RequestBuilder {
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .header("User-Agent", DEFAULT_USER_AGENT)
    }

    fn build_body(req: &CompletionRequest, stream: bool) -> Value {
        serde_json::json!({
            "model": req.model,
            "messages": req.messages,
            "stream": stream,
        })
    }
}

/// Map a non-2xx response to a structured error: 5xx is retryable
/// infrastructure trouble, anything else (auth, quota, validation) is not.
fn status_error(status: reqwest::StatusCode, body: &str) -> Error {
    let default = format!("{DISPLAY_NAME} request failed with status {}.", status.as_u16());
    let message = extract_error_message(body, &default);
    if status.is_server_error() {
        Error::BackendTransient {
            backend: "dedalus".into(),
            message,
        }
    } else {
        Error::BackendFatal {
            backend: "dedalus".into(),
            message,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream chunk parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse one SSE `data:` payload into backend events.
///
/// Malformed non-JSON payloads are skipped rather than failing the stream;
/// providers occasionally emit keepalive garbage mid-stream.
fn parse_sse_data(data: &str) -> Vec<Result<BackendEvent>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(BackendEvent::Done {
            finish_reason: FinishReason::Stop,
        })];
    }

    let chunk: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    // An in-band error payload kills the stream.
    if let Some(message) = chunk
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        if !message.trim().is_empty() {
            return vec![Err(Error::BackendFatal {
                backend: "dedalus".into(),
                message: message.to_owned(),
            })];
        }
    }

    let mut events = Vec::new();

    match chunk.get("choices").and_then(|c| c.as_array()) {
        Some(choices) => {
            for choice in choices {
                for token in extract_choice_tokens(choice) {
                    events.push(Ok(BackendEvent::Token { text: token }));
                }
                if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                    if !reason.is_empty() {
                        events.push(Ok(BackendEvent::Done {
                            finish_reason: FinishReason::from_wire(reason),
                        }));
                    }
                }
            }
        }
        // Providers that proxy non-standard chunks still carry text somewhere.
        None => {
            for token in extract_text_fragments(&chunk) {
                events.push(Ok(BackendEvent::Token { text: token }));
            }
        }
    }

    events
}

/// Pull incremental text out of one streamed choice.
///
/// Prefers `delta`; falls back to `text`, `content`, or `message.content`
/// for providers that buffer whole messages despite `stream = true`.
/// Adjacent duplicate fragments (seen from mixed provider payloads that
/// mirror the same text under two keys) are collapsed.
fn extract_choice_tokens(choice: &Value) -> Vec<String> {
    let mut raw = Vec::new();
    if let Some(delta) = choice.get("delta") {
        raw.extend(extract_text_fragments(delta));
    }
    if raw.is_empty() {
        for key in ["text", "content"] {
            if let Some(v) = choice.get(key) {
                raw.extend(extract_text_fragments(v));
            }
        }
        if let Some(message) = choice.get("message") {
            match message.get("content") {
                Some(content) => raw.extend(extract_text_fragments(content)),
                None => raw.extend(extract_text_fragments(message)),
            }
        }
    }

    let mut fragments: Vec<String> = Vec::with_capacity(raw.len());
    for fragment in raw {
        if fragment.is_empty() {
            continue;
        }
        if fragments.last().map(String::as_str) == Some(fragment.as_str()) {
            continue;
        }
        fragments.push(fragment);
    }
    fragments
}

/// Recursively collect text content from a chunk value: raw strings, arrays
/// of parts, and objects keyed `text` / `content` / `value` / `output_text`.
fn extract_text_fragments(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(extract_text_fragments).collect(),
        Value::Object(map) => ["text", "content", "value", "output_text"]
            .iter()
            .filter_map(|key| map.get(*key))
            .flat_map(extract_text_fragments)
            .collect(),
        _ => Vec::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl CompletionBackend for DedalusBackend {
    async fn stream(
        &self,
        req: &CompletionRequest,
    ) -> Result<BoxStream<'static, Result<BackendEvent>>> {
        tracing::debug!(model = %req.model, "dedalus stream request");

        let resp = self
            .authed_post(true)
            .json(&Self::build_body(req, true))
            .send()
            .await
            .map_err(|e| from_reqwest("dedalus", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        Ok(sse_response_stream(resp, "dedalus".into(), |data| {
            parse_sse_data(data)
        }))
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        tracing::debug!(model = %req.model, "dedalus buffered request");

        let resp = self
            .authed_post(false)
            .json(&Self::build_body(req, false))
            .send()
            .await
            .map_err(|e| from_reqwest("dedalus", e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| from_reqwest("dedalus", e))?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let parsed: Value = serde_json::from_str(&body)?;
        let choice = parsed
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .ok_or_else(|| Error::BackendFatal {
                backend: "dedalus".into(),
                message: format!("{DISPLAY_NAME} returned no completion choices."),
            })?;

        let text = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("");
        if text.trim().is_empty() {
            return Err(Error::EmptyResponse(DISPLAY_NAME.into()));
        }

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|r| r.as_str())
            .map(FinishReason::from_wire)
            .unwrap_or_default();

        Ok(Completion {
            text: text.to_owned(),
            finish_reason,
        })
    }

    fn backend_id(&self) -> &str {
        "dedalus"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
