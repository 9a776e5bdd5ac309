use std::path::PathBuf;

use serde::Serialize;

use verdant_domain::error::Result;
use verdant_domain::event::{BackendEvent, BoxStream, FinishReason};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One message on the chat completions wire.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

impl WireMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_owned(),
            content: content.into(),
        }
    }
}

/// A transport-agnostic completion request for one turn.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model to generate with; always resolved before this point, never empty.
    pub model: String,
    /// Full context in order: system prompt, history, latest user message.
    pub messages: Vec<WireMessage>,
    /// Conversation id, passed through to transports that track state
    /// per-conversation (the helper process).
    pub conversation_id: String,
    /// On-disk bundle path for the helper transport. The HTTP transport
    /// ignores it.
    pub bundle_path: PathBuf,
}

impl CompletionRequest {
    /// The latest user message in the request, if any.
    pub fn latest_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

/// A finished (buffered) completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every completion transport implements.
///
/// `stream` yields incremental [`BackendEvent`] items; failures travel as
/// `Err` items inside the stream once it has started. `complete` waits for
/// the whole response and is used as the one-shot fallback when a streaming
/// attempt produced nothing.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Start a streaming completion.
    async fn stream(
        &self,
        req: &CompletionRequest,
    ) -> Result<BoxStream<'static, Result<BackendEvent>>>;

    /// Run a completion to the end and return the accumulated text.
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion>;

    /// A short identifier for this backend instance, used in logs and
    /// error messages.
    fn backend_id(&self) -> &str;
}
