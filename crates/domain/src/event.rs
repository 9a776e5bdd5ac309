use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for backend completion streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finish reason
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why the model stopped generating.
///
/// Serialized in the client's kebab-case convention; [`FinishReason::from_wire`]
/// maps the snake_case strings completion APIs emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
}

impl FinishReason {
    /// Normalize a provider wire-format finish reason.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "content_filter" | "content-filter" => FinishReason::ContentFilter,
            "tool_calls" | "tool-calls" => FinishReason::ToolCalls,
            "error" => FinishReason::Error,
            _ => FinishReason::Other,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted by a completion backend while generating, independent of
/// the transport (HTTP SSE or helper process). Failures travel as `Err` items
/// in the surrounding stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendEvent {
    /// An incremental text fragment.
    Token { text: String },

    /// Generation finished.
    Done { finish_reason: FinishReason },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client-facing chat events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The framed events a single chat turn streams to the browser.
///
/// A successful turn emits exactly:
/// `start, start-step, text-start, text-delta*, text-end, finish-step, finish`.
/// A turn that fails before producing output ends with a single `error`
/// event and no terminal pair.
///
/// Type tags are kebab-case; payload fields follow the client's camelCase
/// convention (`messageId`, `finishReason`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        message_id: String,
    },
    StartStep,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    FinishStep,
    #[serde(rename_all = "camelCase")]
    Finish {
        finish_reason: FinishReason,
    },
    Error {
        message: String,
    },
}

impl ChatEvent {
    /// The wire name of this event, used as the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::Start { .. } => "start",
            ChatEvent::StartStep => "start-step",
            ChatEvent::TextStart { .. } => "text-start",
            ChatEvent::TextDelta { .. } => "text-delta",
            ChatEvent::TextEnd { .. } => "text-end",
            ChatEvent::FinishStep => "finish-step",
            ChatEvent::Finish { .. } => "finish",
            ChatEvent::Error { .. } => "error",
        }
    }
}
