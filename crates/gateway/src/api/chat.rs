//! `POST /chat` — run one chat turn and stream the assistant's reply
//! as Server-Sent Events.
//!
//! Validation and configuration failures are rejected before the SSE
//! stream opens, as a JSON `{ "error": ... }` body with a matching
//! status code. Once streaming has begun, failures travel as `error`
//! events inside the stream.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;

use verdant_conversations::ConversationStore;
use verdant_domain::error::Error;
use verdant_domain::event::ChatEvent;

use crate::runtime::conversation_lock::ConversationLockGuard;
use crate::runtime::{run_turn, CancelToken, TurnInput};
use crate::state::AppState;

use super::api_error;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Conversation turns; only the latest user turn is consumed (the
    /// durable history lives server-side).
    #[serde(default)]
    pub messages: Vec<IncomingTurn>,
    /// Conversation to run the turn against. The `conversationId` query
    /// parameter is accepted as a fallback.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Optional model override (e.g. "openai/gpt-4o").
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IncomingTurn {
    pub role: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    axum::Json(body): axum::Json<ChatRequest>,
) -> Response {
    // ── Pre-stream validation ────────────────────────────────────────
    let (conversation_id, user_message) = match validate(&state, &body, &query) {
        Ok(v) => v,
        Err(e) => {
            let status = StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return api_error(status, e.client_message());
        }
    };

    // ── Serialize with other turns on this conversation ──────────────
    let guard = state.conversation_locks.acquire(&conversation_id).await;
    let cancel = CancelToken::new();

    let rx = run_turn(
        state.clone(),
        TurnInput {
            conversation_id,
            user_message,
            requested_model: body.model,
            cancel: cancel.clone(),
        },
    );

    let ticket = TurnTicket {
        _guard: guard,
        cancel,
    };

    let mut response = Sse::new(sse_event_stream(rx, ticket))
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    // Tells nginx-style proxies not to buffer the event stream.
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

fn validate(
    state: &AppState,
    body: &ChatRequest,
    query: &ChatQuery,
) -> Result<(String, String), Error> {
    let raw_id = body
        .conversation_id
        .as_deref()
        .or(query.conversation_id.as_deref())
        .ok_or_else(|| Error::BadRequest("conversationId is required.".into()))?;
    let id = ConversationStore::sanitize_id(raw_id)?.to_owned();
    if !state.store.exists(&id) {
        return Err(Error::NotFound(id));
    }

    let user_message = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user" && !m.text.trim().is_empty())
        .map(|m| m.text.trim().to_owned())
        .ok_or_else(|| Error::BadRequest("The message text must not be empty.".into()))?;

    // Surface a missing credential as JSON before the stream opens.
    state.backend()?;

    Ok((id, user_message))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owns the conversation lock and the turn's cancel token for the
/// lifetime of the SSE response. Dropping it — client disconnect or
/// normal end of stream — cancels the turn and releases the lock, so
/// the next queued turn on this conversation can start.
struct TurnTicket {
    _guard: ConversationLockGuard,
    cancel: CancelToken,
}

impl Drop for TurnTicket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn sse_event_stream(
    mut rx: mpsc::Receiver<ChatEvent>,
    ticket: TurnTicket,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event.kind()).data(data));
        }
        // ticket is dropped here, releasing the conversation lock.
        drop(ticket);
    }
}
