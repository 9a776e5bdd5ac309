//! Completion orchestrator — drives one chat turn from validated input
//! to a finished, persisted assistant message, relaying partial output
//! to the caller as it is produced.
//!
//! Entry point: [`run_turn`] spawns the async loop and returns a channel
//! of [`ChatEvent`]s for the SSE response.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::Instrument;

use verdant_backends::{CompletionBackend, CompletionRequest, WireMessage};
use verdant_conversations::ConversationStore;
use verdant_domain::config::StreamTuning;
use verdant_domain::error::{Error, Result};
use verdant_domain::event::{BackendEvent, ChatEvent, FinishReason};

use crate::state::AppState;

use super::cancel::CancelToken;
use super::relay;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to a single chat turn.
pub struct TurnInput {
    pub conversation_id: String,
    pub user_message: String,
    /// Model override (e.g. "openai/gpt-4o"). Requests for models off the
    /// allow-list fall back to the configured default.
    pub requested_model: Option<String>,
    /// Cancelled when the client's SSE stream is dropped.
    pub cancel: CancelToken,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn — the orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one chat turn: validate, snapshot the prompt, stream the backend
/// with model failover, relay tokens, persist the finished completion.
///
/// Returns a channel receiver of [`ChatEvent`]s. A successful turn emits
/// exactly `start, start-step, text-start, text-delta*, text-end,
/// finish-step, finish`. A turn that fails before producing output ends
/// with a single `error` event instead; an aborted turn just ends.
pub fn run_turn(state: AppState, input: TurnInput) -> mpsc::Receiver<ChatEvent> {
    let (tx, rx) = mpsc::channel::<ChatEvent>(64);

    let span = tracing::info_span!(
        "turn",
        conversation_id = %input.conversation_id,
    );
    tokio::spawn(
        async move {
            tracing::debug!("turn started");
            if let Err(e) = run_turn_inner(state, input, &tx).await {
                match e {
                    Error::Aborted => tracing::debug!("turn aborted by client"),
                    e => {
                        tracing::warn!(error = %e, "turn failed");
                        let _ = tx
                            .send(ChatEvent::Error {
                                message: e.client_message(),
                            })
                            .await;
                    }
                }
            }
        }
        .instrument(span),
    );

    rx
}

async fn run_turn_inner(
    state: AppState,
    input: TurnInput,
    tx: &mpsc::Sender<ChatEvent>,
) -> Result<()> {
    // ── Preconditions ────────────────────────────────────────────────
    let user_message = input.user_message.trim().to_owned();
    if user_message.is_empty() {
        return Err(Error::BadRequest("The message text must not be empty.".into()));
    }
    let id = ConversationStore::sanitize_id(&input.conversation_id)?.to_owned();
    if !state.store.exists(&id) {
        return Err(Error::NotFound(id));
    }
    let backend = state.backend()?;

    if input.cancel.is_cancelled() {
        return Err(Error::Aborted);
    }

    let cfg = &state.config.completion;
    let candidates = cfg.candidate_models(input.requested_model.as_deref());
    let primary = match candidates.first() {
        Some(model) => model.clone(),
        // Both configured models blank; candidate_models filters blanks.
        None => {
            return Err(Error::Misconfigured(
                "No completion model is configured. \
                 Set completion.default_model and restart the gateway."
                    .into(),
            ))
        }
    };

    // ── Prompt snapshot (before any streaming) ───────────────────────
    let bundle = state.store.snapshot_prompt(&id, &user_message, &primary).await?;

    let mut messages = vec![WireMessage::new("system", bundle.system_prompt())];
    messages.extend(bundle.history().map(|m| WireMessage::new(&m.role, &m.text)));

    let base_request = CompletionRequest {
        model: primary.clone(),
        messages,
        conversation_id: id.clone(),
        bundle_path: state.store.bundle_path(&id),
    };

    // ── Candidate loop with per-candidate retries ────────────────────
    let max_tries = cfg.max_tries();
    let tuning = cfg.stream.clamped();
    let mut last_error: Option<Error> = None;

    'candidates: for model in &candidates {
        for attempt in 1..=max_tries {
            if input.cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            let mut request = base_request.clone();
            request.model = model.clone();

            let outcome = stream_candidate(
                &state,
                backend.as_ref(),
                &request,
                &primary,
                tx,
                &input.cancel,
                tuning,
            )
            .await;

            match outcome {
                AttemptOutcome::Finished {
                    part_id,
                    text,
                    finish_reason,
                } => {
                    if input.cancel.is_cancelled() {
                        return Err(Error::Aborted);
                    }

                    // Persist before telling the client the turn is done,
                    // so a storage failure still surfaces as an error.
                    state.store.append_assistant(&id, &text, model).await?;

                    let _ = tx.send(ChatEvent::TextEnd { id: part_id }).await;
                    let _ = tx.send(ChatEvent::FinishStep).await;
                    let _ = tx.send(ChatEvent::Finish { finish_reason }).await;
                    return Ok(());
                }
                AttemptOutcome::Failed {
                    error: Error::Aborted,
                    ..
                } => return Err(Error::Aborted),
                AttemptOutcome::Failed {
                    error,
                    output_started: true,
                } => {
                    // The candidate was committed the moment it produced
                    // output: no retry, no failover, the stream ends here.
                    return Err(error);
                }
                AttemptOutcome::Failed { error, .. } => {
                    if error.is_retryable() && attempt < max_tries {
                        tracing::warn!(
                            model = %model,
                            attempt,
                            error = %error,
                            "retryable backend failure, backing off"
                        );
                        backoff(attempt, cfg.backoff_ms, &input.cancel).await?;
                        last_error = Some(error);
                    } else {
                        tracing::warn!(
                            model = %model,
                            error = %error,
                            "candidate exhausted, advancing"
                        );
                        last_error = Some(error);
                        continue 'candidates;
                    }
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::Other("No completion backend produced a response.".into())))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Single-candidate attempt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum AttemptOutcome {
    /// The candidate produced output; the relay has been drained and the
    /// caller owes the client the closing frames.
    Finished {
        part_id: String,
        text: String,
        finish_reason: FinishReason,
    },
    Failed {
        error: Error,
        /// Whether opening frames (and possibly deltas) already went out.
        output_started: bool,
    },
}

/// Attempt one candidate model: stream it, lazily emit the opening
/// frames on the first fragment, feed the relay, and fall back to one
/// buffered call when the stream produced no tokens.
async fn stream_candidate(
    state: &AppState,
    backend: &dyn CompletionBackend,
    request: &CompletionRequest,
    primary: &str,
    tx: &mpsc::Sender<ChatEvent>,
    cancel: &CancelToken,
    tuning: StreamTuning,
) -> AttemptOutcome {
    let failed = |error: Error, output_started: bool| AttemptOutcome::Failed {
        error,
        output_started,
    };

    let mut stream = match backend.stream(request).await {
        Ok(s) => s,
        Err(e) => return failed(e, false),
    };

    let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    let part_id = format!("part_{}", uuid::Uuid::new_v4().simple());

    let mut relay_handle: Option<relay::RelayHandle> = None;
    let mut text = String::new();
    let mut finish_reason = FinishReason::Stop;

    while let Some(event) = stream.next().await {
        if cancel.is_cancelled() {
            return failed(Error::Aborted, relay_handle.is_some());
        }
        match event {
            Ok(BackendEvent::Token { text: fragment }) if !fragment.is_empty() => {
                if relay_handle.is_none() {
                    if !send_opening_frames(tx, &message_id, &part_id).await {
                        return failed(Error::Aborted, false);
                    }
                    commit_candidate(state, request, primary).await;
                    relay_handle = Some(relay::spawn(
                        part_id.clone(),
                        tuning,
                        tx.clone(),
                        cancel.clone(),
                    ));
                }
                text.push_str(&fragment);
                if let Some(handle) = &relay_handle {
                    if !handle.push(fragment).await {
                        return failed(Error::Aborted, true);
                    }
                }
            }
            Ok(BackendEvent::Token { .. }) => {}
            Ok(BackendEvent::Done { finish_reason: fr }) => {
                finish_reason = fr;
                break;
            }
            Err(e) => {
                let output_started = relay_handle.is_some();
                if let Some(handle) = relay_handle.take() {
                    // Flush what the client was already promised before
                    // surfacing the error.
                    handle.finish().await;
                }
                return failed(e, output_started);
            }
        }
    }

    match relay_handle {
        Some(handle) => {
            handle.finish().await;
            AttemptOutcome::Finished {
                part_id,
                text,
                finish_reason,
            }
        }
        // No tokens at all: retry this candidate once, buffered.
        None => buffered_fallback(state, backend, request, primary, tx, cancel, &message_id, &part_id)
            .await,
    }
}

/// One-shot buffered call used when a streaming attempt yields no token
/// events. Emits the full event sequence with a single `text-delta`.
#[allow(clippy::too_many_arguments)]
async fn buffered_fallback(
    state: &AppState,
    backend: &dyn CompletionBackend,
    request: &CompletionRequest,
    primary: &str,
    tx: &mpsc::Sender<ChatEvent>,
    cancel: &CancelToken,
    message_id: &str,
    part_id: &str,
) -> AttemptOutcome {
    tracing::debug!(model = %request.model, "stream produced no tokens, retrying buffered");

    let completion = match backend.complete(request).await {
        Ok(c) => c,
        Err(e) => {
            return AttemptOutcome::Failed {
                error: e,
                output_started: false,
            }
        }
    };
    if cancel.is_cancelled() {
        return AttemptOutcome::Failed {
            error: Error::Aborted,
            output_started: false,
        };
    }
    if completion.text.is_empty() {
        return AttemptOutcome::Failed {
            error: Error::EmptyResponse(backend.backend_id().to_owned()),
            output_started: false,
        };
    }

    if !send_opening_frames(tx, message_id, part_id).await {
        return AttemptOutcome::Failed {
            error: Error::Aborted,
            output_started: false,
        };
    }
    commit_candidate(state, request, primary).await;
    let _ = tx
        .send(ChatEvent::TextDelta {
            id: part_id.to_owned(),
            delta: completion.text.clone(),
        })
        .await;

    AttemptOutcome::Finished {
        part_id: part_id.to_owned(),
        text: completion.text,
        finish_reason: completion.finish_reason,
    }
}

/// Emit `start`, `start-step`, `text-start`. Returns false when the
/// client is gone.
async fn send_opening_frames(
    tx: &mpsc::Sender<ChatEvent>,
    message_id: &str,
    part_id: &str,
) -> bool {
    let frames = [
        ChatEvent::Start {
            message_id: message_id.to_owned(),
        },
        ChatEvent::StartStep,
        ChatEvent::TextStart {
            id: part_id.to_owned(),
        },
    ];
    for frame in frames {
        if tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

/// A candidate is committed once it produces output. When it is not the
/// primary, correct the persisted model record right away so the bundle
/// reflects the model that actually answered even if streaming later
/// fails.
async fn commit_candidate(state: &AppState, request: &CompletionRequest, primary: &str) {
    if request.model == primary {
        return;
    }
    if state.config.completion.log_recovery {
        tracing::info!(
            conversation_id = %request.conversation_id,
            model = %request.model,
            "turn recovered on a fallback model"
        );
    }
    if let Err(e) = state
        .store
        .record_model(&request.conversation_id, &request.model)
        .await
    {
        tracing::warn!(error = %e, "failed to correct the model record");
    }
}

/// Linear backoff between retries of the same candidate: attempt `n`
/// waits `n * backoff_ms`. Polls the cancel flag so an abort does not
/// block teardown for the full wait.
async fn backoff(attempt: u32, backoff_ms: u64, cancel: &CancelToken) -> Result<()> {
    let total = Duration::from_millis(u64::from(attempt) * backoff_ms);
    let slice = Duration::from_millis(25);
    let mut waited = Duration::ZERO;
    while waited < total {
        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }
        let step = slice.min(total - waited);
        tokio::time::sleep(step).await;
        waited += step;
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::path::Path;

    use parking_lot::Mutex;

    use verdant_backends::Completion;
    use verdant_conversations::ConversationBundle;
    use verdant_domain::config::{CompletionConfig, Config};
    use verdant_domain::event::BoxStream;

    use crate::runtime::conversation_lock::ConversationLockMap;

    // ── Scripted backend ─────────────────────────────────────────────

    #[derive(Default)]
    struct ScriptedBackend {
        stream_steps: Mutex<VecDeque<Result<Vec<Result<BackendEvent>>>>>,
        complete_steps: Mutex<VecDeque<Result<Completion>>>,
        models_seen: Mutex<Vec<String>>,
        requests_seen: Mutex<Vec<CompletionRequest>>,
        cancel_after: Mutex<Option<(usize, CancelToken)>>,
    }

    impl ScriptedBackend {
        fn stream_ok(self, events: Vec<Result<BackendEvent>>) -> Self {
            self.stream_steps.lock().push_back(Ok(events));
            self
        }

        fn stream_fail(self, error: Error) -> Self {
            self.stream_steps.lock().push_back(Err(error));
            self
        }

        fn complete_with(self, result: Result<Completion>) -> Self {
            self.complete_steps.lock().push_back(result);
            self
        }

        /// Cancel `token` as the stream produces the item at `index`,
        /// like a client disconnecting mid-stream.
        fn cancel_after_item(self, index: usize, token: CancelToken) -> Self {
            *self.cancel_after.lock() = Some((index, token));
            self
        }
    }

    #[async_trait::async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn stream(
            &self,
            req: &CompletionRequest,
        ) -> Result<BoxStream<'static, Result<BackendEvent>>> {
            self.models_seen.lock().push(req.model.clone());
            self.requests_seen.lock().push(req.clone());
            let step = self
                .stream_steps
                .lock()
                .pop_front()
                .expect("unexpected stream call");
            let cancel_after = self.cancel_after.lock().take();
            step.map(|events| {
                let stream = futures_util::stream::iter(events);
                match cancel_after {
                    Some((index, token)) => {
                        Box::pin(stream.enumerate().map(move |(i, event)| {
                            if i == index {
                                token.cancel();
                            }
                            event
                        })) as BoxStream<'static, Result<BackendEvent>>
                    }
                    None => Box::pin(stream) as BoxStream<'static, Result<BackendEvent>>,
                }
            })
        }

        async fn complete(&self, _req: &CompletionRequest) -> Result<Completion> {
            self.complete_steps
                .lock()
                .pop_front()
                .expect("unexpected complete call")
        }

        fn backend_id(&self) -> &str {
            "scripted"
        }
    }

    fn token(text: &str) -> Result<BackendEvent> {
        Ok(BackendEvent::Token { text: text.into() })
    }

    fn done(finish_reason: FinishReason) -> Result<BackendEvent> {
        Ok(BackendEvent::Done { finish_reason })
    }

    fn transient() -> Error {
        Error::BackendTransient {
            backend: "scripted".into(),
            message: "HTTP 503".into(),
        }
    }

    // ── Fixtures ─────────────────────────────────────────────────────

    fn seed_conversation(dir: &Path, id: &str) {
        let bundle = ConversationBundle::new(id);
        std::fs::write(
            dir.join(format!("{id}.json")),
            serde_json::to_string_pretty(&bundle).unwrap(),
        )
        .unwrap();
    }

    fn test_state(dir: &Path, backend: Option<Arc<dyn CompletionBackend>>) -> AppState {
        let mut config = Config::default();
        config.completion = CompletionConfig {
            backoff_ms: 0,
            stream: StreamTuning {
                delta_batch_size: 4,
                delta_delay_ms: 0,
            },
            ..Default::default()
        };
        AppState {
            config: Arc::new(config),
            store: Arc::new(ConversationStore::new(dir).unwrap()),
            backend,
            conversation_locks: Arc::new(ConversationLockMap::new()),
        }
    }

    fn input(id: &str, message: &str) -> TurnInput {
        TurnInput {
            conversation_id: id.into(),
            user_message: message.into(),
            requested_model: None,
            cancel: CancelToken::new(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn delta_concat(events: &[ChatEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::TextDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    // ── Tests ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn success_emits_exact_event_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::default()
                .stream_ok(vec![token("Hi"), token(" there"), done(FinishReason::Stop)]),
        );
        let state = test_state(dir.path(), Some(backend.clone()));
        seed_conversation(dir.path(), "conversation1");

        let rx = run_turn(state.clone(), input("conversation1", "hello"));
        let events = collect(rx).await;

        let kinds: Vec<&str> = events.iter().map(ChatEvent::kind).collect();
        assert_eq!(kinds[..3], ["start", "start-step", "text-start"]);
        assert_eq!(
            kinds[kinds.len() - 3..],
            ["text-end", "finish-step", "finish"]
        );
        assert!(kinds[3..kinds.len() - 3]
            .iter()
            .all(|k| *k == "text-delta"));
        assert_eq!(delta_concat(&events), "Hi there");
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Finish {
                finish_reason: FinishReason::Stop
            })
        );

        // The prompt and the completion are both persisted.
        let bundle = state.store.load("conversation1").unwrap();
        let roles: Vec<&str> = bundle.history().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant"]);
        assert_eq!(
            bundle.history().last().unwrap().text,
            "Hi there",
            "persisted text equals the delta concatenation"
        );

        // The wire request carried the system prompt and the user turn.
        let requests = backend.requests_seen.lock();
        assert_eq!(requests[0].messages[0].role, "system");
        assert_eq!(requests[0].latest_user_message(), Some("hello"));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let state = test_state(dir.path(), Some(backend));

        let rx = run_turn(state, input("ghost", "hello"));
        let events = collect(rx).await;

        assert_eq!(
            events,
            vec![ChatEvent::Error {
                message: "Conversation \"ghost\" was not found.".into()
            }]
        );
    }

    #[tokio::test]
    async fn blank_message_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let state = test_state(dir.path(), Some(backend));
        seed_conversation(dir.path(), "conversation1");

        let rx = run_turn(state, input("conversation1", "   "));
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "error");
    }

    #[tokio::test]
    async fn missing_credential_is_misconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = test_state(dir.path(), None);
        let mut config = (*state.config).clone();
        config.completion.api_key_env = "VERDANT_TEST_TURN_UNSET_KEY".into();
        state.config = Arc::new(config);
        seed_conversation(dir.path(), "conversation1");

        let rx = run_turn(state, input("conversation1", "hello"));
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            ChatEvent::Error { message } => {
                assert!(message.contains("VERDANT_TEST_TURN_UNSET_KEY"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failover_records_the_recovering_model() {
        let dir = tempfile::tempdir().unwrap();
        // First candidate (the fallback model, since nothing was
        // requested) fails twice with a retryable error, then the
        // default model answers.
        let backend = Arc::new(
            ScriptedBackend::default()
                .stream_fail(transient())
                .stream_fail(transient())
                .stream_ok(vec![token("ok"), done(FinishReason::Stop)]),
        );
        let state = test_state(dir.path(), Some(backend.clone()));
        seed_conversation(dir.path(), "conversation1");

        let rx = run_turn(state.clone(), input("conversation1", "hello"));
        let events = collect(rx).await;

        assert_eq!(events.last().map(ChatEvent::kind), Some("finish"));
        assert_eq!(
            *backend.models_seen.lock(),
            vec![
                "anthropic/claude-sonnet-4-5".to_string(),
                "anthropic/claude-sonnet-4-5".to_string(),
                "anthropic/claude-opus-4-5".to_string(),
            ]
        );

        let bundle = state.store.load("conversation1").unwrap();
        assert_eq!(bundle.model.name, "anthropic/claude-opus-4-5");
        assert_eq!(bundle.history().last().unwrap().text, "ok");
    }

    #[tokio::test]
    async fn fatal_error_advances_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::default()
                .stream_fail(Error::BackendFatal {
                    backend: "scripted".into(),
                    message: "invalid model".into(),
                })
                .stream_ok(vec![token("ok"), done(FinishReason::Stop)]),
        );
        let state = test_state(dir.path(), Some(backend.clone()));
        seed_conversation(dir.path(), "conversation1");

        let rx = run_turn(state, input("conversation1", "hello"));
        let events = collect(rx).await;

        assert_eq!(events.last().map(ChatEvent::kind), Some("finish"));
        // One attempt on the first candidate, one on the second.
        assert_eq!(backend.models_seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn no_failover_means_single_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default().stream_fail(transient()));
        let mut state = test_state(dir.path(), Some(backend.clone()));
        let mut config = (*state.config).clone();
        config.completion.failover = false;
        state.config = Arc::new(config);
        seed_conversation(dir.path(), "conversation1");

        let rx = run_turn(state.clone(), input("conversation1", "hello"));
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "error");
        assert_eq!(backend.models_seen.lock().len(), 1);

        // No assistant message was persisted.
        let bundle = state.store.load("conversation1").unwrap();
        assert!(bundle.history().all(|m| m.role != "assistant"));
    }

    #[tokio::test]
    async fn abort_before_start_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let state = test_state(dir.path(), Some(backend));
        seed_conversation(dir.path(), "conversation1");

        let mut turn = input("conversation1", "hello");
        turn.cancel.cancel();

        let rx = run_turn(state.clone(), turn);
        let events = collect(rx).await;

        assert!(events.is_empty());
        let bundle = state.store.load("conversation1").unwrap();
        assert_eq!(bundle.history().count(), 0);
    }

    #[tokio::test]
    async fn abort_mid_stream_persists_no_assistant_message() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        // The first token goes out, then the client disconnects before
        // the second one arrives.
        let backend = Arc::new(
            ScriptedBackend::default()
                .stream_ok(vec![token("Hi"), token(" there"), done(FinishReason::Stop)])
                .cancel_after_item(1, cancel.clone()),
        );
        let state = test_state(dir.path(), Some(backend));
        seed_conversation(dir.path(), "conversation1");

        let mut turn = input("conversation1", "hello");
        turn.cancel = cancel;

        let rx = run_turn(state.clone(), turn);
        let events = collect(rx).await;

        // Opening frames (and possibly a delta) may have gone out, but
        // the turn ends with neither a finish nor an error frame.
        assert!(events.iter().all(|e| e.kind() != "finish"));
        assert!(events.iter().all(|e| e.kind() != "error"));

        let bundle = state.store.load("conversation1").unwrap();
        assert!(
            bundle.history().all(|m| m.role != "assistant"),
            "an aborted turn must not persist a partial assistant message"
        );
    }

    #[tokio::test]
    async fn blank_model_config_surfaces_misconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let mut state = test_state(dir.path(), Some(backend));
        let mut config = (*state.config).clone();
        config.completion.default_model = String::new();
        config.completion.fallback_model = String::new();
        state.config = Arc::new(config);
        seed_conversation(dir.path(), "conversation1");

        let rx = run_turn(state, input("conversation1", "hello"));
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            ChatEvent::Error { message } => {
                assert!(message.contains("No completion model is configured"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_stream_retries_buffered_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::default()
                .stream_ok(vec![done(FinishReason::Stop)])
                .complete_with(Ok(Completion {
                    text: "Hello there".into(),
                    finish_reason: FinishReason::Stop,
                })),
        );
        let state = test_state(dir.path(), Some(backend));
        seed_conversation(dir.path(), "conversation1");

        let rx = run_turn(state.clone(), input("conversation1", "hello"));
        let events = collect(rx).await;

        assert_eq!(events.last().map(ChatEvent::kind), Some("finish"));
        assert_eq!(delta_concat(&events), "Hello there");

        let bundle = state.store.load("conversation1").unwrap();
        assert_eq!(bundle.history().last().unwrap().text, "Hello there");
    }

    #[tokio::test]
    async fn empty_buffered_fallback_surfaces_empty_response() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::default()
                .stream_ok(vec![done(FinishReason::Stop)])
                .complete_with(Err(Error::EmptyResponse("Dedalus".into()))),
        );
        let mut state = test_state(dir.path(), Some(backend));
        let mut config = (*state.config).clone();
        config.completion.failover = false;
        state.config = Arc::new(config);
        seed_conversation(dir.path(), "conversation1");

        let rx = run_turn(state.clone(), input("conversation1", "hello"));
        let events = collect(rx).await;

        assert_eq!(
            events,
            vec![ChatEvent::Error {
                message: "Dedalus returned an empty assistant response.".into()
            }]
        );
        let bundle = state.store.load("conversation1").unwrap();
        assert!(bundle.history().all(|m| m.role != "assistant"));
    }

    #[tokio::test]
    async fn requested_model_off_allow_list_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::default().stream_ok(vec![token("ok"), done(FinishReason::Stop)]),
        );
        let state = test_state(dir.path(), Some(backend.clone()));
        seed_conversation(dir.path(), "conversation1");

        let mut turn = input("conversation1", "hello");
        turn.requested_model = Some("mystery/model-9000".into());

        let rx = run_turn(state, turn);
        let events = collect(rx).await;

        assert_eq!(events.last().map(ChatEvent::kind), Some("finish"));
        assert_eq!(
            backend.models_seen.lock()[0],
            "anthropic/claude-sonnet-4-5",
            "disallowed request falls back to the configured chain"
        );
    }
}
