//! Shared SSE streaming plumbing for HTTP backends.
//!
//! The pattern: receive a `reqwest::Response`, buffer chunks, split on the
//! `\n\n` event boundary, extract `data:` payloads, and feed each payload to
//! a parser closure that returns zero or more backend events.

use verdant_domain::error::Result;
use verdant_domain::event::{BackendEvent, BoxStream, FinishReason};

use crate::util::from_reqwest;

/// Extract complete `data:` payloads from an SSE buffer.
///
/// Events are delimited by `\n\n`. An event block may carry `event:`,
/// `data:`, `id:`, or `retry:` lines; only `data:` lines matter here. The
/// buffer is drained in place, so a trailing partial event survives until
/// the next chunk arrives.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2); // remove the \n\n delimiter

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Build a [`BoxStream`] of backend events from an SSE response body and a
/// payload parser.
///
/// The stream buffers incoming chunks, drains complete events, flushes any
/// trailing partial event when the body closes, and appends a fallback
/// `Done` if the parser never produced one (some proxies drop `[DONE]`).
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    backend: String,
    mut parse_data: F,
) -> BoxStream<'static, Result<BackendEvent>>
where
    F: FnMut(&str) -> Vec<Result<BackendEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    for data in drain_data_lines(&mut buffer) {
                        for event in parse_data(&data) {
                            if matches!(&event, Ok(BackendEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    // Body ended; flush any trailing partial event.
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for event in parse_data(&data) {
                                if matches!(&event, Ok(BackendEvent::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(&backend, e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(BackendEvent::Done {
                finish_reason: FinishReason::Stop,
            });
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
