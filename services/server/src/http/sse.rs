//! Server-Sent-Events delivery mode.
//!
//! The response body is a sequence of `data` events (one per stored record)
//! each batch followed by a `control` event carrying the resume offset.
//! Text-compatible content types emit decoded UTF-8; anything else is
//! base64, advertised via `Stream-SSE-Data-Encoding: base64`. Payload lines
//! are split on `\r\n | \r | \n` before framing so a payload cannot inject
//! SSE fields.

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ds_protocol::{
    is_text_content_type, next_cursor, SseControl, HEADER_SSE_DATA_ENCODING, OFFSET_START,
};
use futures_util::Stream;
use std::convert::Infallible;

use super::query::ReadQuery;
use super::reads::wait_as_read;
use super::response::error_response;
use super::set_header;
use crate::state::AppState;
use crate::storage::{now_ms, Message};

/// GET `/{path}?live=sse`.
pub async fn serve_sse(state: AppState, path: String, query: ReadQuery) -> Response {
    // Resolve existence before committing to an event-stream response.
    let info = match state.manager.head(&path).await {
        Ok(info) => info,
        Err(e) => return error_response(e),
    };
    let text_mode = is_text_content_type(&info.content_type);

    let stream = event_loop(state, path, query, text_mode);
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    set_header(headers, "cache-control", "no-cache");
    set_header(headers, "connection", "keep-alive");
    if !text_mode {
        set_header(headers, HEADER_SSE_DATA_ENCODING, "base64");
    }
    response
}

fn event_loop(
    state: AppState,
    path: String,
    query: ReadQuery,
    text_mode: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        // `-1`/absent reads from the beginning; `now` resolves against the
        // tail on the first read below.
        let mut from: Option<String> = match query.offset.as_deref() {
            None | Some(OFFSET_START) => None,
            Some(other) => Some(other.to_owned()),
        };
        let mut cursor = query.cursor.clone();

        loop {
            if state.drain.is_cancelled() {
                break;
            }
            let read = match state.manager.read(&path, from.as_deref()).await {
                Ok(read) => read,
                // Deleted or expired mid-stream: end the response.
                Err(_) => break,
            };

            let batch = if read.messages.is_empty() && !read.closed {
                // Caught up: block for the next append, closure, or timeout.
                let baseline = read.next_offset.clone();
                from = Some(baseline.clone());
                match state
                    .manager
                    .wait_for_messages(&path, &baseline, &state.drain)
                    .await
                {
                    Ok(wait) => wait_as_read(wait),
                    Err(_) => break,
                }
            } else {
                read
            };

            for message in &batch.messages {
                yield Ok(data_event(message, text_mode));
            }

            let closed_at_tail = batch.closed_at_tail();
            from = Some(batch.next_offset.clone());
            cursor = Some(next_cursor(
                now_ms(),
                state.config.cursor_epoch_ms,
                state.config.cursor_interval_secs,
                cursor.as_deref(),
            ));
            let control = SseControl {
                stream_next_offset: batch.next_offset.clone(),
                stream_cursor: cursor.clone(),
                up_to_date: Some(batch.next_offset == batch.current_offset),
                stream_closed: closed_at_tail.then_some(true),
            };
            yield Ok(control_event(&control));

            if closed_at_tail {
                break;
            }
        }
    }
}

fn data_event(message: &Message, text_mode: bool) -> Event {
    let payload = if text_mode {
        normalize_newlines(&String::from_utf8_lossy(&message.bytes))
    } else {
        BASE64.encode(&message.bytes)
    };
    Event::default().event("data").data(payload)
}

fn control_event(control: &SseControl) -> Event {
    let body = serde_json::to_string(control).unwrap_or_else(|_| "{}".to_owned());
    Event::default().event("control").data(body)
}

/// Collapse `\r\n` and bare `\r` to `\n`; the SSE encoder then splits on
/// `\n` into one `data:` line each.
fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}
