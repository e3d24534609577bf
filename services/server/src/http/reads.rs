//! GET handler: catch-up reads, long-poll, ETag revalidation.

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ds_protocol::{
    format_etag, etag_matches, next_cursor, HEADER_STREAM_CLOSED, HEADER_STREAM_CURSOR,
    HEADER_STREAM_NEXT_OFFSET, HEADER_STREAM_UP_TO_DATE, OFFSET_START,
};

use super::query::{parse_read_query, LiveMode, ReadQuery};
use super::response::{bad_request, error_response};
use super::{headers, set_header, sse, stream_path};
use crate::framing::format_json_response;
use crate::manager::{ReadOutcome, WaitOutcome};
use crate::state::AppState;
use crate::storage::{now_ms, Message};

/// GET `/{path}?offset=&live=&cursor=`.
pub async fn get_stream(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
    request_headers: HeaderMap,
) -> Response {
    let path = stream_path(&path);
    let query = match parse_read_query(raw_query.as_deref()) {
        Ok(query) => query,
        Err(message) => return bad_request(message),
    };

    match query.live {
        None => catch_up(&state, &path, &query, &request_headers).await,
        Some(LiveMode::LongPoll) => long_poll(&state, &path, &query).await,
        Some(LiveMode::Sse) => sse::serve_sse(state, path, query).await,
    }
}

async fn catch_up(
    state: &AppState,
    path: &str,
    query: &ReadQuery,
    request_headers: &HeaderMap,
) -> Response {
    let read = match state.manager.read(path, query.offset.as_deref()).await {
        Ok(read) => read,
        Err(e) => return error_response(e),
    };
    let etag = format_etag(
        path,
        query.offset.as_deref().unwrap_or(OFFSET_START),
        &read.next_offset,
        read.closed_at_tail(),
    );
    if let Some(if_none_match) = headers::header_str(request_headers, "if-none-match") {
        if etag_matches(if_none_match, &etag) {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            set_header(response.headers_mut(), "etag", &etag);
            return response;
        }
    }
    data_response(state, query, &read, Some(&etag))
}

async fn long_poll(state: &AppState, path: &str, query: &ReadQuery) -> Response {
    // The offset is mandatory for live modes (query validation).
    let offset = query.offset.as_deref().unwrap_or(OFFSET_START);

    // Catch-up first: a client behind the tail gets data without waiting.
    let read = match state.manager.read(path, Some(offset)).await {
        Ok(read) => read,
        Err(e) => return error_response(e),
    };
    if !read.messages.is_empty() {
        return data_response(state, query, &read, None);
    }
    if read.closed_at_tail() {
        return empty_live_response(state, query, &read.next_offset, true);
    }

    // Wait from the tail resolved at request time, so an append landing
    // between the check and the wait is never skipped.
    let wait = match state
        .manager
        .wait_for_messages(path, &read.next_offset, &state.drain)
        .await
    {
        Ok(wait) => wait,
        Err(e) => return error_response(e),
    };
    if !wait.messages.is_empty() {
        return data_response(state, query, &wait_as_read(wait), None);
    }
    empty_live_response(state, query, &wait.next_offset, wait.closed_at_tail())
}

/// 200 with the assembled body and read-header vocabulary.
fn data_response(
    state: &AppState,
    query: &ReadQuery,
    read: &ReadOutcome,
    etag: Option<&str>,
) -> Response {
    let body = assemble_body(&read.content_type, &read.messages);
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    set_header(headers, "content-type", &read.content_type);
    set_header(headers, HEADER_STREAM_NEXT_OFFSET, &read.next_offset);
    set_header(headers, HEADER_STREAM_UP_TO_DATE, "true");
    if read.closed_at_tail() {
        set_header(headers, HEADER_STREAM_CLOSED, "true");
    }
    if let Some(etag) = etag {
        set_header(headers, "etag", etag);
    }
    add_cursor(state, query, headers);
    response
}

/// 204 for a long-poll timeout or closed-at-tail report.
fn empty_live_response(
    state: &AppState,
    query: &ReadQuery,
    next_offset: &str,
    closed: bool,
) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    set_header(headers, HEADER_STREAM_NEXT_OFFSET, next_offset);
    set_header(headers, HEADER_STREAM_UP_TO_DATE, "true");
    if closed {
        set_header(headers, HEADER_STREAM_CLOSED, "true");
    }
    add_cursor(state, query, headers);
    response
}

/// The cursor advances on every live response, and on catch-up responses
/// when the client sent one.
fn add_cursor(state: &AppState, query: &ReadQuery, headers: &mut HeaderMap) {
    if query.live.is_none() && query.cursor.is_none() {
        return;
    }
    let cursor = next_cursor(
        now_ms(),
        state.config.cursor_epoch_ms,
        state.config.cursor_interval_secs,
        query.cursor.as_deref(),
    );
    set_header(headers, HEADER_STREAM_CURSOR, &cursor);
}

/// Binary streams concatenate raw bytes; JSON streams emit one valid array.
pub(super) fn assemble_body(content_type: &str, messages: &[Message]) -> Vec<u8> {
    let raw: Vec<u8> = messages.iter().flat_map(|m| m.bytes.iter().copied()).collect();
    if content_type == "application/json" {
        format_json_response(&raw)
    } else {
        raw
    }
}

/// Shared by the SSE loop, which renders wait outcomes as read batches.
pub(super) fn wait_as_read(wait: WaitOutcome) -> ReadOutcome {
    ReadOutcome {
        messages: wait.messages,
        next_offset: wait.next_offset,
        current_offset: wait.current_offset,
        up_to_date: true,
        closed: wait.closed,
        content_type: wait.content_type,
    }
}
