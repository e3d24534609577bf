//! PUT / POST / DELETE / HEAD / OPTIONS handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ds_protocol::{
    format_etag, HEADER_PRODUCER_SEQ, HEADER_STREAM_CLOSED, HEADER_STREAM_NEXT_OFFSET,
};

use super::response::{bad_request, error_response};
use super::{headers, set_header, stream_path};
use crate::manager::{AppendOutcome, AppendRequest, CreateRequest};
use crate::state::AppState;

/// PUT `/{path}` — idempotent create.
pub async fn put_stream(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = stream_path(&path);
    let (ttl_seconds, expires_at) = match headers::expiry(&request_headers) {
        Ok(expiry) => expiry,
        Err(message) => return bad_request(message),
    };
    let request = CreateRequest {
        content_type: headers::content_type(&request_headers),
        ttl_seconds,
        expires_at,
        initial_data: (!body.is_empty()).then(|| body.to_vec()),
        closed: headers::close_requested(&request_headers),
    };

    let outcome = match state.manager.create_stream(&path, request).await {
        Ok(outcome) => outcome,
        Err(e) => return error_response(e),
    };

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let mut response = status.into_response();
    set_header(
        response.headers_mut(),
        HEADER_STREAM_NEXT_OFFSET,
        &outcome.next_offset,
    );
    if outcome.created {
        set_header(response.headers_mut(), "location", &path);
    }
    if outcome.closed {
        set_header(response.headers_mut(), HEADER_STREAM_CLOSED, "true");
    }
    response
}

/// POST `/{path}` — append or close.
pub async fn post_stream(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = stream_path(&path);
    let producer = match headers::producer_triple(&request_headers) {
        Ok(producer) => producer,
        Err(message) => return bad_request(message),
    };
    let close = headers::close_requested(&request_headers);
    let content_type = headers::content_type(&request_headers);

    if body.is_empty() && !close {
        return bad_request("empty request body");
    }
    if !body.is_empty() && content_type.is_none() {
        return bad_request("content-type is required");
    }

    let has_producer = producer.is_some();
    let request = AppendRequest {
        content_type,
        producer,
        stream_seq: headers::stream_seq(&request_headers),
        close,
    };

    match state.manager.append(&path, &body, request).await {
        Ok(AppendOutcome::Appended {
            next_offset,
            producer_seq,
            closed,
        }) => {
            let status = if has_producer {
                StatusCode::OK
            } else {
                StatusCode::NO_CONTENT
            };
            let mut response = status.into_response();
            set_header(response.headers_mut(), HEADER_STREAM_NEXT_OFFSET, &next_offset);
            if let Some(seq) = producer_seq {
                set_header(response.headers_mut(), HEADER_PRODUCER_SEQ, &seq.to_string());
            }
            if closed {
                set_header(response.headers_mut(), HEADER_STREAM_CLOSED, "true");
            }
            response
        }
        Ok(AppendOutcome::Duplicate {
            next_offset,
            producer_seq,
            closed,
        }) => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            set_header(response.headers_mut(), HEADER_STREAM_NEXT_OFFSET, &next_offset);
            set_header(
                response.headers_mut(),
                HEADER_PRODUCER_SEQ,
                &producer_seq.to_string(),
            );
            if closed {
                set_header(response.headers_mut(), HEADER_STREAM_CLOSED, "true");
            }
            response
        }
        Err(e) => error_response(e),
    }
}

/// DELETE `/{path}`.
pub async fn delete_stream(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let path = stream_path(&path);
    match state.manager.delete_stream(&path).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// HEAD `/{path}` — metadata only.
pub async fn head_stream(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let path = stream_path(&path);
    let info = match state.manager.head(&path).await {
        Ok(info) => info,
        Err(e) => return error_response(e),
    };
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    set_header(headers, HEADER_STREAM_NEXT_OFFSET, &info.current_offset);
    set_header(headers, "content-type", &info.content_type);
    if info.closed {
        set_header(headers, HEADER_STREAM_CLOSED, "true");
    }
    set_header(
        headers,
        "etag",
        &format_etag(&path, &info.current_offset, &info.current_offset, info.closed),
    );
    set_header(headers, "cache-control", "no-store");
    response
}

/// OPTIONS `/{path}` — preflight. CORS header production is a front-layer
/// concern; this only advertises the method surface.
pub async fn options_stream() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    set_header(
        response.headers_mut(),
        "allow",
        "GET, HEAD, PUT, POST, DELETE, OPTIONS",
    );
    response
}
