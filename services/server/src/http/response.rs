//! Status and header mapping for protocol errors.
//!
//! Error bodies are short plain text; machine-readable state travels in
//! headers (`Producer-Epoch` on stale epoch, `Producer-Expected-Seq` /
//! `Producer-Received-Seq` on a gap, `Stream-Next-Offset` on a closed
//! conflict).

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use ds_protocol::{
    HEADER_PRODUCER_EPOCH, HEADER_PRODUCER_EXPECTED_SEQ, HEADER_PRODUCER_RECEIVED_SEQ,
    HEADER_STREAM_NEXT_OFFSET,
};
use tracing::error;

use crate::manager::StreamOpError;

pub type HttpResponse = Response;

pub fn bad_request(message: impl Into<String>) -> HttpResponse {
    (StatusCode::BAD_REQUEST, message.into()).into_response()
}

pub fn not_found(message: impl Into<String>) -> HttpResponse {
    (StatusCode::NOT_FOUND, message.into()).into_response()
}

pub fn conflict(message: impl Into<String>) -> HttpResponse {
    (StatusCode::CONFLICT, message.into()).into_response()
}

pub fn internal_error(err: impl std::fmt::Display) -> HttpResponse {
    // Detail goes to the log, not the client.
    error!(error = %err, "internal server error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal server error".to_owned(),
    )
        .into_response()
}

/// Map a typed manager failure to its response.
pub fn error_response(err: StreamOpError) -> HttpResponse {
    match err {
        StreamOpError::NotFound => not_found("stream not found"),
        StreamOpError::ConfigConflict => {
            conflict("stream already exists with a different configuration")
        }
        StreamOpError::StreamClosed { next_offset } => {
            let mut response = conflict("stream is closed");
            if let Ok(value) = HeaderValue::from_str(&next_offset) {
                response
                    .headers_mut()
                    .insert(HEADER_STREAM_NEXT_OFFSET, value);
            }
            response
        }
        StreamOpError::ContentTypeMismatch { stream } => {
            conflict(format!("content type mismatch: stream has {stream}"))
        }
        StreamOpError::StaleEpoch { current_epoch } => {
            let mut response =
                (StatusCode::FORBIDDEN, "stale producer epoch".to_owned()).into_response();
            if let Ok(value) = HeaderValue::from_str(&current_epoch.to_string()) {
                response.headers_mut().insert(HEADER_PRODUCER_EPOCH, value);
            }
            response
        }
        StreamOpError::SequenceGap { expected, received } => {
            let mut response = conflict(format!(
                "producer sequence gap: expected {expected}, received {received}"
            ));
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&expected.to_string()) {
                headers.insert(HEADER_PRODUCER_EXPECTED_SEQ, value);
            }
            if let Ok(value) = HeaderValue::from_str(&received.to_string()) {
                headers.insert(HEADER_PRODUCER_RECEIVED_SEQ, value);
            }
            response
        }
        StreamOpError::InvalidEpochSeq => {
            bad_request("invalid producer epoch/sequence combination")
        }
        StreamOpError::SeqConflict => conflict("stream sequence conflict"),
        StreamOpError::InvalidJson(msg) => bad_request(format!("invalid JSON body: {msg}")),
        StreamOpError::EmptyJsonArray => bad_request("empty JSON array appends are not allowed"),
        StreamOpError::EmptyBody => bad_request("empty request body"),
        StreamOpError::Hook(msg) => internal_error(format!("lifecycle hook failed: {msg}")),
        StreamOpError::Store(e) => internal_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_conflict_carries_the_resume_offset() {
        let response = error_response(StreamOpError::StreamClosed {
            next_offset: "0000000000000000_0000000000000004".to_owned(),
        });
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(HEADER_STREAM_NEXT_OFFSET).unwrap(),
            "0000000000000000_0000000000000004"
        );
    }

    #[test]
    fn stale_epoch_maps_to_403_with_current_epoch() {
        let response = error_response(StreamOpError::StaleEpoch { current_epoch: 5 });
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get(HEADER_PRODUCER_EPOCH).unwrap(), "5");
    }

    #[test]
    fn sequence_gap_maps_to_409_with_both_seq_headers() {
        let response = error_response(StreamOpError::SequenceGap {
            expected: 1,
            received: 2,
        });
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(HEADER_PRODUCER_EXPECTED_SEQ).unwrap(),
            "1"
        );
        assert_eq!(
            response.headers().get(HEADER_PRODUCER_RECEIVED_SEQ).unwrap(),
            "2"
        );
    }

    #[test]
    fn client_errors_map_to_400() {
        for err in [
            StreamOpError::InvalidEpochSeq,
            StreamOpError::InvalidJson("boom".to_owned()),
            StreamOpError::EmptyJsonArray,
            StreamOpError::EmptyBody,
        ] {
            assert_eq!(error_response(err).status(), StatusCode::BAD_REQUEST);
        }
    }
}
