//! HTTP surface: thin translation between requests and the stream manager.
//!
//! Handlers parse and validate, dispatch to the manager, and encode
//! statuses, headers, and (for SSE) event framing. All protocol decisions
//! live in the manager.

pub mod headers;
pub mod query;
pub mod reads;
pub mod response;
pub mod sse;
pub mod streams;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Insert a header, dropping values that cannot be encoded (offset tokens
/// and decimal counters always can).
pub(crate) fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Stream key for a wildcard-captured request path.
pub(crate) fn stream_path(captured: &str) -> String {
    format!("/{captured}")
}
