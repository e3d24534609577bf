//! Typed request-header accessors.
//!
//! Header lookup is case-insensitive at the HTTP layer; these helpers add
//! the protocol rules: the producer triple is all-or-nothing, TTL and
//! absolute expiry are mutually exclusive, and values must parse.

use axum::http::HeaderMap;
use ds_protocol::{
    HEADER_PRODUCER_EPOCH, HEADER_PRODUCER_ID, HEADER_PRODUCER_SEQ, HEADER_STREAM_CLOSED,
    HEADER_STREAM_EXPIRES_AT, HEADER_STREAM_SEQ, HEADER_STREAM_TTL,
};

use crate::manager::ProducerTriple;

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn content_type(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "content-type").map(str::to_owned)
}

/// `Stream-Closed: true` on the request.
pub fn close_requested(headers: &HeaderMap) -> bool {
    header_str(headers, HEADER_STREAM_CLOSED)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

pub fn stream_seq(headers: &HeaderMap) -> Option<String> {
    header_str(headers, HEADER_STREAM_SEQ).map(str::to_owned)
}

/// Extract the producer triple. All three headers must be present together;
/// a partial or unparseable set is a client error.
pub fn producer_triple(headers: &HeaderMap) -> Result<Option<ProducerTriple>, String> {
    let id = header_str(headers, HEADER_PRODUCER_ID);
    let epoch = header_str(headers, HEADER_PRODUCER_EPOCH);
    let seq = header_str(headers, HEADER_PRODUCER_SEQ);
    match (id, epoch, seq) {
        (None, None, None) => Ok(None),
        (Some(id), Some(epoch), Some(seq)) => {
            if id.is_empty() {
                return Err("producer-id must not be empty".to_owned());
            }
            let epoch: u64 = epoch
                .parse()
                .map_err(|_| format!("invalid producer-epoch: {epoch}"))?;
            let seq: u64 = seq
                .parse()
                .map_err(|_| format!("invalid producer-seq: {seq}"))?;
            Ok(Some(ProducerTriple {
                id: id.to_owned(),
                epoch,
                seq,
            }))
        }
        _ => Err(
            "producer-id, producer-epoch and producer-seq must be sent together".to_owned(),
        ),
    }
}

/// Extract `(ttl_seconds, expires_at)` from the creation headers.
pub fn expiry(headers: &HeaderMap) -> Result<(Option<u64>, Option<String>), String> {
    let ttl = header_str(headers, HEADER_STREAM_TTL);
    let expires = header_str(headers, HEADER_STREAM_EXPIRES_AT);
    if ttl.is_some() && expires.is_some() {
        return Err("stream-ttl and stream-expires-at are mutually exclusive".to_owned());
    }
    let ttl_seconds = match ttl {
        None => None,
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| format!("invalid stream-ttl: {raw}"))?,
        ),
    };
    let expires_at = match expires {
        None => None,
        Some(raw) => {
            chrono::DateTime::parse_from_rfc3339(raw)
                .map_err(|_| format!("invalid stream-expires-at: {raw}"))?;
            Some(raw.to_owned())
        }
    };
    Ok((ttl_seconds, expires_at))
}
