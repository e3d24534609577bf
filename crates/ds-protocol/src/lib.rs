// ds-protocol: Durable Streams wire-protocol types and pure helpers.
//
// Everything here is shared between the server and any protocol peer: header
// names, the offset token codec, the ETag scheme, and the CDN cursor rule.
// Nothing in this crate touches I/O or server state.

use std::cmp::Ordering;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Header names
// ---------------------------------------------------------------------------
//
// All custom headers are lowercase; HTTP header lookup is case-insensitive
// but these are the canonical serialized forms.

pub const HEADER_STREAM_NEXT_OFFSET: &str = "stream-next-offset";
pub const HEADER_STREAM_CURSOR: &str = "stream-cursor";
pub const HEADER_STREAM_UP_TO_DATE: &str = "stream-up-to-date";
pub const HEADER_STREAM_CLOSED: &str = "stream-closed";
pub const HEADER_STREAM_SEQ: &str = "stream-seq";
pub const HEADER_STREAM_TTL: &str = "stream-ttl";
pub const HEADER_STREAM_EXPIRES_AT: &str = "stream-expires-at";
pub const HEADER_SSE_DATA_ENCODING: &str = "stream-sse-data-encoding";

pub const HEADER_PRODUCER_ID: &str = "producer-id";
pub const HEADER_PRODUCER_EPOCH: &str = "producer-epoch";
pub const HEADER_PRODUCER_SEQ: &str = "producer-seq";
pub const HEADER_PRODUCER_EXPECTED_SEQ: &str = "producer-expected-seq";
pub const HEADER_PRODUCER_RECEIVED_SEQ: &str = "producer-received-seq";

/// Content type assumed when a stream is created without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Offset codec
// ---------------------------------------------------------------------------
//
// Canonical form: `SSSSSSSSSSSSSSSS_PPPPPPPPPPPPPPPP` — two 16-digit
// zero-padded decimals (read_seq, byte_offset).  Zero padding makes
// lexicographic order identical to numeric order, so peers compare tokens
// as plain strings.  Sentinels: "-1" (start) and "now" (live tail).

/// Sentinel meaning "read from the beginning of the stream".
pub const OFFSET_START: &str = "-1";
/// Sentinel meaning "the tail at the moment the request is handled".
pub const OFFSET_NOW: &str = "now";

const OFFSET_DIGITS: usize = 16;

/// A parsed offset token.
///
/// `read_seq` is a segment counter bumped only by retention events; the
/// server never increments it today but carries it through parsing and
/// comparison.  `byte_offset` counts logical (user-visible) bytes appended,
/// excluding on-disk framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub read_seq: u64,
    pub byte_offset: u64,
}

impl Offset {
    /// The canonical zero offset (start of stream).
    pub fn zero() -> Self {
        Offset {
            read_seq: 0,
            byte_offset: 0,
        }
    }

    /// Parse a canonical token.  Returns `None` for sentinels and anything
    /// else that is not exactly `\d{16}_\d{16}`.
    pub fn parse(s: &str) -> Option<Self> {
        let (seq, pos) = s.split_once('_')?;
        if seq.len() != OFFSET_DIGITS || pos.len() != OFFSET_DIGITS {
            return None;
        }
        if !seq.bytes().all(|b| b.is_ascii_digit()) || !pos.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Offset {
            read_seq: seq.parse().ok()?,
            byte_offset: pos.parse().ok()?,
        })
    }

    /// The offset `byte_count` logical bytes past this one.
    pub fn advance(self, byte_count: u64) -> Self {
        Offset {
            read_seq: self.read_seq,
            byte_offset: self.byte_offset + byte_count,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016}_{:016}",
            self.read_seq, self.byte_offset
        )
    }
}

/// Canonical zero-offset token.
pub fn initial_offset() -> String {
    Offset::zero().to_string()
}

/// True for the `"-1"` start sentinel.
pub fn is_start_sentinel(s: &str) -> bool {
    s == OFFSET_START
}

/// True for the `"now"` tail sentinel.
pub fn is_now_sentinel(s: &str) -> bool {
    s == OFFSET_NOW
}

/// True for `-1`, `now`, or a canonical token.
pub fn is_valid_offset(s: &str) -> bool {
    is_start_sentinel(s) || is_now_sentinel(s) || Offset::parse(s).is_some()
}

/// Rewrite the start sentinel to the canonical zero token.  `"now"` passes
/// through for the caller to resolve against the live tail.  Returns `None`
/// for malformed input (callers surface that as a 400).
pub fn normalize_offset(s: &str) -> Option<String> {
    if is_start_sentinel(s) {
        return Some(initial_offset());
    }
    if is_now_sentinel(s) {
        return Some(OFFSET_NOW.to_owned());
    }
    Offset::parse(s).map(|o| o.to_string())
}

/// Lexicographic compare of two canonical tokens.
///
/// Precondition: both are canonical (not sentinels).  Zero padding makes
/// string order equal to numeric order.
pub fn compare_offsets(a: &str, b: &str) -> Ordering {
    a.cmp(b)
}

// ---------------------------------------------------------------------------
// Content-type normalization
// ---------------------------------------------------------------------------

/// Normalize a media type for equality checks: parameters stripped,
/// lowercased, surrounding whitespace removed.
pub fn normalize_content_type(raw: &str) -> String {
    let media = raw.split(';').next().unwrap_or("");
    media.trim().to_ascii_lowercase()
}

/// True when SSE payloads of this content type are emitted as decoded UTF-8
/// rather than base64.
pub fn is_text_content_type(normalized: &str) -> bool {
    normalized.starts_with("text/") || normalized == "application/json"
}

// ---------------------------------------------------------------------------
// ETag scheme
// ---------------------------------------------------------------------------
//
// `base64(path) ":" startOffset ":" endOffset [":c"]`.  The ":c" suffix marks
// a response that conveyed closed-at-tail state, so open and closed replies
// at the same offsets never share an ETag.

/// Format the ETag for a read response over `[start, end]`.
pub fn format_etag(path: &str, start_offset: &str, end_offset: &str, closed_at_tail: bool) -> String {
    let mut tag = format!("{}:{}:{}", BASE64.encode(path), start_offset, end_offset);
    if closed_at_tail {
        tag.push_str(":c");
    }
    tag
}

/// Match an `If-None-Match` header value against the ETag the response would
/// carry.  Handles quoted tags, weak prefixes, comma-separated lists, and the
/// `*` wildcard.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match.split(',').any(|candidate| {
        let candidate = candidate.trim();
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        let candidate = candidate.trim_matches('"');
        candidate == "*" || candidate == etag
    })
}

// ---------------------------------------------------------------------------
// CDN cursor
// ---------------------------------------------------------------------------
//
// The cursor is an opaque decimal interval counter used to collapse CDN
// cache keys for long-poll requests.  It advances with wall time and must be
// monotonic per client even across server clock skew, hence the
// max(current, client + jitter) rule.

/// Default cursor interval (seconds).
pub const DEFAULT_CURSOR_INTERVAL_SECS: u64 = 20;
/// Default cursor epoch: 2024-10-09T00:00:00Z, in milliseconds.
pub const DEFAULT_CURSOR_EPOCH_MS: u64 = 1_728_432_000_000;

/// The interval counter for a wall-clock instant.
pub fn cursor_interval(now_ms: u64, epoch_ms: u64, interval_secs: u64) -> u64 {
    let elapsed_ms = now_ms.saturating_sub(epoch_ms);
    elapsed_ms / (interval_secs.max(1) * 1000)
}

/// Advance a cursor monotonically: `max(current, client + jitter_intervals)`.
///
/// Pure core of the cursor rule; the caller draws jitter.  A client cursor
/// that fails to parse is ignored (treated as absent).
pub fn advance_cursor(current: u64, client_cursor: Option<&str>, jitter_intervals: u64) -> u64 {
    match client_cursor.and_then(|c| c.trim().parse::<u64>().ok()) {
        Some(client) => current.max(client.saturating_add(jitter_intervals)),
        None => current,
    }
}

/// Produce the cursor token for a response.
///
/// Jitter is drawn uniformly from 1–3600 seconds and converted to whole
/// intervals (at least one) so a replayed client cursor always moves forward.
pub fn next_cursor(
    now_ms: u64,
    epoch_ms: u64,
    interval_secs: u64,
    client_cursor: Option<&str>,
) -> String {
    use rand::Rng;
    let jitter_secs: u64 = rand::thread_rng().gen_range(1..=3600);
    let jitter_intervals = (jitter_secs / interval_secs.max(1)).max(1);
    let current = cursor_interval(now_ms, epoch_ms, interval_secs);
    advance_cursor(current, client_cursor, jitter_intervals).to_string()
}

// ---------------------------------------------------------------------------
// SSE control event
// ---------------------------------------------------------------------------

/// Body of the `control` SSE event that follows each delivered batch.
///
/// Field names are part of the wire contract; peers parse the JSON keys
/// `streamNextOffset`, `streamCursor`, `upToDate`, `streamClosed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseControl {
    pub stream_next_offset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up_to_date: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_closed: Option<bool>,
}
