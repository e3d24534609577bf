//! Backend stores: opaque byte containers per stream path.
//!
//! A store persists bytes and metadata and exposes a minimal
//! read-from-offset API. It carries **no protocol semantics** — idempotency,
//! content-type matching, and JSON framing live in the stream manager. The
//! only client-visible conditions a store reports are "not found" and
//! "closed"; everything else is a server error.
//!
//! Two interchangeable variants:
//! - [`memory::MemoryStore`] — synchronous in-memory records, no durability.
//! - [`file::FileStore`] — segment files + embedded metadata store, with an
//!   fsync-before-metadata-commit durability contract and crash recovery.

pub mod file;
pub mod handles;
pub mod memory;
pub mod meta_db;
pub mod waiters;

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Creation-time stream configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamConfig {
    /// Normalized media type; `None` means the protocol default.
    pub content_type: Option<String>,
    /// Relative expiry. Mutually exclusive with `expires_at` (enforced by
    /// the HTTP layer before the store sees it).
    pub ttl_seconds: Option<u64>,
    /// Absolute expiry, ISO-8601.
    pub expires_at: Option<String>,
}

/// Per-producer exactly-once state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerState {
    pub epoch: u64,
    pub last_seq: u64,
    /// Unix millis of the last accepted write; entries idle longer than
    /// [`PRODUCER_RETENTION`] are pruned opportunistically.
    pub last_updated_ms: u64,
}

/// How long an idle producer entry is retained.
pub const PRODUCER_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Identity of the write that closed a stream, kept for idempotent replay of
/// the closing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedBy {
    pub producer_id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// Stream metadata as observed by `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub path: String,
    /// Normalized; never empty (defaulted at creation).
    pub content_type: String,
    /// Canonical offset token; monotonically non-decreasing.
    pub current_offset: String,
    pub created_at_ms: u64,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<String>,
    pub closed: bool,
    /// Stream-Seq watermark (writer coordination; distinct from producer seq).
    pub last_seq: Option<String>,
    pub producers: HashMap<String, ProducerState>,
    pub closed_by: Option<ClosedBy>,
}

/// One stored record, with the offset a reader resumes from after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub bytes: Vec<u8>,
    pub offset_after: String,
}

/// Result of a catch-up read.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Records strictly after the requested offset, in commit order.
    pub messages: Vec<Message>,
    pub current_offset: String,
    pub closed: bool,
}

/// Result of a blocking wait.
#[derive(Debug, Clone)]
pub struct WaitResult {
    pub messages: Vec<Message>,
    pub current_offset: String,
    pub closed: bool,
    pub timed_out: bool,
}

/// Metadata mutations committed atomically with an append.
#[derive(Debug, Clone, Default)]
pub struct AppendMeta {
    /// Proposed post-accept producer state, keyed by producer id.
    pub producer: Option<(String, ProducerState)>,
    /// New Stream-Seq watermark.
    pub last_seq: Option<String>,
    /// Close the stream with this append.
    pub close: bool,
    pub closed_by: Option<ClosedBy>,
}

/// Metadata-only update (no byte append).
#[derive(Debug, Clone, Default)]
pub struct MetaUpdate {
    pub closed: Option<bool>,
    pub last_seq: Option<String>,
    pub producers: Option<HashMap<String, ProducerState>>,
    pub closed_by: Option<ClosedBy>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Store-level failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("stream not found")]
    NotFound,
    #[error("stream is closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata store error: {0}")]
    Metadata(String),
    #[error("corrupt stream record: {0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// The backend store contract shared by the memory and file variants.
///
/// Per-stream appends are serialized inside the store (one writer at a time
/// per stream); reads run concurrently and observe a prefix of the log based
/// on the `current_offset` snapshot they see.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create a stream. Returns `true` if newly created, `false` if a
    /// non-expired stream already exists at the path (the caller compares
    /// configs).
    async fn create(&self, path: &str, config: StreamConfig) -> Result<bool, StoreError>;

    /// Metadata snapshot, or `None` for missing and expired streams.
    async fn head(&self, path: &str) -> Result<Option<StreamInfo>, StoreError>;

    /// Remove a stream and cancel its waiters. Returns `false` when nothing
    /// existed. Idempotent.
    async fn delete(&self, path: &str) -> Result<bool, StoreError>;

    /// Durable single-writer append; `meta` commits atomically with the
    /// bytes. Returns the new `current_offset`. Fails with
    /// [`StoreError::NotFound`] for missing/expired streams and
    /// [`StoreError::Closed`] when the stream closed concurrently.
    async fn append(
        &self,
        path: &str,
        bytes: &[u8],
        meta: AppendMeta,
    ) -> Result<String, StoreError>;

    /// Records strictly after `from_offset` (canonical token). `None` reads
    /// from the beginning.
    async fn read(
        &self,
        path: &str,
        from_offset: Option<&str>,
    ) -> Result<Option<ReadResult>, StoreError>;

    /// Block until bytes exist strictly after `from_offset`, the stream
    /// closes, the timeout elapses, or `cancel` fires (reported as a
    /// timeout-equivalent).
    async fn wait_for_data(
        &self,
        path: &str,
        from_offset: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitResult, StoreError>;

    /// Atomic metadata-only update; wakes waiters when `closed` transitions
    /// to true.
    async fn update(&self, path: &str, update: MetaUpdate) -> Result<(), StoreError>;

    /// Drop every stream. Test/bench hook.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Release resources and cancel all waiters.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Wall clock in unix millis.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lazy-expiry predicate applied on every store access.
///
/// An unparseable `expires_at` counts as expired (fail-closed).
pub fn is_expired(
    created_at_ms: u64,
    ttl_seconds: Option<u64>,
    expires_at: Option<&str>,
    now: u64,
) -> bool {
    if let Some(ttl) = ttl_seconds {
        if now >= created_at_ms.saturating_add(ttl.saturating_mul(1000)) {
            return true;
        }
    }
    if let Some(raw) = expires_at {
        match chrono::DateTime::parse_from_rfc3339(raw) {
            Ok(at) => {
                if now as i64 >= at.timestamp_millis() {
                    return true;
                }
            }
            Err(_) => return true,
        }
    }
    false
}

/// Drop producer entries idle past [`PRODUCER_RETENTION`].
pub fn prune_producers(producers: &mut HashMap<String, ProducerState>, now: u64) {
    let cutoff = now.saturating_sub(PRODUCER_RETENTION.as_millis() as u64);
    producers.retain(|_, state| state.last_updated_ms >= cutoff);
}
