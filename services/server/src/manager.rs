//! The stream manager: protocol semantics over a backend store.
//!
//! Everything a peer can observe — idempotent creation, the append
//! precondition chain, exactly-once producer state, Stream-Seq writer
//! coordination, JSON framing, closure, long-poll baselines — is decided
//! here. The store below persists bytes; the HTTP layer above encodes
//! statuses and headers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ds_protocol::{compare_offsets, normalize_content_type, OFFSET_NOW};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::framing::{self, JsonFramingError};
use crate::hooks::{HookError, LifecycleHooks, StreamCreated, StreamDeleted};
use crate::storage::{
    now_ms, AppendMeta, ClosedBy, Message, ProducerState, StoreError, StreamConfig, StreamInfo,
    StreamStore,
};

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

/// The `(Producer-Id, Producer-Epoch, Producer-Seq)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerTriple {
    pub id: String,
    pub epoch: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Raw `Content-Type` header value, if any.
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<String>,
    pub initial_data: Option<Vec<u8>>,
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub created: bool,
    pub next_offset: String,
    pub closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AppendRequest {
    /// Raw `Content-Type` header value, if any.
    pub content_type: Option<String>,
    pub producer: Option<ProducerTriple>,
    /// `Stream-Seq` writer-coordination watermark.
    pub stream_seq: Option<String>,
    /// `Stream-Closed: true` on the request.
    pub close: bool,
}

#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// Bytes (possibly zero, for a close) were committed.
    Appended {
        next_offset: String,
        producer_seq: Option<u64>,
        closed: bool,
    },
    /// Idempotent replay — nothing written.
    Duplicate {
        next_offset: String,
        producer_seq: u64,
        closed: bool,
    },
}

impl AppendOutcome {
    pub fn next_offset(&self) -> &str {
        match self {
            AppendOutcome::Appended { next_offset, .. }
            | AppendOutcome::Duplicate { next_offset, .. } => next_offset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub messages: Vec<Message>,
    pub next_offset: String,
    pub current_offset: String,
    /// Pagination beyond the tail is not modeled; reads always reach it.
    pub up_to_date: bool,
    pub closed: bool,
    pub content_type: String,
}

impl ReadOutcome {
    /// Closed streams advertise closure only once the caller is at the tail.
    pub fn closed_at_tail(&self) -> bool {
        self.closed && self.next_offset == self.current_offset
    }
}

#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub messages: Vec<Message>,
    pub next_offset: String,
    pub current_offset: String,
    pub timed_out: bool,
    pub closed: bool,
    pub content_type: String,
}

impl WaitOutcome {
    pub fn closed_at_tail(&self) -> bool {
        self.closed && self.next_offset == self.current_offset
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Typed protocol failures; the HTTP layer maps each kind to a status and
/// header set.
#[derive(Debug, thiserror::Error)]
pub enum StreamOpError {
    #[error("stream not found")]
    NotFound,
    #[error("stream already exists with a different configuration")]
    ConfigConflict,
    #[error("stream is closed")]
    StreamClosed { next_offset: String },
    #[error("content type mismatch: stream has {stream}")]
    ContentTypeMismatch { stream: String },
    #[error("stale producer epoch; current epoch is {current_epoch}")]
    StaleEpoch { current_epoch: u64 },
    #[error("producer sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },
    #[error("invalid producer epoch/sequence combination")]
    InvalidEpochSeq,
    #[error("stream sequence conflict")]
    SeqConflict,
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),
    #[error("empty JSON array appends are not allowed")]
    EmptyJsonArray,
    #[error("empty request body")]
    EmptyBody,
    #[error("lifecycle hook failed: {0}")]
    Hook(String),
    #[error("backend store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for StreamOpError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => StreamOpError::NotFound,
            other => StreamOpError::Store(other),
        }
    }
}

impl From<JsonFramingError> for StreamOpError {
    fn from(e: JsonFramingError) -> Self {
        match e {
            JsonFramingError::EmptyArray => StreamOpError::EmptyJsonArray,
            JsonFramingError::Invalid(msg) => StreamOpError::InvalidJson(msg),
        }
    }
}

impl From<HookError> for StreamOpError {
    fn from(e: HookError) -> Self {
        StreamOpError::Hook(e.0)
    }
}

// ---------------------------------------------------------------------------
// Producer validation (pure)
// ---------------------------------------------------------------------------

/// Validation decision for one producer write. No state mutation happens
/// here; the accepted state is proposed and committed with the append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProducerDecision {
    Accept { new_state: ProducerState },
    Duplicate,
    StaleEpoch { current_epoch: u64 },
    SequenceGap { expected: u64, received: u64 },
    InvalidEpochSeq,
}

pub(crate) fn validate_producer(
    existing: Option<&ProducerState>,
    epoch: u64,
    seq: u64,
    now: u64,
) -> ProducerDecision {
    let accept = |epoch, seq| ProducerDecision::Accept {
        new_state: ProducerState {
            epoch,
            last_seq: seq,
            last_updated_ms: now,
        },
    };
    let Some(state) = existing else {
        // Unknown producer: only a fresh sequence space is acceptable.
        if seq == 0 {
            return accept(epoch, 0);
        }
        return ProducerDecision::SequenceGap {
            expected: 0,
            received: seq,
        };
    };
    if epoch < state.epoch {
        return ProducerDecision::StaleEpoch {
            current_epoch: state.epoch,
        };
    }
    if epoch > state.epoch {
        // Epoch transitions reset the sequence space.
        if seq == 0 {
            return accept(epoch, 0);
        }
        return ProducerDecision::InvalidEpochSeq;
    }
    if seq <= state.last_seq {
        return ProducerDecision::Duplicate;
    }
    if seq == state.last_seq + 1 {
        return accept(epoch, seq);
    }
    ProducerDecision::SequenceGap {
        expected: state.last_seq + 1,
        received: seq,
    }
}

// ---------------------------------------------------------------------------
// StreamManager
// ---------------------------------------------------------------------------

pub struct StreamManager {
    store: Arc<dyn StreamStore>,
    hooks: Vec<Arc<dyn LifecycleHooks>>,
    long_poll_timeout: Duration,
    /// Per-(path, producer) validation lane: validation + append + commit is
    /// atomic with respect to other requests for the same producer key.
    producer_lanes: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl StreamManager {
    pub fn new(
        store: Arc<dyn StreamStore>,
        hooks: Vec<Arc<dyn LifecycleHooks>>,
        long_poll_timeout: Duration,
    ) -> Self {
        StreamManager {
            store,
            hooks,
            long_poll_timeout,
            producer_lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn long_poll_timeout(&self) -> Duration {
        self.long_poll_timeout
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    pub async fn create_stream(
        &self,
        path: &str,
        request: CreateRequest,
    ) -> Result<CreateOutcome, StreamOpError> {
        let normalized_ct = effective_content_type(request.content_type.as_deref());

        loop {
            let created = self
                .store
                .create(
                    path,
                    StreamConfig {
                        content_type: Some(normalized_ct.clone()),
                        ttl_seconds: request.ttl_seconds,
                        expires_at: request.expires_at.clone(),
                    },
                )
                .await?;
            if created {
                break;
            }
            // Existing, non-expired stream: idempotent only on config match.
            let Some(existing) = self.store.head(path).await? else {
                // Expired between the create and the head; retry.
                continue;
            };
            let matches = existing.content_type == normalized_ct
                && existing.ttl_seconds == request.ttl_seconds
                && existing.expires_at == request.expires_at
                && existing.closed == request.closed;
            if matches {
                return Ok(CreateOutcome {
                    created: false,
                    next_offset: existing.current_offset,
                    closed: existing.closed,
                });
            }
            return Err(StreamOpError::ConfigConflict);
        }

        let mut next_offset = ds_protocol::initial_offset();
        let stored = match request.initial_data.as_deref() {
            Some(data) if normalized_ct == "application/json" => {
                framing::process_json_append(data, true)?
            }
            Some(data) => data.to_vec(),
            None => Vec::new(),
        };
        if !stored.is_empty() || request.closed {
            next_offset = self
                .store
                .append(
                    path,
                    &stored,
                    AppendMeta {
                        close: request.closed,
                        ..AppendMeta::default()
                    },
                )
                .await?;
        }

        info!(path = %path, content_type = %normalized_ct, "stream created");
        let event = StreamCreated {
            path: path.to_owned(),
            content_type: normalized_ct,
            timestamp_ms: now_ms(),
        };
        for hook in &self.hooks {
            hook.on_stream_created(event.clone()).await?;
        }

        Ok(CreateOutcome {
            created: true,
            next_offset,
            closed: request.closed,
        })
    }

    // -----------------------------------------------------------------------
    // Append / close
    // -----------------------------------------------------------------------

    pub async fn append(
        &self,
        path: &str,
        body: &[u8],
        request: AppendRequest,
    ) -> Result<AppendOutcome, StreamOpError> {
        match &request.producer {
            Some(triple) => {
                let lane = self.producer_lane(path, &triple.id);
                let _guard = lane.lock().await;
                let result = self.append_inner(path, body, &request).await;
                self.release_producer_lane(path, &triple.id, &lane);
                result
            }
            None => self.append_inner(path, body, &request).await,
        }
    }

    async fn append_inner(
        &self,
        path: &str,
        body: &[u8],
        request: &AppendRequest,
    ) -> Result<AppendOutcome, StreamOpError> {
        // Preconditions run in a fixed order; the first failure wins.
        let info = self.store.head(path).await?.ok_or(StreamOpError::NotFound)?;

        if info.closed {
            if let (Some(triple), Some(closed_by)) = (&request.producer, &info.closed_by) {
                let is_replay = closed_by.producer_id == triple.id
                    && closed_by.epoch == triple.epoch
                    && closed_by.seq == triple.seq;
                if is_replay {
                    return Ok(AppendOutcome::Duplicate {
                        next_offset: info.current_offset,
                        producer_seq: triple.seq,
                        closed: true,
                    });
                }
            }
            return Err(StreamOpError::StreamClosed {
                next_offset: info.current_offset,
            });
        }

        if let Some(raw_ct) = request.content_type.as_deref() {
            let request_ct = normalize_content_type(raw_ct);
            if request_ct != info.content_type {
                return Err(StreamOpError::ContentTypeMismatch {
                    stream: info.content_type.clone(),
                });
            }
        }

        let mut proposed_producer = None;
        if let Some(triple) = &request.producer {
            let decision =
                validate_producer(info.producers.get(&triple.id), triple.epoch, triple.seq, now_ms());
            match decision {
                ProducerDecision::Accept { new_state } => {
                    proposed_producer = Some((triple.id.clone(), new_state));
                }
                ProducerDecision::Duplicate => {
                    debug!(path = %path, producer = %triple.id, seq = triple.seq, "duplicate producer write");
                    return Ok(AppendOutcome::Duplicate {
                        next_offset: info.current_offset,
                        producer_seq: triple.seq,
                        closed: info.closed,
                    });
                }
                ProducerDecision::StaleEpoch { current_epoch } => {
                    return Err(StreamOpError::StaleEpoch { current_epoch });
                }
                ProducerDecision::SequenceGap { expected, received } => {
                    return Err(StreamOpError::SequenceGap { expected, received });
                }
                ProducerDecision::InvalidEpochSeq => return Err(StreamOpError::InvalidEpochSeq),
            }
        }

        // Stream-Seq is a separate writer-coordination lane, checked after
        // producer validation so retries carrying both headers short-circuit
        // as producer duplicates above.
        if let (Some(seq), Some(last)) = (request.stream_seq.as_deref(), info.last_seq.as_deref()) {
            if seq <= last {
                return Err(StreamOpError::SeqConflict);
            }
        }

        if body.is_empty() && !request.close {
            return Err(StreamOpError::EmptyBody);
        }

        let stored = if !body.is_empty() && info.content_type == "application/json" {
            framing::process_json_append(body, false)?
        } else {
            body.to_vec()
        };

        let closed_by = if request.close {
            request.producer.as_ref().map(|t| ClosedBy {
                producer_id: t.id.clone(),
                epoch: t.epoch,
                seq: t.seq,
            })
        } else {
            None
        };
        let producer_seq = request.producer.as_ref().map(|t| t.seq);

        let next_offset = match self
            .store
            .append(
                path,
                &stored,
                AppendMeta {
                    producer: proposed_producer,
                    last_seq: request.stream_seq.clone(),
                    close: request.close,
                    closed_by,
                },
            )
            .await
        {
            Ok(offset) => offset,
            // A close won the per-stream lane between our head and the write.
            Err(StoreError::Closed) => {
                let info = self.store.head(path).await?.ok_or(StreamOpError::NotFound)?;
                return Err(StreamOpError::StreamClosed {
                    next_offset: info.current_offset,
                });
            }
            Err(e) => return Err(e.into()),
        };

        Ok(AppendOutcome::Appended {
            next_offset,
            producer_seq,
            closed: request.close,
        })
    }

    // -----------------------------------------------------------------------
    // Read / long-poll
    // -----------------------------------------------------------------------

    /// Catch-up read. `offset` is a canonical token, `now`, or `None`
    /// (beginning); validation happened at the HTTP layer.
    pub async fn read(&self, path: &str, offset: Option<&str>) -> Result<ReadOutcome, StreamOpError> {
        let info = self.store.head(path).await?.ok_or(StreamOpError::NotFound)?;
        let from = resolve_from(offset, &info);
        let read = self
            .store
            .read(path, from.as_deref())
            .await?
            .ok_or(StreamOpError::NotFound)?;
        let next_offset = read
            .messages
            .last()
            .map(|m| m.offset_after.clone())
            .unwrap_or_else(|| read.current_offset.clone());
        Ok(ReadOutcome {
            messages: read.messages,
            next_offset,
            current_offset: read.current_offset,
            up_to_date: true,
            closed: read.closed,
            content_type: info.content_type,
        })
    }

    /// Long-poll wait; the caller established that the client is caught up.
    pub async fn wait_for_messages(
        &self,
        path: &str,
        offset: &str,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, StreamOpError> {
        let info = self.store.head(path).await?.ok_or(StreamOpError::NotFound)?;
        let baseline = resolve_from(Some(offset), &info)
            .unwrap_or_else(ds_protocol::initial_offset);
        let wait = self
            .store
            .wait_for_data(path, &baseline, self.long_poll_timeout, cancel)
            .await?;
        let next_offset = wait
            .messages
            .last()
            .map(|m| m.offset_after.clone())
            .unwrap_or_else(|| wait.current_offset.clone());
        Ok(WaitOutcome {
            messages: wait.messages,
            next_offset,
            current_offset: wait.current_offset,
            timed_out: wait.timed_out,
            closed: wait.closed,
            content_type: info.content_type,
        })
    }

    // -----------------------------------------------------------------------
    // Head / delete / shutdown
    // -----------------------------------------------------------------------

    pub async fn head(&self, path: &str) -> Result<StreamInfo, StreamOpError> {
        self.store.head(path).await?.ok_or(StreamOpError::NotFound)
    }

    pub async fn delete_stream(&self, path: &str) -> Result<(), StreamOpError> {
        if !self.store.delete(path).await? {
            return Err(StreamOpError::NotFound);
        }
        info!(path = %path, "stream deleted");
        let event = StreamDeleted {
            path: path.to_owned(),
            timestamp_ms: now_ms(),
        };
        for hook in &self.hooks {
            hook.on_stream_deleted(event.clone()).await?;
        }
        Ok(())
    }

    /// Drain: cancel outstanding waiters and release store resources.
    pub async fn shutdown(&self) {
        self.store.close().await;
    }

    // -----------------------------------------------------------------------
    // Producer lanes
    // -----------------------------------------------------------------------

    fn producer_lane(&self, path: &str, producer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = (path.to_owned(), producer_id.to_owned());
        let mut lanes = self.producer_lanes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(lanes.entry(key).or_default())
    }

    fn release_producer_lane(
        &self,
        path: &str,
        producer_id: &str,
        lane: &Arc<tokio::sync::Mutex<()>>,
    ) {
        let key = (path.to_owned(), producer_id.to_owned());
        let mut lanes = self.producer_lanes.lock().unwrap_or_else(|e| e.into_inner());
        // Two strong refs means nobody else is queued on this lane: the map's
        // and ours. Dropping the entry keeps the map from growing unbounded.
        if Arc::strong_count(lane) == 2 {
            lanes.remove(&key);
        }
    }
}

/// Resolve a request offset against live stream state: `now` becomes the
/// current tail, and a token past the tail clamps to it (nothing can exist
/// beyond the tail).
fn resolve_from(offset: Option<&str>, info: &StreamInfo) -> Option<String> {
    match offset {
        None => None,
        Some(OFFSET_NOW) => Some(info.current_offset.clone()),
        Some(token) => {
            if compare_offsets(token, &info.current_offset) == std::cmp::Ordering::Greater {
                Some(info.current_offset.clone())
            } else {
                Some(token.to_owned())
            }
        }
    }
}

/// Normalized media type with the protocol default applied.
fn effective_content_type(raw: Option<&str>) -> String {
    match raw {
        Some(raw) => {
            let normalized = normalize_content_type(raw);
            if normalized.is_empty() {
                ds_protocol::DEFAULT_CONTENT_TYPE.to_owned()
            } else {
                normalized
            }
        }
        None => ds_protocol::DEFAULT_CONTENT_TYPE.to_owned(),
    }
}
