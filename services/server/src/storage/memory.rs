//! In-memory store variant.
//!
//! A map from path to an in-memory record. All operations complete without
//! I/O under a per-stream lock (one writer at a time; concurrent readers).
//! No durability — the file variant is the production backend; this one
//! serves tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ds_protocol::Offset;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::waiters::WaiterHub;
use super::{
    is_expired, now_ms, prune_producers, AppendMeta, ClosedBy, MetaUpdate, Message, ProducerState,
    ReadResult, StoreError, StreamConfig, StreamInfo, StreamStore, WaitResult,
};

struct Frame {
    bytes: Vec<u8>,
    /// Logical byte offset after this frame.
    end: u64,
}

struct MemoryStream {
    path: String,
    content_type: Option<String>,
    created_at_ms: u64,
    ttl_seconds: Option<u64>,
    expires_at: Option<String>,
    closed: bool,
    last_seq: Option<String>,
    producers: HashMap<String, ProducerState>,
    closed_by: Option<ClosedBy>,
    frames: Vec<Frame>,
    read_seq: u64,
    logical_end: u64,
}

impl MemoryStream {
    fn current_offset(&self) -> String {
        Offset {
            read_seq: self.read_seq,
            byte_offset: self.logical_end,
        }
        .to_string()
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            path: self.path.clone(),
            content_type: self
                .content_type
                .clone()
                .unwrap_or_else(|| ds_protocol::DEFAULT_CONTENT_TYPE.to_owned()),
            current_offset: self.current_offset(),
            created_at_ms: self.created_at_ms,
            ttl_seconds: self.ttl_seconds,
            expires_at: self.expires_at.clone(),
            closed: self.closed,
            last_seq: self.last_seq.clone(),
            producers: self.producers.clone(),
            closed_by: self.closed_by.clone(),
        }
    }

    fn is_expired_at(&self, now: u64) -> bool {
        is_expired(
            self.created_at_ms,
            self.ttl_seconds,
            self.expires_at.as_deref(),
            now,
        )
    }

    /// Frames strictly after the logical position `from`.
    fn messages_after(&self, from: u64) -> Vec<Message> {
        let start = self.frames.partition_point(|f| f.end <= from);
        self.frames[start..]
            .iter()
            .map(|f| Message {
                bytes: f.bytes.clone(),
                offset_after: Offset {
                    read_seq: self.read_seq,
                    byte_offset: f.end,
                }
                .to_string(),
            })
            .collect()
    }
}

/// The in-memory backend.
pub struct MemoryStore {
    streams: RwLock<HashMap<String, Arc<RwLock<MemoryStream>>>>,
    hub: Arc<WaiterHub>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            streams: RwLock::new(HashMap::new()),
            hub: WaiterHub::new(),
        }
    }

    /// Fetch the live record for `path`, lazily deleting it if expired.
    async fn live(&self, path: &str) -> Option<Arc<RwLock<MemoryStream>>> {
        let record = {
            let streams = self.streams.read().await;
            streams.get(path).cloned()
        }?;
        if record.read().await.is_expired_at(now_ms()) {
            self.streams.write().await.remove(path);
            self.hub.notify(path);
            return None;
        }
        Some(record)
    }

    fn parse_from(from_offset: Option<&str>) -> Result<u64, StoreError> {
        match from_offset {
            None => Ok(0),
            Some(s) => Offset::parse(s)
                .map(|o| o.byte_offset)
                .ok_or_else(|| StoreError::Corrupt(format!("non-canonical offset token: {s}"))),
        }
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn create(&self, path: &str, config: StreamConfig) -> Result<bool, StoreError> {
        let mut streams = self.streams.write().await;
        if let Some(existing) = streams.get(path) {
            if !existing.read().await.is_expired_at(now_ms()) {
                return Ok(false);
            }
            streams.remove(path);
            self.hub.notify(path);
        }
        streams.insert(
            path.to_owned(),
            Arc::new(RwLock::new(MemoryStream {
                path: path.to_owned(),
                content_type: config.content_type,
                created_at_ms: now_ms(),
                ttl_seconds: config.ttl_seconds,
                expires_at: config.expires_at,
                closed: false,
                last_seq: None,
                producers: HashMap::new(),
                closed_by: None,
                frames: Vec::new(),
                read_seq: 0,
                logical_end: 0,
            })),
        );
        Ok(true)
    }

    async fn head(&self, path: &str) -> Result<Option<StreamInfo>, StoreError> {
        match self.live(path).await {
            Some(record) => Ok(Some(record.read().await.info())),
            None => Ok(None),
        }
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let removed = self.streams.write().await.remove(path).is_some();
        if removed {
            self.hub.notify(path);
        }
        Ok(removed)
    }

    async fn append(
        &self,
        path: &str,
        bytes: &[u8],
        meta: AppendMeta,
    ) -> Result<String, StoreError> {
        let record = self.live(path).await.ok_or(StoreError::NotFound)?;
        let (offset, closed_now) = {
            let mut stream = record.write().await;
            if stream.closed {
                return Err(StoreError::Closed);
            }
            let now = now_ms();
            if !bytes.is_empty() {
                stream.logical_end += bytes.len() as u64;
                let end = stream.logical_end;
                stream.frames.push(Frame {
                    bytes: bytes.to_vec(),
                    end,
                });
            }
            if let Some((id, state)) = meta.producer {
                stream.producers.insert(id, state);
                prune_producers(&mut stream.producers, now);
            }
            if let Some(seq) = meta.last_seq {
                stream.last_seq = Some(seq);
            }
            if meta.close {
                stream.closed = true;
                stream.closed_by = meta.closed_by;
            }
            (stream.current_offset(), meta.close)
        };
        if closed_now {
            self.hub.notify_closed(path);
        } else {
            self.hub.notify(path);
        }
        Ok(offset)
    }

    async fn read(
        &self,
        path: &str,
        from_offset: Option<&str>,
    ) -> Result<Option<ReadResult>, StoreError> {
        let from = Self::parse_from(from_offset)?;
        let Some(record) = self.live(path).await else {
            return Ok(None);
        };
        let stream = record.read().await;
        Ok(Some(ReadResult {
            messages: stream.messages_after(from),
            current_offset: stream.current_offset(),
            closed: stream.closed,
        }))
    }

    async fn wait_for_data(
        &self,
        path: &str,
        from_offset: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitResult, StoreError> {
        let deadline = Instant::now() + timeout;
        // Register before the first read so a concurrent append cannot slip
        // between the check and the wait.
        let guard = self.hub.register(path);
        loop {
            let read = self
                .read(path, Some(from_offset))
                .await?
                .ok_or(StoreError::NotFound)?;
            if !read.messages.is_empty() || read.closed {
                return Ok(WaitResult {
                    messages: read.messages,
                    current_offset: read.current_offset,
                    closed: read.closed,
                    timed_out: false,
                });
            }
            if self.hub.is_draining() || Instant::now() >= deadline {
                return Ok(WaitResult {
                    messages: Vec::new(),
                    current_offset: read.current_offset,
                    closed: read.closed,
                    timed_out: true,
                });
            }
            tokio::select! {
                () = guard.notified() => {}
                () = tokio::time::sleep_until(deadline) => {}
                () = cancel.cancelled() => {
                    return Ok(WaitResult {
                        messages: Vec::new(),
                        current_offset: read.current_offset,
                        closed: read.closed,
                        timed_out: true,
                    });
                }
            }
        }
    }

    async fn update(&self, path: &str, update: MetaUpdate) -> Result<(), StoreError> {
        let record = self.live(path).await.ok_or(StoreError::NotFound)?;
        let closed_now = {
            let mut stream = record.write().await;
            let was_closed = stream.closed;
            if let Some(closed) = update.closed {
                // Terminal flag; never flips back.
                stream.closed = stream.closed || closed;
            }
            if let Some(seq) = update.last_seq {
                stream.last_seq = Some(seq);
            }
            if let Some(producers) = update.producers {
                stream.producers = producers;
            }
            if let Some(closed_by) = update.closed_by {
                stream.closed_by = Some(closed_by);
            }
            stream.closed && !was_closed
        };
        if closed_now {
            self.hub.notify_closed(path);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let paths: Vec<String> = {
            let mut streams = self.streams.write().await;
            let paths = streams.keys().cloned().collect();
            streams.clear();
            paths
        };
        for path in paths {
            self.hub.notify(&path);
        }
        Ok(())
    }

    async fn close(&self) {
        self.hub.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[tokio::test]
    async fn create_is_idempotent_at_the_store_level() {
        let s = store();
        assert!(s.create("/s", StreamConfig::default()).await.unwrap());
        assert!(!s.create("/s", StreamConfig::default()).await.unwrap());
    }

    #[tokio::test]
    async fn appends_advance_the_offset_by_logical_bytes() {
        let s = store();
        s.create("/s", StreamConfig::default()).await.unwrap();
        let o1 = s.append("/s", b"AB", AppendMeta::default()).await.unwrap();
        assert_eq!(o1, "0000000000000000_0000000000000002");
        let o2 = s.append("/s", b"CD", AppendMeta::default()).await.unwrap();
        assert_eq!(o2, "0000000000000000_0000000000000004");
    }

    #[tokio::test]
    async fn read_returns_records_strictly_after_the_offset() {
        let s = store();
        s.create("/s", StreamConfig::default()).await.unwrap();
        s.append("/s", b"AB", AppendMeta::default()).await.unwrap();
        let mid = s.append("/s", b"CD", AppendMeta::default()).await.unwrap();
        s.append("/s", b"EF", AppendMeta::default()).await.unwrap();

        let all = s.read("/s", None).await.unwrap().unwrap();
        assert_eq!(all.messages.len(), 3);
        assert_eq!(all.messages[0].bytes, b"AB");

        let tail = s.read("/s", Some(&mid)).await.unwrap().unwrap();
        assert_eq!(tail.messages.len(), 1);
        assert_eq!(tail.messages[0].bytes, b"EF");
        assert_eq!(tail.current_offset, "0000000000000000_0000000000000006");
    }

    #[tokio::test]
    async fn closed_streams_reject_further_appends() {
        let s = store();
        s.create("/s", StreamConfig::default()).await.unwrap();
        let meta = AppendMeta {
            close: true,
            ..AppendMeta::default()
        };
        s.append("/s", b"Z", meta).await.unwrap();
        let err = s.append("/s", b"more", AppendMeta::default()).await;
        assert!(matches!(err, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn expired_streams_read_as_absent() {
        let s = store();
        s.create(
            "/s",
            StreamConfig {
                ttl_seconds: Some(0),
                ..StreamConfig::default()
            },
        )
        .await
        .unwrap();
        assert!(s.head("/s").await.unwrap().is_none());
        assert!(s.read("/s", None).await.unwrap().is_none());
        assert!(matches!(
            s.append("/s", b"x", AppendMeta::default()).await,
            Err(StoreError::NotFound)
        ));
        // The path is immediately reusable.
        assert!(s.create("/s", StreamConfig::default()).await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_data_wakes_on_append() {
        let s = Arc::new(store());
        s.create("/s", StreamConfig::default()).await.unwrap();
        let baseline = s.head("/s").await.unwrap().unwrap().current_offset;

        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move {
                s.wait_for_data(
                    "/s",
                    &baseline,
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.append("/s", b"Z", AppendMeta::default()).await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert!(!result.timed_out);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].bytes, b"Z");
    }

    #[tokio::test]
    async fn wait_for_data_times_out_without_appends() {
        let s = store();
        s.create("/s", StreamConfig::default()).await.unwrap();
        let baseline = s.head("/s").await.unwrap().unwrap().current_offset;
        let result = s
            .wait_for_data(
                "/s",
                &baseline,
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(result.messages.is_empty());
    }

    #[tokio::test]
    async fn wait_for_data_returns_closed_immediately_at_tail() {
        let s = store();
        s.create("/s", StreamConfig::default()).await.unwrap();
        s.update(
            "/s",
            MetaUpdate {
                closed: Some(true),
                ..MetaUpdate::default()
            },
        )
        .await
        .unwrap();
        let tail = s.head("/s").await.unwrap().unwrap().current_offset;
        let result = s
            .wait_for_data("/s", &tail, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.closed);
        assert!(!result.timed_out);
        assert!(result.messages.is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_reported_as_timeout_equivalent() {
        let s = Arc::new(store());
        s.create("/s", StreamConfig::default()).await.unwrap();
        let baseline = s.head("/s").await.unwrap().unwrap().current_offset;
        let cancel = CancellationToken::new();
        let waiter = {
            let s = Arc::clone(&s);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                s.wait_for_data("/s", &baseline, Duration::from_secs(30), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = waiter.await.unwrap().unwrap();
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn delete_makes_waiters_observe_not_found() {
        let s = Arc::new(store());
        s.create("/s", StreamConfig::default()).await.unwrap();
        let baseline = s.head("/s").await.unwrap().unwrap().current_offset;
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move {
                s.wait_for_data(
                    "/s",
                    &baseline,
                    Duration::from_secs(30),
                    &CancellationToken::new(),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(s.delete("/s").await.unwrap());
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(StoreError::NotFound)));
    }
}
