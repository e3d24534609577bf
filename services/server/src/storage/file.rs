//! File-backed store variant.
//!
//! # Layout
//! - `${data_dir}/metadata.sqlite3` — key-value metadata store
//!   ([`MetaDb`]), keys `stream:<path>`, values serialized [`StoredStream`].
//! - `${data_dir}/streams/<directory_name>/segment_00000.log` — one
//!   append-only segment per stream incarnation. `directory_name` embeds the
//!   creation time and 32 bits of entropy so deletion can run asynchronously
//!   while the path is immediately reusable.
//!
//! # Framing
//! Each append writes `u32 BE length || payload || 0x0A`. The 5 framing
//! bytes count toward `total_bytes` (physical) but not toward the logical
//! byte offset in the token — offsets address the user-visible byte stream.
//!
//! # Durability contract
//! An acknowledged append means: frame written, `fdatasync` completed, then
//! metadata committed (synchronous=FULL). A crash between fsync and the
//! metadata commit leaves the file ahead of the metadata; recovery rescans
//! segments and rewrites metadata to the file's true offset.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ds_protocol::Offset;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::handles::SieveCache;
use super::meta_db::{MetaDb, STREAM_KEY_PREFIX};
use super::waiters::WaiterHub;
use super::{
    is_expired, now_ms, prune_producers, AppendMeta, ClosedBy, MetaUpdate, Message, ProducerState,
    ReadResult, StoreError, StreamConfig, StreamInfo, StreamStore, WaitResult,
};

const SEGMENT_FILE: &str = "segment_00000.log";
const FRAME_OVERHEAD: u64 = 5;

/// Tuning knobs for the file backend.
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    /// Capacity of the append-handle cache.
    pub handle_cache_capacity: usize,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        FileStoreOptions {
            handle_cache_capacity: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted record
// ---------------------------------------------------------------------------

/// The metadata value stored per stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredStream {
    path: String,
    content_type: Option<String>,
    current_offset: String,
    created_at_ms: u64,
    ttl_seconds: Option<u64>,
    expires_at: Option<String>,
    closed: bool,
    last_seq: Option<String>,
    producers: HashMap<String, ProducerState>,
    closed_by: Option<ClosedBy>,
    directory_name: String,
    /// Rotation hook; always 1 today.
    segment_count: u32,
    /// Physical segment bytes, framing included.
    total_bytes: u64,
}

impl StoredStream {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            path: self.path.clone(),
            content_type: self
                .content_type
                .clone()
                .unwrap_or_else(|| ds_protocol::DEFAULT_CONTENT_TYPE.to_owned()),
            current_offset: self.current_offset.clone(),
            created_at_ms: self.created_at_ms,
            ttl_seconds: self.ttl_seconds,
            expires_at: self.expires_at.clone(),
            closed: self.closed,
            last_seq: self.last_seq.clone(),
            producers: self.producers.clone(),
            closed_by: self.closed_by.clone(),
        }
    }

    fn offset(&self) -> Offset {
        Offset::parse(&self.current_offset).unwrap_or_else(Offset::zero)
    }
}

// ---------------------------------------------------------------------------
// Per-stream runtime state
// ---------------------------------------------------------------------------

/// Payload location of one frame within the segment file.
#[derive(Debug, Clone, Copy)]
struct FrameEntry {
    payload_pos: u64,
    len: u32,
    logical_end: u64,
}

struct StreamRuntime {
    /// Per-stream append lane: one writer at a time.
    append_lane: tokio::sync::Mutex<()>,
    /// Frame boundaries, oldest first. Readers snapshot a suffix.
    index: std::sync::RwLock<Vec<FrameEntry>>,
}

impl StreamRuntime {
    fn new(index: Vec<FrameEntry>) -> Arc<Self> {
        Arc::new(StreamRuntime {
            append_lane: tokio::sync::Mutex::new(()),
            index: std::sync::RwLock::new(index),
        })
    }
}

type Handle = Arc<tokio::sync::Mutex<tokio::fs::File>>;

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// The durable file-backed backend.
pub struct FileStore {
    data_dir: PathBuf,
    meta: Mutex<MetaDb>,
    hub: Arc<WaiterHub>,
    handles: Mutex<SieveCache<String, Handle>>,
    runtime: RwLock<HashMap<String, Arc<StreamRuntime>>>,
}

impl FileStore {
    /// Open the store, running crash recovery over every metadata record.
    pub fn open(data_dir: &Path, options: FileStoreOptions) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir.join("streams"))?;
        let meta = MetaDb::open(&data_dir.join("metadata.sqlite3")).map_err(StoreError::from)?;

        let mut runtime = HashMap::new();
        let records = meta.list_prefix(STREAM_KEY_PREFIX).map_err(StoreError::from)?;
        for (key, value) in records {
            let Ok(mut record) = serde_json::from_str::<StoredStream>(&value) else {
                warn!(key = %key, "dropping unreadable stream record");
                meta.delete(&key).map_err(StoreError::from)?;
                continue;
            };
            let segment = data_dir
                .join("streams")
                .join(&record.directory_name)
                .join(SEGMENT_FILE);
            let Ok(file) = std::fs::File::open(&segment) else {
                warn!(path = %record.path, "segment file missing; removing stream record");
                meta.delete(&key).map_err(StoreError::from)?;
                continue;
            };
            let scan = scan_segment(file)?;
            if scan.truncated_at.is_some() {
                // Discard the trailing partial frame so future appends start
                // at a clean boundary.
                let good = scan.physical_len;
                let f = std::fs::OpenOptions::new().write(true).open(&segment)?;
                f.set_len(good)?;
                warn!(path = %record.path, physical = good, "truncated partial trailing frame");
            }
            // The file's true offset is authoritative.
            let true_offset = Offset {
                read_seq: record.offset().read_seq,
                byte_offset: scan.logical_len,
            }
            .to_string();
            if record.current_offset != true_offset || record.total_bytes != scan.physical_len {
                info!(
                    path = %record.path,
                    stored = %record.current_offset,
                    actual = %true_offset,
                    "re-syncing stream metadata to segment contents"
                );
                record.current_offset = true_offset;
                record.total_bytes = scan.physical_len;
                let serialized =
                    serde_json::to_string(&record).map_err(|e| StoreError::Metadata(e.to_string()))?;
                meta.put(&key, &serialized).map_err(StoreError::from)?;
            }
            runtime.insert(record.path.clone(), StreamRuntime::new(scan.frames));
        }

        Ok(FileStore {
            data_dir: data_dir.to_owned(),
            meta: Mutex::new(meta),
            hub: WaiterHub::new(),
            handles: Mutex::new(SieveCache::new(options.handle_cache_capacity)),
            runtime: RwLock::new(runtime),
        })
    }

    fn stream_key(path: &str) -> String {
        format!("{STREAM_KEY_PREFIX}{path}")
    }

    fn segment_path(&self, directory_name: &str) -> PathBuf {
        self.data_dir
            .join("streams")
            .join(directory_name)
            .join(SEGMENT_FILE)
    }

    fn meta_get(&self, path: &str) -> Result<Option<StoredStream>, StoreError> {
        let db = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        let Some(raw) = db.get(&Self::stream_key(path)).map_err(StoreError::from)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("stream record for {path}: {e}")))
    }

    fn meta_put(&self, record: &StoredStream) -> Result<(), StoreError> {
        let serialized =
            serde_json::to_string(record).map_err(|e| StoreError::Metadata(e.to_string()))?;
        let db = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        db.put(&Self::stream_key(&record.path), &serialized)
            .map_err(StoreError::from)
    }

    /// Load the record for `path`, lazily deleting it when expired.
    async fn live_meta(&self, path: &str) -> Result<Option<StoredStream>, StoreError> {
        let Some(record) = self.meta_get(path)? else {
            return Ok(None);
        };
        if is_expired(
            record.created_at_ms,
            record.ttl_seconds,
            record.expires_at.as_deref(),
            now_ms(),
        ) {
            self.remove_stream(path, Some(&record.directory_name)).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Remove a stream's metadata, runtime state, handle, and (async) its
    /// directory.
    async fn remove_stream(
        &self,
        path: &str,
        directory_name: Option<&str>,
    ) -> Result<bool, StoreError> {
        let existed = {
            let db = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            db.delete(&Self::stream_key(path)).map_err(StoreError::from)?
        };
        self.runtime.write().await.remove(path);
        let dropped_handle = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path.to_owned());
        drop(dropped_handle);
        if let Some(dir) = directory_name {
            let target = self.data_dir.join("streams").join(dir);
            tokio::spawn(async move {
                if let Err(e) = tokio::fs::remove_dir_all(&target).await {
                    warn!(dir = %target.display(), error = %e, "stream directory cleanup failed");
                }
            });
        }
        self.hub.notify(path);
        Ok(existed)
    }

    async fn get_runtime(&self, path: &str) -> Option<Arc<StreamRuntime>> {
        self.runtime.read().await.get(path).cloned()
    }

    /// Runtime state for a stream known to exist in metadata, rebuilding the
    /// frame index from the segment if needed.
    async fn ensure_runtime(
        &self,
        path: &str,
        record: &StoredStream,
    ) -> Result<Arc<StreamRuntime>, StoreError> {
        if let Some(rt) = self.get_runtime(path).await {
            return Ok(rt);
        }
        let segment = self.segment_path(&record.directory_name);
        let frames = match std::fs::File::open(&segment) {
            Ok(file) => scan_segment(file)?.frames,
            Err(_) => Vec::new(),
        };
        let mut map = self.runtime.write().await;
        Ok(Arc::clone(
            map.entry(path.to_owned())
                .or_insert_with(|| StreamRuntime::new(frames)),
        ))
    }

    async fn get_or_open_handle(
        &self,
        path: &str,
        directory_name: &str,
    ) -> Result<Handle, StoreError> {
        if let Some(handle) = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path.to_owned())
        {
            return Ok(Arc::clone(handle));
        }
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.segment_path(directory_name))
            .await?;
        let handle: Handle = Arc::new(tokio::sync::Mutex::new(file));
        let evicted = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_owned(), Arc::clone(&handle));
        // Dropping the evicted handle closes it; close errors are not the
        // evicting append's problem.
        drop(evicted);
        Ok(handle)
    }

    async fn read_frames(
        &self,
        record: &StoredStream,
        entries: &[FrameEntry],
    ) -> Result<Vec<Message>, StoreError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let read_seq = record.offset().read_seq;
        let mut file = tokio::fs::File::open(self.segment_path(&record.directory_name)).await?;
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            file.seek(std::io::SeekFrom::Start(entry.payload_pos)).await?;
            let mut bytes = vec![0u8; entry.len as usize];
            file.read_exact(&mut bytes).await?;
            messages.push(Message {
                bytes,
                offset_after: Offset {
                    read_seq,
                    byte_offset: entry.logical_end,
                }
                .to_string(),
            });
        }
        Ok(messages)
    }
}

#[async_trait]
impl StreamStore for FileStore {
    async fn create(&self, path: &str, config: StreamConfig) -> Result<bool, StoreError> {
        if let Some(existing) = self.meta_get(path)? {
            if !is_expired(
                existing.created_at_ms,
                existing.ttl_seconds,
                existing.expires_at.as_deref(),
                now_ms(),
            ) {
                return Ok(false);
            }
            self.remove_stream(path, Some(&existing.directory_name)).await?;
        }

        let created_at_ms = now_ms();
        let directory_name = directory_name_for(path, created_at_ms);
        let dir = self.data_dir.join("streams").join(&directory_name);
        tokio::fs::create_dir_all(&dir).await?;
        // Create the segment eagerly: recovery treats a missing segment as a
        // lost stream.
        tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(dir.join(SEGMENT_FILE))
            .await?;

        let record = StoredStream {
            path: path.to_owned(),
            content_type: config.content_type,
            current_offset: ds_protocol::initial_offset(),
            created_at_ms,
            ttl_seconds: config.ttl_seconds,
            expires_at: config.expires_at,
            closed: false,
            last_seq: None,
            producers: HashMap::new(),
            closed_by: None,
            directory_name,
            segment_count: 1,
            total_bytes: 0,
        };
        self.meta_put(&record)?;
        self.runtime
            .write()
            .await
            .insert(path.to_owned(), StreamRuntime::new(Vec::new()));
        Ok(true)
    }

    async fn head(&self, path: &str) -> Result<Option<StreamInfo>, StoreError> {
        Ok(self.live_meta(path).await?.map(|r| r.info()))
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let directory = self.meta_get(path)?.map(|r| r.directory_name);
        self.remove_stream(path, directory.as_deref()).await
    }

    async fn append(
        &self,
        path: &str,
        bytes: &[u8],
        meta: AppendMeta,
    ) -> Result<String, StoreError> {
        let Some(record) = self.live_meta(path).await? else {
            return Err(StoreError::NotFound);
        };
        let runtime = self.ensure_runtime(path, &record).await?;
        let _lane = runtime.append_lane.lock().await;

        // Re-check under the lane: a concurrent close or expiry may have won.
        let mut record = self.live_meta(path).await?.ok_or(StoreError::NotFound)?;
        if record.closed {
            return Err(StoreError::Closed);
        }

        let mut new_entry = None;
        if !bytes.is_empty() {
            let mut frame = Vec::with_capacity(bytes.len() + FRAME_OVERHEAD as usize);
            frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            frame.extend_from_slice(bytes);
            frame.push(0x0A);

            let handle = self.get_or_open_handle(path, &record.directory_name).await?;
            {
                let mut file = handle.lock().await;
                file.write_all(&frame).await?;
                // Durability contract: bytes reach the platter before the
                // metadata commit makes them observable.
                file.sync_data().await?;
            }
            new_entry = Some(FrameEntry {
                payload_pos: record.total_bytes + 4,
                len: bytes.len() as u32,
                logical_end: record.offset().byte_offset + bytes.len() as u64,
            });
            record.total_bytes += frame.len() as u64;
            record.current_offset = record.offset().advance(bytes.len() as u64).to_string();
        }

        let now = now_ms();
        if let Some((id, state)) = meta.producer {
            record.producers.insert(id, state);
            prune_producers(&mut record.producers, now);
        }
        if let Some(seq) = meta.last_seq {
            record.last_seq = Some(seq);
        }
        if meta.close {
            record.closed = true;
            record.closed_by = meta.closed_by;
        }
        self.meta_put(&record)?;

        if let Some(entry) = new_entry {
            runtime
                .index
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(entry);
        }
        if meta.close {
            self.hub.notify_closed(path);
        } else {
            self.hub.notify(path);
        }
        Ok(record.current_offset)
    }

    async fn read(
        &self,
        path: &str,
        from_offset: Option<&str>,
    ) -> Result<Option<ReadResult>, StoreError> {
        let from = match from_offset {
            None => 0,
            Some(s) => Offset::parse(s)
                .map(|o| o.byte_offset)
                .ok_or_else(|| StoreError::Corrupt(format!("non-canonical offset token: {s}")))?,
        };
        let Some(record) = self.live_meta(path).await? else {
            return Ok(None);
        };
        let runtime = self.ensure_runtime(path, &record).await?;
        let entries: Vec<FrameEntry> = {
            let index = runtime.index.read().unwrap_or_else(|e| e.into_inner());
            let start = index.partition_point(|f| f.logical_end <= from);
            index[start..].to_vec()
        };
        let messages = self.read_frames(&record, &entries).await?;
        Ok(Some(ReadResult {
            messages,
            current_offset: record.current_offset,
            closed: record.closed,
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
        let record = self.live_meta(path).await?.ok_or(StoreError::NotFound)?;
        // Metadata read-modify-write shares the append lane.
        let runtime = self.ensure_runtime(path, &record).await?;
        let _lane = runtime.append_lane.lock().await;
        let mut record = self.live_meta(path).await?.ok_or(StoreError::NotFound)?;
        let was_closed = record.closed;
        if let Some(closed) = update.closed {
            // Terminal flag; never flips back.
            record.closed = record.closed || closed;
        }
        if let Some(seq) = update.last_seq {
            record.last_seq = Some(seq);
        }
        if let Some(producers) = update.producers {
            record.producers = producers;
        }
        if let Some(closed_by) = update.closed_by {
            record.closed_by = Some(closed_by);
        }
        let closed_now = record.closed && !was_closed;
        self.meta_put(&record)?;
        if closed_now {
            self.hub.notify_closed(path);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let paths: Vec<String> = {
            let db = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            let rows = db.list_prefix(STREAM_KEY_PREFIX).map_err(StoreError::from)?;
            db.clear_prefix(STREAM_KEY_PREFIX).map_err(StoreError::from)?;
            rows.into_iter()
                .map(|(k, _)| k[STREAM_KEY_PREFIX.len()..].to_owned())
                .collect()
        };
        self.runtime.write().await.clear();
        let handles = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain_all();
        drop(handles);
        let streams_dir = self.data_dir.join("streams");
        tokio::spawn(async move {
            let _ = tokio::fs::remove_dir_all(&streams_dir).await;
            let _ = tokio::fs::create_dir_all(&streams_dir).await;
        });
        for path in paths {
            self.hub.notify(&path);
        }
        Ok(())
    }

    async fn close(&self) {
        self.hub.drain();
        let handles = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain_all();
        drop(handles);
    }
}

// ---------------------------------------------------------------------------
// Segment scanning (recovery)
// ---------------------------------------------------------------------------

struct SegmentScan {
    frames: Vec<FrameEntry>,
    /// Logical bytes across complete frames.
    logical_len: u64,
    /// Physical length of the valid region.
    physical_len: u64,
    /// Physical position where a partial frame begins, if one was found.
    truncated_at: Option<u64>,
}

/// Scan a segment file, tolerating a truncated trailing frame.
fn scan_segment(mut file: std::fs::File) -> Result<SegmentScan, StoreError> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut frames = Vec::new();
    let mut pos: u64 = 0;
    let mut logical: u64 = 0;
    let len = buf.len() as u64;
    loop {
        let remaining = len - pos;
        if remaining == 0 {
            return Ok(SegmentScan {
                frames,
                logical_len: logical,
                physical_len: pos,
                truncated_at: None,
            });
        }
        if remaining < 4 {
            break;
        }
        let p = pos as usize;
        let header = [buf[p], buf[p + 1], buf[p + 2], buf[p + 3]];
        let payload_len = u32::from_be_bytes(header) as u64;
        if remaining < 4 + payload_len + 1 {
            break;
        }
        let terminator = buf[(pos + 4 + payload_len) as usize];
        if terminator != 0x0A {
            // Garbage after a clean frame run; treat like truncation.
            break;
        }
        logical += payload_len;
        frames.push(FrameEntry {
            payload_pos: pos + 4,
            len: payload_len as u32,
            logical_end: logical,
        });
        pos += 4 + payload_len + 1;
    }
    Ok(SegmentScan {
        frames,
        logical_len: logical,
        physical_len: pos,
        truncated_at: Some(pos),
    })
}

// ---------------------------------------------------------------------------
// Directory naming
// ---------------------------------------------------------------------------

/// `encode(path) + "~" + base36(created_at_ms) + "~" + hex(random32)`.
fn directory_name_for(path: &str, created_at_ms: u64) -> String {
    format!(
        "{}~{}~{}",
        encode_path_component(path),
        base36(created_at_ms),
        hex::encode(rand::random::<u32>().to_be_bytes()),
    )
}

/// Filesystem-safe rendering of a stream path; uniqueness comes from the
/// time/entropy suffix, not from this encoding.
fn encode_path_component(path: &str) -> String {
    let encoded: String = path
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    encoded.chars().take(100).collect()
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
