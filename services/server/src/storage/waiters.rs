//! Long-poll waiter hub.
//!
//! A process-wide set of waiter records, one per blocked read. Appends and
//! closures wake matching waiters with a filtered broadcast; the woken task
//! re-reads the store to discover what changed (new data, closure, or
//! deletion).
//!
//! # Ordering
//! A waiter must register itself **before** its caller performs the
//! read-for-new-data check, so an append committing concurrently with
//! registration cannot be missed: either the check sees the new bytes, or
//! the append's notify finds the registered waiter. Each waiter gets its own
//! `Notify`, whose stored permit covers the register → await window.
//!
//! Membership is mutated under the hub lock; signals are delivered after the
//! lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    next_id: u64,
    waiters: HashMap<u64, Entry>,
}

struct Entry {
    path: String,
    notify: Arc<Notify>,
}

/// Process-wide waiter registry shared by a store instance.
#[derive(Default)]
pub struct WaiterHub {
    inner: Mutex<Inner>,
    draining: AtomicBool,
}

impl WaiterHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for `path`. The caller must perform its
    /// read-for-new-data check *after* this call.
    pub fn register(self: &Arc<Self>, path: &str) -> WaiterGuard {
        let notify = Arc::new(Notify::new());
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = inner.next_id;
            inner.next_id += 1;
            inner.waiters.insert(
                id,
                Entry {
                    path: path.to_owned(),
                    notify: Arc::clone(&notify),
                },
            );
            id
        };
        WaiterGuard {
            hub: Arc::clone(self),
            id,
            notify,
        }
    }

    /// Wake every waiter registered for `path`.
    pub fn notify(&self, path: &str) {
        for notify in self.matching(path) {
            notify.notify_one();
        }
    }

    /// Wake every waiter for `path` unconditionally (closure propagation).
    pub fn notify_closed(&self, path: &str) {
        self.notify(path);
    }

    /// Flip the drain flag and wake everything; blocked reads observe the
    /// flag and return as timed out.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let all: Vec<Arc<Notify>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.waiters.values().map(|e| Arc::clone(&e.notify)).collect()
        };
        for notify in all {
            notify.notify_one();
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Number of registered waiters (test observability).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, path: &str) -> Vec<Arc<Notify>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .waiters
            .values()
            .filter(|e| e.path == path)
            .map(|e| Arc::clone(&e.notify))
            .collect()
    }

    fn remove(&self, id: u64) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiters
            .remove(&id);
    }
}

/// Registration handle; deregisters on drop (request abort included).
pub struct WaiterGuard {
    hub: Arc<WaiterHub>,
    id: u64,
    notify: Arc<Notify>,
}

impl WaiterGuard {
    /// Wait for the next wake-up. A notification delivered between
    /// registration and this call is not lost.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}
