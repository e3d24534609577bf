//! Shared per-process state handed to every handler.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::manager::StreamManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub config: Arc<ServerConfig>,
    /// Fires at shutdown; outstanding long-polls and SSE loops observe it
    /// and wind down as timed out.
    pub drain: CancellationToken,
}

impl AppState {
    pub fn new(manager: Arc<StreamManager>, config: Arc<ServerConfig>) -> Self {
        AppState {
            manager,
            config,
            drain: CancellationToken::new(),
        }
    }

    /// Flip the drain flag, cancel outstanding waiters, and release store
    /// resources. New requests are refused by the listener teardown that
    /// follows.
    pub async fn shutdown(&self) {
        self.drain.cancel();
        self.manager.shutdown().await;
    }
}
