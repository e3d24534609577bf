//! Shared harness: an in-process server on an ephemeral port.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use server::config::ServerConfig;
use server::hooks::LifecycleHooks;
use server::manager::StreamManager;
use server::state::AppState;
use server::storage::file::{FileStore, FileStoreOptions};
use server::storage::memory::MemoryStore;
use server::storage::StreamStore;

/// Start a new in-process server instance on a fresh random port.
pub async fn start_server_instance(
    store: Arc<dyn StreamStore>,
    config: ServerConfig,
    hooks: Vec<Arc<dyn LifecycleHooks>>,
) -> (SocketAddr, AppState) {
    let manager = Arc::new(StreamManager::new(store, hooks, config.long_poll_timeout));
    let state = AppState::new(manager, Arc::new(config));
    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, state)
}

/// Memory-backed server with a short long-poll deadline for fast tests.
pub async fn start_memory_server() -> (SocketAddr, AppState) {
    let config = ServerConfig {
        long_poll_timeout: Duration::from_millis(400),
        ..ServerConfig::default()
    };
    start_server_instance(Arc::new(MemoryStore::new()), config, Vec::new()).await
}

/// File-backed server over an existing data dir (restartable).
pub async fn start_file_server(data_dir: &Path) -> (SocketAddr, AppState) {
    let store = FileStore::open(data_dir, FileStoreOptions::default()).expect("open file store");
    let config = ServerConfig {
        long_poll_timeout: Duration::from_millis(400),
        ..ServerConfig::default()
    };
    start_server_instance(Arc::new(store), config, Vec::new()).await
}

pub fn url(addr: SocketAddr, path_and_query: &str) -> String {
    format!("http://{addr}{path_and_query}")
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}
