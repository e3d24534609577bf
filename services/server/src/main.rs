use std::env;
use std::sync::Arc;

use server::config::ServerConfig;
use server::manager::StreamManager;
use server::state::AppState;
use server::storage::file::{FileStore, FileStoreOptions};
use server::storage::memory::MemoryStore;
use server::storage::StreamStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let store: Arc<dyn StreamStore> = match &config.data_dir {
        Some(dir) => {
            info!(data_dir = %dir.display(), "opening file-backed store");
            match FileStore::open(
                dir,
                FileStoreOptions {
                    handle_cache_capacity: config.handle_cache_capacity,
                },
            ) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    eprintln!("FATAL: failed to open store: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("no DATA_DIR set; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let manager = Arc::new(StreamManager::new(
        store,
        Vec::new(),
        config.long_poll_timeout,
    ));
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(manager, Arc::new(config));
    let router = server::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %bind_addr,
        "durable streams server listening"
    );
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .expect("server error");
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C, then drains waiters so in-flight long-polls
/// finish quickly and graceful shutdown can complete.
async fn shutdown_signal(state: AppState) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received; draining waiters");
    state.shutdown().await;
}
