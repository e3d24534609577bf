pub mod config;
pub mod framing;
pub mod hooks;
pub mod http;
pub mod manager;
pub mod state;
pub mod storage;

pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the HTTP router.
///
/// `healthz`/`readyz` are reserved paths at the root; every other path
/// (under `BASE_PATH`, when configured) is a stream key. Methods outside
/// the stream surface get 405 from the method router; bodies over the
/// configured cap get 413 from the body limit.
pub fn build_router(state: AppState) -> Router {
    let max_body = state.config.max_body_bytes;
    let streams = Router::new().route(
        "/{*path}",
        get(http::reads::get_stream)
            .head(http::streams::head_stream)
            .put(http::streams::put_stream)
            .post(http::streams::post_stream)
            .delete(http::streams::delete_stream)
            .options(http::streams::options_stream),
    );
    let router = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz));
    let router = match state.config.base_path.as_deref() {
        Some(prefix) => router.nest(prefix, streams),
        None => router.merge(streams),
    };
    router
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        // The store opens (and recovers) before the listener binds, so a
        // serving process is a ready process.
        "ok"
    }
}
