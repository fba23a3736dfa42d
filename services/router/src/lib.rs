pub mod broker;
pub mod config;
pub mod connect;
pub mod http;
pub mod metrics;
pub mod session;
pub mod state;

pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    // Pattern A payloads arrive base64-encoded inside JSON, so the
    // transport-level cap is the buffer cap inflated by 4/3 plus
    // envelope slack.
    let body_limit = state.config.max_buffered_bytes / 3 * 4 + 64 * 1024;
    Router::new()
        .route("/connect", get(connect::connect_handler))
        .route("/connectors", get(http::connectors::list_connectors))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/datasets/request-sync", post(http::requests::request_sync))
        .route(
            "/datasets/request-stream",
            post(http::requests::request_stream),
        )
        .route(
            "/datasets/request-offload",
            post(http::requests::request_offload),
        )
        .route(
            "/datasets/status/:request_id",
            get(http::status::request_status),
        )
        .route("/datasets/result", post(http::uploads::post_result))
        .route("/datasets/stream/init", post(http::uploads::stream_init))
        .route("/datasets/stream/chunk", post(http::uploads::stream_chunk))
        .route(
            "/datasets/stream/complete",
            post(http::uploads::stream_complete),
        )
        .route("/datasets/stream/error", post(http::uploads::stream_error))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
