//! Route definitions

use crate::{handlers, state::AppState};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Call ingestion routes
pub fn upload_routes(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/call-upload",
            post(handlers::upload::handle_call_upload),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

/// Live session upgrade routes
pub fn live_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(handlers::live::upgrade))
        .route("/ws", get(handlers::live::upgrade))
}

/// Health check routes
pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
}

/// Build the full router over `state`
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(upload_routes(state.config.ingest.max_upload_bytes))
        .merge(live_routes())
        .merge(health_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
