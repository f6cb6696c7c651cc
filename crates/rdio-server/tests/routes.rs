//! Router tests driven through `tower::ServiceExt::oneshot`

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use pretty_assertions::assert_eq;
use rdio_core::Config;
use rdio_server::{AppState, build_router};
use std::sync::Arc;
use tower::ServiceExt;

async fn get(uri: &str) -> (StatusCode, serde_json::Value) {
    let store = seeded_store();
    let controller = start_controller(&store, Config::default()).await;
    let app = build_router(Arc::new(AppState::new(Arc::clone(&controller))));

    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    controller.stop();
    (
        status,
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
    )
}

#[tokio::test]
async fn test_health_endpoint() {
    let (status, body) = get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_ready_endpoint() {
    let (status, body) = get("/ready").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_plain_get_on_live_route_is_not_upgraded() {
    let (status, _) = get("/ws").await;

    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_unknown_route() {
    let (status, _) = get("/api/nothing").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
