use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

use vmflow::config::Config;
use vmflow::daemon::Daemon;
use vmflow::executor::UnconfiguredExecutor;
use vmflow::jobs::JobDefinition;
use vmflow::server::{AppState, router};

/// Daemon with defaults and no executor program
async fn build_test_app() -> (Router, Arc<Daemon>) {
    let daemon = Arc::new(
        Daemon::start(Config::default(), Arc::new(UnconfiguredExecutor))
            .await
            .expect("daemon should start with defaults"),
    );
    (router(AppState::new(daemon.clone())), daemon)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_ok_while_running() {
    let (app, daemon) = build_test_app().await;

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_health_unavailable_after_shutdown() {
    let (app, daemon) = build_test_app().await;
    daemon.shutdown().await;

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_status_reports_counters() {
    let (app, daemon) = build_test_app().await;

    // rejected by validation, recorded as failed
    let _ = daemon
        .manager()
        .submit_job(JobDefinition::new("vm-1", ""))
        .await;

    let response = app.oneshot(get("/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["total_jobs"], 1);
    assert_eq!(body["failed_jobs"], 1);
    assert_eq!(body["max_concurrent_jobs"], 4);
    assert_eq!(body["schedules"]["total"], 0);
    assert_eq!(body["hub_clients"], 0);
    assert_eq!(body["metrics"]["jobs_rejected"], 1);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, daemon) = build_test_app().await;

    let response = app.oneshot(get("/jobs")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    daemon.shutdown().await;
}
