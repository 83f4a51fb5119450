use super::*;
use crate::Backend;
use crate::test_helpers::{FakePlatform, create_test_backend, file_url, raw_post};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tower::ServiceExt;


/// Backend over a fake platform plus a relay router for it
async fn create_test_app(platform: Arc<FakePlatform>) -> (Router, Backend, tempfile::TempDir) {
    let (backend, temp_dir) = create_test_backend(platform).await;
    let app = create_router(backend.broker().clone(), Arc::clone(backend.config()));
    (app, backend, temp_dir)
}

async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn attach(app: &Router) -> u64 {
    let (status, body) = send(app, "POST", "/api/v1/sessions", "").await;
    assert_eq!(status, StatusCode::CREATED);
    body["session"].as_u64().unwrap()
}

async fn command(app: &Router, session: u64, line: &str) -> (StatusCode, Value) {
    send(
        app,
        "POST",
        &format!("/api/v1/sessions/{}/commands", session),
        line,
    )
    .await
}

#[tokio::test]
async fn test_api_server_spawns() {
    let (backend, _temp_dir) = create_test_backend(Arc::new(FakePlatform::new())).await;

    let mut config = (**backend.config()).clone();
    config.api.bind_address = "127.0.0.1:0".parse().unwrap();
    let token = tokio_util::sync::CancellationToken::new();

    let handle = tokio::spawn(start_api_server(
        backend.broker().clone(),
        Arc::new(config),
        token.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _backend, _dir) = create_test_app(Arc::new(FakePlatform::new())).await;
    let (status, body) = send(&app, "GET", "/api/v1/health", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_cors_enabled() {
    let (app, _backend, _dir) = create_test_app(Arc::new(FakePlatform::new())).await;

    let request = Request::builder()
        .uri("/api/v1/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers().contains_key("access-control-allow-origin"),
        "CORS header should be present when CORS is enabled"
    );
}

#[tokio::test]
async fn test_openapi_endpoint() {
    let (app, _backend, _dir) = create_test_app(Arc::new(FakePlatform::new())).await;
    let (status, body) = send(&app, "GET", "/api/v1/openapi.json", "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/v1/sessions/{id}/commands"].is_object());
}

#[tokio::test]
async fn test_attach_and_detach_session() {
    let (app, backend, _dir) = create_test_app(Arc::new(FakePlatform::new())).await;

    let session = attach(&app).await;
    assert_eq!(backend.broker().sessions().len(), 1);

    let uri = format!("/api/v1/sessions/{}", session);
    let (status, _) = send(&app, "DELETE", &uri, "").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "DELETE", &uri, "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "session_not_found");
}

#[tokio::test]
async fn test_command_on_unknown_session() {
    let (app, _backend, _dir) = create_test_app(Arc::new(FakePlatform::new())).await;
    let (status, body) = command(&app, 77, "tasks").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["details"]["session_id"], 77);
}

#[tokio::test]
async fn test_unknown_command_matches_local_message() {
    let (app, backend, _dir) = create_test_app(Arc::new(FakePlatform::new())).await;
    let session = attach(&app).await;

    let (status, body) = command(&app, session, "frobnicate:artist=x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "unknown_command");

    let local = backend.broker().attach();
    let err = backend
        .broker()
        .dispatch(local.id, "frobnicate:artist=x")
        .await
        .unwrap_err();
    assert_eq!(body["error"]["message"], err.to_string());
}

#[tokio::test]
async fn test_relayed_check_downloads_files() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post(
        "fanbox",
        "1",
        raw_post("p1", "2024-01-01T00:00:00", &["a.png", "b.zip"]),
        40,
    );
    let (app, backend, _dir) = create_test_app(Arc::clone(&platform)).await;
    let session = attach(&app).await;

    let (status, _) = command(&app, session, "add:service=fanbox,user_id=1").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = command(&app, session, "check:artist=fanbox_1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "queued");
    let root = crate::TaskId(body["task"]["id"].as_u64().unwrap());

    let info = backend.scheduler().wait_for(root).await.unwrap();
    assert_eq!(info.state, crate::TaskState::Succeeded);
    assert_eq!(platform.file_requests(&file_url("p1", "a.png")), 1);
    assert_eq!(platform.file_requests(&file_url("p1", "b.zip")), 1);

    let (_, body) = command(&app, session, "list").await;
    assert_eq!(body["type"], "artists");
    assert_eq!(body["artists"][0]["posts_done"], 1);
}

#[tokio::test]
async fn test_sse_event_stream() {
    let (app, _backend, _dir) = create_test_app(Arc::new(FakePlatform::new())).await;
    let session = attach(&app).await;

    let request = Request::builder()
        .uri(format!("/api/v1/sessions/{}/events", session))
        .header("Accept", "text/event-stream")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(
        content_type.contains("text/event-stream"),
        "Content-Type should be text/event-stream, got: {}",
        content_type
    );

    let request = Request::builder()
        .uri("/api/v1/sessions/999/events")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
