
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use onlycode::api::{router, ApiState};
use onlycode::config::OrchestratorConfig;
use onlycode::{ExecutionRequest, Orchestrator};
use test_harness::{test_config, test_orchestrator, EventKind, FakeProgram, FakeRuntime};

const IMAGE: &str = "python:3.12-alpine";

/// Create a test app over the fake runtime
fn create_test_app(
    runtime: &Arc<FakeRuntime>,
    config: OrchestratorConfig,
    static_dir: &Path,
) -> (Router, Orchestrator) {
    let orchestrator = test_orchestrator(runtime, config);
    let state = ApiState {
        orchestrator: orchestrator.clone(),
    };
    (router(state, static_dir), orchestrator)
}

fn run_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/run")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_run_returns_result() {
    let runtime = FakeRuntime::with_program(
        IMAGE,
        FakeProgram::new().stdout("hello\n").stderr("warn\n"),
    );
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config(), dir.path());

    let (status, json) = send(
        app,
        run_request(json!({"image": IMAGE, "source": "print('hello')"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "completed");
    assert_eq!(json["exit_code"], 0);
    assert_eq!(json["stdout"], "hello\n");
    assert_eq!(json["stderr"], "warn\n");
    assert_eq!(json["truncated"], false);
    assert!(json["submission_id"].is_string());
    assert!(json["duration_ms"].is_u64());
}

#[tokio::test]
async fn test_run_timeout_is_ok_response() {
    let runtime = FakeRuntime::with_program(
        IMAGE,
        FakeProgram::new().run_for(Duration::from_secs(30)),
    );
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config(), dir.path());

    let (status, json) = send(
        app,
        run_request(json!({"image": IMAGE, "source": "while 1: pass", "timeout_ms": 100})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "timed_out");
    assert!(json["exit_code"].is_null());
}

#[tokio::test]
async fn test_run_truncation_flags() {
    let runtime = FakeRuntime::with_program(IMAGE, FakeProgram::new().stdout(vec![b'a'; 64]));
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config().with_output_limit(16), dir.path());

    let (status, json) = send(app, run_request(json!({"image": IMAGE, "source": ""}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stdout"].as_str().unwrap().len(), 16);
    assert_eq!(json["stdout_truncated"], true);
    assert_eq!(json["stderr_truncated"], false);
    assert_eq!(json["truncated"], true);
}

#[tokio::test]
async fn test_run_overloaded_is_503() {
    let runtime = FakeRuntime::with_program(
        IMAGE,
        FakeProgram::new().run_for(Duration::from_millis(300)),
    );
    let dir = tempfile::tempdir().unwrap();
    let config = test_config()
        .with_max_conn(1)
        .with_admission_timeout(Duration::ZERO);
    let (app, orchestrator) = create_test_app(&runtime, config, dir.path());

    let busy = tokio::spawn(async move { orchestrator.submit(ExecutionRequest::new(IMAGE, "")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, json) = send(app, run_request(json!({"image": IMAGE, "source": ""}))).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["kind"], "overloaded");
    assert!(busy.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_run_invalid_is_400() {
    let runtime = FakeRuntime::with_program(IMAGE, FakeProgram::new());
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config(), dir.path());

    let (status, json) = send(app, run_request(json!({"image": "", "source": "x"}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_request");
    assert!(json["error"].as_str().unwrap().contains("image"));
}

#[tokio::test]
async fn test_run_missing_image_is_422() {
    let runtime = FakeRuntime::with_program(IMAGE, FakeProgram::new());
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config(), dir.path());

    let (status, json) = send(
        app,
        run_request(json!({"image": "ruby:nope", "source": "puts 1"})),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["kind"], "image_not_found");
}

#[tokio::test]
async fn test_run_runtime_down_is_502() {
    let runtime = FakeRuntime::with_program(IMAGE, FakeProgram::new());
    runtime.set_unavailable(true);
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config(), dir.path());

    let (status, json) = send(app, run_request(json!({"image": IMAGE, "source": ""}))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["kind"], "runtime_unavailable");
}

#[tokio::test]
async fn test_run_malformed_body_is_400() {
    let runtime = FakeRuntime::with_program(IMAGE, FakeProgram::new());
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config(), dir.path());

    let request = Request::builder()
        .method("POST")
        .uri("/api/run")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, json) = send(app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_request");
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_run_missing_field_is_400() {
    let runtime = FakeRuntime::with_program(IMAGE, FakeProgram::new());
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config(), dir.path());

    let (status, json) = send(app, run_request(json!({"image": IMAGE}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_request");
    assert!(json["error"].as_str().unwrap().contains("source"));
    assert_eq!(runtime.count(EventKind::Created), 0);
}

#[tokio::test]
async fn test_run_wrong_content_type_is_400() {
    let runtime = FakeRuntime::with_program(IMAGE, FakeProgram::new());
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config(), dir.path());

    let request = Request::builder()
        .method("POST")
        .uri("/api/run")
        .body(Body::from(json!({"image": IMAGE, "source": ""}).to_string()))
        .unwrap();
    let (status, json) = send(app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_request");
}

#[tokio::test]
async fn test_status_reports_capacity() {
    let runtime = FakeRuntime::new();
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = create_test_app(&runtime, test_config().with_max_conn(3), dir.path());

    let request = Request::builder()
        .uri("/api/status")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["capacity"], 3);
    assert_eq!(json["in_use"], 0);
    assert_eq!(json["available"], 3);
    assert_eq!(json["waiting"], 0);
}

#[tokio::test]
async fn test_static_files_served() {
    let runtime = FakeRuntime::new();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>onlycode</h1>").unwrap();
    let (app, _) = create_test_app(&runtime, test_config(), dir.path());

    let request = Request::builder()
        .uri("/static/index.html")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"<h1>onlycode</h1>");

    let missing = Request::builder()
        .uri("/static/missing.js")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(missing).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
