// ABOUTME: HTTP-level tests for the sandbox router over the in-memory provider
// ABOUTME: Exercises status mapping, JSON shapes, SSE framing and gzip negotiation

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dappbox_api::create_sandbox_router;
use dappbox_sandbox::providers::ScriptedCommand;
use dappbox_sandbox::{MemoryProvider, SandboxServices, SandboxSettings};
use flate2::read::GzDecoder;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn setup_with(settings: SandboxSettings) -> (Arc<MemoryProvider>, Router) {
    let provider = Arc::new(MemoryProvider::new());
    let services = Arc::new(SandboxServices::new(provider.clone(), settings));
    (provider, create_sandbox_router(services))
}

fn setup() -> (Arc<MemoryProvider>, Router) {
    setup_with(SandboxSettings::for_tests())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn send_text(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

#[tokio::test]
async fn test_create_requires_project_id() {
    let (provider, app) = setup();

    let (status, body) = send(&app, post_json("/sandbox/create", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "project_id is required");
    assert_eq!(provider.create_count(), 0);
}

#[tokio::test]
async fn test_create_and_lookup() {
    let (provider, app) = setup();

    let (status, created) =
        send(&app, post_json("/sandbox/create", json!({"project_id": "demo"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["project_id"], "demo");
    assert_eq!(created["sandbox_id"], "mem-1");
    assert_eq!(created["url"], "https://mem-1-3000.sandbox.local");

    let (status, again) =
        send(&app, post_json("/sandbox/create", json!({"project_id": "demo"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, created);
    assert_eq!(provider.create_count(), 1);

    let (status, info) = send(&app, get("/sandbox/demo")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info, created);
}

#[tokio::test]
async fn test_lookup_without_sandbox_is_not_found() {
    let (provider, app) = setup();

    let (status, body) = send(&app, get("/sandbox/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("ghost"));
    assert_eq!(provider.create_count(), 0);
}

#[tokio::test]
async fn test_invalid_project_id_is_rejected() {
    let (provider, app) = setup();

    let (status, _) = send(
        &app,
        post_json("/sandbox/create", json!({"project_id": "bad id!"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(provider.create_count(), 0);
}

#[tokio::test]
async fn test_provisioning_failure_is_unavailable() {
    let (provider, app) = setup();
    provider.fail_next_create();

    let (status, body) =
        send(&app, post_json("/sandbox/create", json!({"project_id": "demo"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("demo"));
}

#[tokio::test]
async fn test_run_command() {
    let (provider, app) = setup();

    let (status, body) = send(&app, post_json("/sandbox/demo/command", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "command is required");
    assert_eq!(provider.create_count(), 0);

    let (status, body_ok) = send(
        &app,
        post_json("/sandbox/demo/command", json!({"command": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body_ok,
        json!({"stdout": "hi\n", "stderr": "", "exit_code": 0, "command": "echo hi"})
    );

    let (status, failed) = send(
        &app,
        post_json("/sandbox/demo/command", json!({"command": "frobnicate"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(failed["exit_code"], 127);
}

#[tokio::test]
async fn test_stream_command_events() {
    let (provider, app) = setup();

    let (status, _) = send_text(&app, get("/sandbox/demo/command/stream")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(provider.create_count(), 0);

    let (status, text) =
        send_text(&app, get("/sandbox/demo/command/stream?command=echo%20hi")).await;
    assert_eq!(status, StatusCode::OK);

    let start = text.find("event: start").unwrap();
    let log = text.find("event: log").unwrap();
    let done = text.find("event: done").unwrap();
    assert!(start < log && log < done);
    assert!(text.contains(r#""chunk":"hi\n""#));
    assert!(text.contains(r#""type":"stdout""#));
    assert!(text.contains(r#"{"exitCode":0}"#));
    assert!(!text.contains("stderr"));
}

#[tokio::test]
async fn test_upload_and_page_files() {
    let (_provider, app) = setup();

    let (status, uploaded) = send(
        &app,
        post_json(
            "/sandbox/upload",
            json!({
                "project_id": "demo",
                "files": {"/dapp/a.txt": "A", "/dapp/b.txt": "B", "/dapp/c.txt": "C"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(uploaded["status"], "success");
    assert_eq!(uploaded["files_uploaded"], 3);
    assert_eq!(uploaded["auto_start"]["status"], "skipped");

    let (status, page) = send(&app, get("/sandbox/demo/files?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    assert_eq!(page["returned"], 2);
    assert_eq!(page["hasMore"], true);
    assert_eq!(page["cursor"], "/dapp/b.txt");
    assert_eq!(page["entries"][0]["encoding"], "base64");
    assert_eq!(page["entries"][0]["size"], 1);
    let content = page["entries"][0]["content"].as_str().unwrap();
    assert_eq!(BASE64.decode(content).unwrap(), b"A");

    let (_, rest) = send(&app, get("/sandbox/demo/files?limit=2&cursor=/dapp/b.txt")).await;
    assert_eq!(rest["returned"], 1);
    assert_eq!(rest["hasMore"], false);
    assert_eq!(rest["entries"][0]["path"], "/dapp/c.txt");

    let (status, downloaded) =
        send(&app, post_json("/sandbox/demo/download", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(downloaded["count"], 3);
    assert_eq!(downloaded["files"]["/dapp/b.txt"], "B");
}

#[tokio::test]
async fn test_upload_rejects_traversal() {
    let (provider, app) = setup();

    let (status, _) = send(
        &app,
        post_json(
            "/sandbox/upload",
            json!({"project_id": "demo", "files": {"/dapp/../../etc/passwd": "x"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(provider.create_count(), 0);
}

#[tokio::test]
async fn test_large_file_pages_are_gzipped() {
    let mut settings = SandboxSettings::for_tests();
    settings.gzip_threshold_bytes = 16;
    let (_provider, app) = setup_with(settings);

    send(
        &app,
        post_json(
            "/sandbox/upload",
            json!({"project_id": "demo", "files": {"/dapp/big.txt": "x".repeat(512)}}),
        ),
    )
    .await;

    let request = Request::builder()
        .uri("/sandbox/demo/files")
        .header(header::ACCEPT_ENCODING, "gzip")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");

    let compressed = response.into_body().collect().await.unwrap().to_bytes();
    let mut json_text = String::new();
    GzDecoder::new(&compressed[..])
        .read_to_string(&mut json_text)
        .unwrap();
    let page: Value = serde_json::from_str(&json_text).unwrap();
    assert_eq!(page["entries"][0]["path"], "/dapp/big.txt");
}

#[tokio::test]
async fn test_file_changes_against_manifest() {
    let (_provider, app) = setup();
    send(
        &app,
        post_json(
            "/sandbox/upload",
            json!({"project_id": "demo", "files": {"/dapp/a.txt": "A"}}),
        ),
    )
    .await;

    let (status, first) = send(
        &app,
        post_json("/sandbox/demo/files/changes", json!({"previous": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["added_or_changed"], json!(["/dapp/a.txt"]));
    assert_eq!(first["deleted"], json!([]));

    let (_, second) = send(
        &app,
        post_json(
            "/sandbox/demo/files/changes",
            json!({"previous": first["manifest"].clone()}),
        ),
    )
    .await;
    assert_eq!(second["added_or_changed"], json!([]));
}

#[tokio::test]
async fn test_recent_logs_without_dev_server() {
    let (_provider, app) = setup();

    let (status, body) = send(&app, get("/sandbox/demo/recent-logs?lines=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["logs"],
        "No active process found. Start the dev server first."
    );
}

#[tokio::test]
async fn test_logs_stream_without_process() {
    let (_provider, app) = setup();

    let (status, text) = send_text(&app, get("/sandbox/demo/logs")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("event: log"));
    assert!(text.contains("No active process found"));
}

#[tokio::test]
async fn test_terminate_then_lookup() {
    let (_provider, app) = setup();
    send(&app, post_json("/sandbox/create", json!({"project_id": "demo"}))).await;

    let (status, body) = send(&app, post_json("/sandbox/demo/terminate", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "terminated");

    let (status, _) = send(&app, get("/sandbox/demo")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, post_json("/sandbox/demo/terminate", json!({}))).await;
    assert_eq!(body["status"], "not_found");
}

#[tokio::test]
async fn test_git_rejects_bad_hash() {
    let (provider, app) = setup();

    let (status, body) = send(
        &app,
        post_json(
            "/sandbox/demo/git",
            json!({"operation": "restore", "hash": "HEAD~1; rm -rf /"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Invalid commit hash"));
    assert_eq!(provider.create_count(), 0);
}

#[tokio::test]
async fn test_git_head_without_commits() {
    let (provider, app) = setup();
    provider.script("git rev-parse", ScriptedCommand::new().exit_code(1));

    let (status, body) = send(
        &app,
        post_json("/sandbox/demo/git", json!({"operation": "head"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "hash": null}));
}

#[tokio::test]
async fn test_malformed_json_body_is_json_error() {
    let (provider, app) = setup();

    let request = Request::builder()
        .method("POST")
        .uri("/sandbox/create")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"project_id\": "))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert_eq!(provider.create_count(), 0);

    let request = Request::builder()
        .method("POST")
        .uri("/sandbox/create")
        .body(Body::from("project_id=demo"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_malformed_query_is_json_error() {
    let (_provider, app) = setup();
    send(&app, post_json("/sandbox/create", json!({"project_id": "demo"}))).await;

    let (status, body) = send(&app, get("/sandbox/demo/files?limit=abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to deserialize query string"));

    let (status, body) = send(&app, get("/sandbox/demo/recent-logs?lines=-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_reading_files_never_provisions() {
    let (provider, app) = setup();

    let (status, body) = send(&app, get("/sandbox/ghost/files")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("ghost"));

    let (status, _) = send(&app, post_json("/sandbox/ghost/download", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        post_json("/sandbox/ghost/files/changes", json!({"previous": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(provider.create_count(), 0);
}

#[tokio::test]
async fn test_start_without_sandbox_is_not_found() {
    let (provider, app) = setup();

    let (status, body) = send(&app, post_json("/sandbox/ghost/start", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("ghost"));
    assert_eq!(provider.create_count(), 0);

    send(&app, post_json("/sandbox/create", json!({"project_id": "demo"}))).await;
    let (status, body) = send(&app, post_json("/sandbox/demo/start", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], "https://mem-1-3000.sandbox.local");
    assert_eq!(provider.create_count(), 1);
}

#[tokio::test]
async fn test_events_stream_frames() {
    let mut settings = SandboxSettings::for_tests();
    settings.event_poll_interval = Duration::from_millis(20);
    let (_provider, app) = setup_with(settings);
    send(&app, post_json("/sandbox/create", json!({"project_id": "demo"}))).await;

    let response = app
        .clone()
        .oneshot(get("/sandbox/demo/events"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    // The stream never ends on its own, so read frames until two events arrived
    let mut body = response.into_body();
    let mut text = String::new();
    while text.matches("\n\n").count() < 2 {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("event frame in time")
            .expect("stream still open")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            text.push_str(&String::from_utf8_lossy(&data));
        }
    }

    let events: Vec<Value> = text
        .split("\n\n")
        .filter_map(|block| block.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert_eq!(
        events[0],
        json!({"type": "sandbox_ready", "url": "https://mem-1-3000.sandbox.local"})
    );
    assert_eq!(
        events[1],
        json!({"type": "sandbox_ping", "url": "https://mem-1-3000.sandbox.local"})
    );
}
