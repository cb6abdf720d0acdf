mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use xmlgraph::config::ServerSettings;
use xmlgraph::mcp::{router, AppState};
use xmlgraph::store::RepoStore;

const ENDPOINT: &str = "/acme/registry/mcp";

fn app_with(settings: ServerSettings) -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    common::write_repo(dir.path());
    let state = AppState::new(RepoStore::new(dir.path()), settings);
    (dir, router(state))
}

fn app() -> (TempDir, Router) {
    app_with(ServerSettings::default())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn next_frame(stream: &mut axum::body::BodyDataStream) -> String {
    let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for an event")
        .expect("stream ended")
        .unwrap();
    String::from_utf8(chunk.to_vec()).unwrap()
}

#[tokio::test]
async fn test_healthz() {
    let (_dir, app) = app();
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_post_initialize() {
    let (_dir, app) = app();
    let response = app
        .oneshot(post_json(
            ENDPOINT,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json"
    );
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let body = body_json(response).await;
    assert_eq!(body["result"]["serverInfo"]["name"], "registry-mcp");
}

#[tokio::test]
async fn test_post_tool_call_end_to_end() {
    let (_dir, app) = app();
    let response = app
        .oneshot(post_json(
            ENDPOINT,
            json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "tools/call",
                "params": {
                    "name": "list_entities",
                    "arguments": {"type": "organization", "parent": "ministry:02"}
                }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    let out: Value = serde_json::from_str(text).unwrap();
    assert_eq!(out["count"], 2);
}

#[tokio::test]
async fn test_post_protocol_errors_stay_http_200() {
    let (_dir, app) = app();
    let response = app
        .oneshot(post_json(
            ENDPOINT,
            json!({"jsonrpc": "2.0", "id": 1, "method": "no/such/method"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["error"]["code"], -32601);
}

#[tokio::test]
async fn test_post_notification_is_accepted_without_body() {
    let (_dir, app) = app();
    let response = app
        .oneshot(post_json(
            ENDPOINT,
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn test_post_content_negotiation() {
    let (_dir, app) = app();

    let response = app
        .clone()
        .oneshot(
            Request::post(ENDPOINT)
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = app
        .oneshot(
            Request::post(ENDPOINT)
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::ACCEPT, "text/html")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}

#[tokio::test]
async fn test_post_body_limit() {
    let (_dir, app) = app_with(ServerSettings {
        max_body_bytes: 64,
        ..ServerSettings::default()
    });
    let padding = "x".repeat(256);
    let response = app
        .oneshot(post_json(
            ENDPOINT,
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping", "params": {"pad": padding}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_unknown_repository_is_not_found() {
    let (_dir, app) = app();
    let response = app
        .oneshot(post_json(
            "/acme/missing/mcp",
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_options_and_unsupported_verbs() {
    let (_dir, app) = app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri(ENDPOINT)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
        "GET, POST, OPTIONS"
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(ENDPOINT)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_post_to_unknown_session() {
    let (_dir, app) = app();
    let mut request = post_json(ENDPOINT, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
    request
        .headers_mut()
        .insert("mcp-session-id", "deadbeef".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sse_session_round_trip() {
    let (_dir, app) = app();
    let response = app
        .clone()
        .oneshot(Request::get(ENDPOINT).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(response.headers()["x-accel-buffering"], "no");
    let session_id = response.headers()["mcp-session-id"]
        .to_str()
        .unwrap()
        .to_string();

    let mut stream = response.into_body().into_data_stream();
    let endpoint = next_frame(&mut stream).await;
    assert_eq!(
        endpoint,
        format!("event: endpoint\ndata: {}?sessionId={}\n\n", ENDPOINT, session_id)
    );

    let mut request = post_json(ENDPOINT, json!({"jsonrpc": "2.0", "id": 42, "method": "ping"}));
    request
        .headers_mut()
        .insert("mcp-session-id", session_id.parse().unwrap());
    let accepted = app.clone().oneshot(request).await.unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);

    let frame = next_frame(&mut stream).await;
    assert!(frame.starts_with("event: message\ndata: "));
    assert!(frame.contains("\"id\":42"));

    let bad = post_json(
        &format!("{}?sessionId={}", ENDPOINT, session_id),
        json!({"jsonrpc": "2.0", "id": 1}),
    );
    let response = app.oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sse_capacity_is_enforced() {
    let (_dir, app) = app_with(ServerSettings {
        max_sessions: 1,
        ..ServerSettings::default()
    });
    let first = app
        .clone()
        .oneshot(Request::get(ENDPOINT).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(Request::get(ENDPOINT).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    drop(first);
}

#[tokio::test]
async fn test_session_is_bound_to_its_repository() {
    let (_dir, app) = app();
    let response = app
        .clone()
        .oneshot(Request::get(ENDPOINT).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let session_id = response.headers()["mcp-session-id"]
        .to_str()
        .unwrap()
        .to_string();

    let ping = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
    let mut request = post_json("/nobody/nowhere/mcp", ping.clone());
    request
        .headers_mut()
        .insert("mcp-session-id", session_id.parse().unwrap());
    let foreign = app.clone().oneshot(request).await.unwrap();
    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);

    let request = post_json(&format!("{}?sessionId={}", ENDPOINT, session_id), ping);
    let own = app.oneshot(request).await.unwrap();
    assert_eq!(own.status(), StatusCode::ACCEPTED);
    drop(response);
}

#[tokio::test]
async fn test_malformed_primary_source_is_server_error() {
    let (dir, app) = app();
    std::fs::write(
        dir.path().join("acme/registry").join(common::REGISTRY_PATH),
        "<r><a code=\"1\"></r>",
    )
    .unwrap();

    let response = app
        .oneshot(post_json(
            ENDPOINT,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("failed to load repository"));
}

#[tokio::test]
async fn test_full_session_queue_is_gone() {
    let (_dir, app) = app_with(ServerSettings {
        session_queue_capacity: 1,
        ..ServerSettings::default()
    });
    // The stream is held open but never read, so the session stalls once
    // its event buffer fills and the inbound queue backs up behind it.
    let stream = app
        .clone()
        .oneshot(Request::get(ENDPOINT).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let session_id = stream.headers()["mcp-session-id"]
        .to_str()
        .unwrap()
        .to_string();

    let mut statuses = Vec::new();
    for id in 0..200 {
        let mut request = post_json(ENDPOINT, json!({"jsonrpc": "2.0", "id": id, "method": "ping"}));
        request
            .headers_mut()
            .insert("mcp-session-id", session_id.parse().unwrap());
        let status = app.clone().oneshot(request).await.unwrap().status();
        statuses.push(status);
        if status == StatusCode::GONE {
            break;
        }
    }

    assert_eq!(statuses[0], StatusCode::ACCEPTED);
    assert_eq!(statuses.last(), Some(&StatusCode::GONE));
    assert!(statuses[..statuses.len() - 1]
        .iter()
        .all(|s| *s == StatusCode::ACCEPTED));
    drop(stream);
}
