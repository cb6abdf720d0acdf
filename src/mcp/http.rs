//! HTTP transport: `GET|POST|OPTIONS /{owner}/{repo}/mcp`.
//!
//! `GET` opens an SSE session. `POST` with a session id feeds that
//! session; a plain `POST` is a single JSON-RPC request/response cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerSettings;
use crate::errors::Result;
use crate::store::{IndexCache, RepoStore};

use super::context::ToolContext;
use super::server::McpServer;
use super::sse::{
    event_stream, SendError, SessionManager, SessionTask, SESSION_HEADER, SESSION_QUERY_PARAM,
};
use super::transport::parse_request;

/// Events buffered between a session loop and its HTTP body.
const EVENT_BUFFER: usize = 32;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RepoStore>,
    pub cache: Arc<IndexCache>,
    pub server: Arc<McpServer>,
    pub sessions: Arc<SessionManager>,
    pub settings: Arc<ServerSettings>,
}

impl AppState {
    pub fn new(store: RepoStore, settings: ServerSettings) -> Self {
        Self {
            store: Arc::new(store),
            cache: Arc::new(IndexCache::new(settings.index_cache_entries)),
            server: Arc::new(McpServer::new()),
            sessions: Arc::new(SessionManager::new(
                settings.max_sessions,
                settings.session_queue_capacity,
            )),
            settings: Arc::new(settings),
        }
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/{owner}/{repo}/mcp", any(mcp_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `state.settings.bind` and serves until Ctrl-C.
pub async fn serve(state: AppState) -> Result<()> {
    let listener = TcpListener::bind(&state.settings.bind).await?;
    info!(
        addr = %listener.local_addr()?,
        root = %state.store.root().display(),
        "serving MCP over HTTP"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn mcp_endpoint(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let mut response = match method {
        Method::OPTIONS => StatusCode::NO_CONTENT.into_response(),
        Method::GET => open_session(&state, owner, repo, &uri).await,
        Method::POST => match session_id(&headers, &query) {
            Some(id) => post_to_session(&state, &owner, &repo, &id, body).await,
            None => post_request(&state, owner, repo, &headers, body).await,
        },
        _ => {
            let mut resp = plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            resp.headers_mut().insert(
                header::ALLOW,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            );
            resp
        }
    };
    add_cors_headers(response.headers_mut());
    response
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Accept, Mcp-Session-Id"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Mcp-Session-Id"),
    );
}

fn plain(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

fn session_id(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get(SESSION_QUERY_PARAM).cloned())
        .filter(|id| !id.is_empty())
}

/// Loads the snapshot and primary index of `owner/repo` off the runtime.
async fn load_context(
    state: &AppState,
    owner: String,
    repo: String,
) -> std::result::Result<ToolContext, Response> {
    let store = state.store.clone();
    let cache = state.cache.clone();

    let loaded = tokio::task::spawn_blocking(move || -> Result<Option<ToolContext>> {
        if store.repo_dir(&owner, &repo).is_none() {
            return Ok(None);
        }
        let snapshot = store.snapshot(&owner, &repo)?;
        let index = cache.primary_index(&snapshot)?;
        Ok(Some(ToolContext::new(snapshot, index)))
    })
    .await;

    match loaded {
        Ok(Ok(Some(ctx))) => Ok(ctx),
        Ok(Ok(None)) => Err(plain(StatusCode::NOT_FOUND, "repository not found")),
        Ok(Err(e)) => {
            error!("failed to load repository: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to load repository: {}", e),
            )
                .into_response())
        }
        Err(e) => {
            error!("repository loader panicked: {}", e);
            Err(plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
    }
}

async fn open_session(state: &AppState, owner: String, repo: String, uri: &Uri) -> Response {
    let name = format!("{}/{}", owner, repo);
    let ctx = match load_context(state, owner, repo).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let Some((session, inbox)) = state.sessions.register(&name) else {
        return plain(StatusCode::SERVICE_UNAVAILABLE, "too many sessions");
    };
    let Ok(session_header) = HeaderValue::from_str(session.id()) else {
        state.sessions.unregister(session.id());
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "invalid session id");
    };

    let (events_tx, events_rx) = mpsc::channel::<Event>(EVENT_BUFFER);
    let task = SessionTask {
        server: state.server.clone(),
        ctx,
        manager: state.sessions.clone(),
        session: session.clone(),
        keepalive: Duration::from_secs(state.settings.keepalive_secs),
        endpoint: format!("{}?{}={}", uri.path(), SESSION_QUERY_PARAM, session.id()),
    };
    tokio::spawn(task.run(inbox, events_tx));

    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    headers.insert(HeaderName::from_static(SESSION_HEADER), session_header);

    (headers, Sse::new(event_stream(events_rx))).into_response()
}

/// Collects a request body of at most `limit` bytes.
///
/// Oversized bodies are answered with 413, transport failures with 400.
async fn read_body(limit: usize, body: Body) -> std::result::Result<Vec<u8>, Response> {
    let mut stream = body.into_data_stream();
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            debug!("failed to read request body: {}", e);
            plain(StatusCode::BAD_REQUEST, "failed to read request body")
        })?;
        if bytes.len() + chunk.len() > limit {
            debug!(limit, "rejecting oversized request body");
            return Err(plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Queues a request on session `id`. The session must belong to the
/// repository named in the path.
async fn post_to_session(
    state: &AppState,
    owner: &str,
    repo: &str,
    id: &str,
    body: Body,
) -> Response {
    let name = format!("{}/{}", owner, repo);
    match state.sessions.get(id) {
        Some(session) if session.repo() == name => {}
        Some(session) => {
            debug!(session = id, session_repo = session.repo(), path = %name, "session posted to another repository");
            return plain(StatusCode::NOT_FOUND, "unknown session");
        }
        None => return plain(StatusCode::NOT_FOUND, "unknown session"),
    }
    let bytes = match read_body(state.settings.max_body_bytes, body).await {
        Ok(bytes) => bytes,
        Err(resp) => return resp,
    };
    let request = match parse_request(&bytes) {
        Ok(request) => request,
        Err(error_response) => return (StatusCode::BAD_REQUEST, Json(error_response)).into_response(),
    };

    match state.sessions.send_request(id, request) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(SendError::NotFound) => plain(StatusCode::NOT_FOUND, "unknown session"),
        Err(reason @ (SendError::Full | SendError::Closed)) => {
            warn!(session = id, ?reason, "session rejected request");
            plain(StatusCode::GONE, "session unavailable")
        }
    }
}

async fn post_request(
    state: &AppState,
    owner: String,
    repo: String,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    if !is_json_content(headers) {
        return plain(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        );
    }
    if !accepts_json(headers) {
        return plain(StatusCode::NOT_ACCEPTABLE, "client must accept application/json");
    }
    let bytes = match read_body(state.settings.max_body_bytes, body).await {
        Ok(bytes) => bytes,
        Err(resp) => return resp,
    };
    let ctx = match load_context(state, owner, repo).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    match state.server.clone().handle_message_blocking(ctx, bytes).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| media_type(v) == "application/json")
}

/// A missing or empty `Accept` accepts anything.
fn accepts_json(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT) else {
        return true;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    if accept.trim().is_empty() {
        return true;
    }
    accept.split(',').map(media_type).any(|m| {
        matches!(m.as_str(), "application/json" | "application/*" | "*/*")
    })
}
