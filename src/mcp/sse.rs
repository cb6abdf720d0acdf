//! SSE session registry and per-session event loop.
//!
//! A client opens a stream with `GET`, receives an `endpoint` event, then
//! POSTs JSON-RPC requests carrying its session id. Those requests are
//! queued on the session and answered as `message` events on the stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::response::sse::Event;
use futures::Stream;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::context::ToolContext;
use super::server::McpServer;
use super::transport::JsonRpcRequest;

/// Header carrying the session id, on the GET response and on POSTs.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Query parameter accepted in place of [`SESSION_HEADER`].
pub const SESSION_QUERY_PARAM: &str = "sessionId";

/// Comment written on the keep-alive timer.
pub const KEEPALIVE_COMMENT: &str = "keepalive";

/// Adapts a session's event channel into the body of an [`axum::response::sse::Sse`]
/// response. The stream ends when the session loop drops its sender.
pub fn event_stream(
    events: mpsc::Receiver<Event>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    futures::stream::unfold(events, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    })
}

/// Why a request could not be queued on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No session is registered under that id.
    NotFound,
    /// The session's inbound queue is at capacity.
    Full,
    /// The session is shutting down.
    Closed,
}

struct SessionInner {
    closed: bool,
    sender: Option<mpsc::Sender<JsonRpcRequest>>,
}

/// One registered SSE session.
pub struct Session {
    id: String,
    /// Repository (`owner/repo`) the session was opened on.
    repo: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Queues a request without waiting. The closed check and the send
    /// happen under the same lock as [`Session::close`].
    fn try_send(&self, request: JsonRpcRequest) -> Result<(), SendError> {
        let inner = self.lock();
        if inner.closed {
            return Err(SendError::Closed);
        }
        let Some(sender) = &inner.sender else {
            return Err(SendError::Closed);
        };
        sender.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.sender = None;
    }
}

/// Registry of live SSE sessions.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    queue_capacity: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize, queue_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new session on `repo`, or returns `None` when at
    /// capacity.
    ///
    /// The receiver is the session's inbound request queue.
    pub fn register(&self, repo: &str) -> Option<(Arc<Session>, mpsc::Receiver<JsonRpcRequest>)> {
        let mut sessions = self.lock();
        if sessions.len() >= self.max_sessions {
            warn!(max = self.max_sessions, "session capacity reached");
            return None;
        }

        let mut id = new_session_id();
        while sessions.contains_key(&id) {
            id = new_session_id();
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let session = Arc::new(Session {
            id: id.clone(),
            repo: repo.to_string(),
            inner: Mutex::new(SessionInner {
                closed: false,
                sender: Some(tx),
            }),
        });
        sessions.insert(id, session.clone());
        debug!(session = %session.id, repo, active = sessions.len(), "session registered");
        Some((session, rx))
    }

    /// Removes a session and marks it closed. Idempotent.
    pub fn unregister(&self, id: &str) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.remove(id) {
            session.close();
            debug!(session = id, active = sessions.len(), "session unregistered");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    /// Queues `request` on session `id` without blocking.
    pub fn send_request(&self, id: &str, request: JsonRpcRequest) -> Result<(), SendError> {
        let session = self.get(id).ok_or(SendError::NotFound)?;
        session.try_send(request)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 128 bits from the thread-local CSPRNG, hex-encoded.
fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Unregisters the session however the loop exits.
struct SessionGuard {
    manager: Arc<SessionManager>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.id);
    }
}

/// Everything the event loop of one session needs.
pub struct SessionTask {
    pub server: Arc<McpServer>,
    pub ctx: ToolContext,
    pub manager: Arc<SessionManager>,
    pub session: Arc<Session>,
    pub keepalive: Duration,
    /// Path announced in the `endpoint` event.
    pub endpoint: String,
}

impl SessionTask {
    /// Runs the session until the client goes away.
    ///
    /// Emits the `endpoint` event, then serves queued requests in arrival
    /// order and writes a keep-alive comment on every tick.
    pub async fn run(
        self,
        mut inbox: mpsc::Receiver<JsonRpcRequest>,
        events: mpsc::Sender<Event>,
    ) {
        let _guard = SessionGuard {
            manager: self.manager.clone(),
            id: self.session.id.clone(),
        };
        let session_id = self.session.id.as_str();

        let endpoint = Event::default().event("endpoint").data(&self.endpoint);
        if events.send(endpoint).await.is_err() {
            return;
        }
        info!(session = session_id, repo = %self.session.repo, "session established");

        let period = self.keepalive.max(Duration::from_millis(10));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = events.closed() => break,
                request = inbox.recv() => {
                    let Some(request) = request else { break };
                    let dispatched = self
                        .server
                        .clone()
                        .handle_request_blocking(self.ctx.clone(), request)
                        .await;
                    let Some(response) = dispatched else {
                        continue;
                    };
                    let event = match Event::default().event("message").json_data(&response) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(session = session_id, "failed to serialize response: {}", e);
                            continue;
                        }
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if events.send(Event::default().comment(KEEPALIVE_COMMENT)).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(session = session_id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn ping(id: i64) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::from(id),
            method: "ping".to_string(),
            params: None,
        }
    }

    #[test]
    fn test_capacity_is_enforced() {
        let manager = SessionManager::new(2, 4);
        let (a, _rx_a) = manager.register("acme/registry").unwrap();
        let (_b, _rx_b) = manager.register("acme/registry").unwrap();
        assert!(manager.register("acme/registry").is_none());

        manager.unregister(a.id());
        assert!(a.is_closed());
        assert!(manager.register("acme/registry").is_some());
    }

    #[test]
    fn test_session_ids_are_random_hex() {
        let manager = SessionManager::new(10, 1);
        let (a, _ra) = manager.register("acme/registry").unwrap();
        let (b, _rb) = manager.register("acme/registry").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);
        assert!(a.id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_full_queue_fails_fast() {
        let manager = SessionManager::new(1, 1);
        let (session, _rx) = manager.register("acme/registry").unwrap();
        assert_eq!(manager.send_request(session.id(), ping(1)), Ok(()));
        assert_eq!(manager.send_request(session.id(), ping(2)), Err(SendError::Full));
    }

    #[test]
    fn test_send_to_unknown_or_dropped_session() {
        let manager = SessionManager::new(1, 1);
        assert_eq!(manager.send_request("nope", ping(1)), Err(SendError::NotFound));

        let (session, rx) = manager.register("acme/registry").unwrap();
        drop(rx);
        assert_eq!(manager.send_request(session.id(), ping(1)), Err(SendError::Closed));

        manager.unregister(session.id());
        assert_eq!(manager.send_request(session.id(), ping(1)), Err(SendError::NotFound));
        assert!(manager.is_empty());
    }
}
