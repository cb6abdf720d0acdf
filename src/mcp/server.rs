//! JSON-RPC dispatcher for the MCP methods.
//!
//! The dispatcher is transport-agnostic: HTTP, SSE and stdio all feed it
//! raw or parsed requests together with the [`ToolContext`] of the
//! repository being served, and forward whatever it returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, warn};

use crate::errors::Result;

use super::context::ToolContext;
use super::tools::ToolRegistry;
use super::transport::{parse_request, ErrorCode, JsonRpcRequest, JsonRpcResponse};

/// MCP protocol revision announced in `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Runtime statistics for the MCP server.
pub struct ServerStats {
    started_at: Instant,
    total_requests: AtomicU64,
    tool_calls: AtomicU64,
    errors: AtomicU64,
}

impl ServerStats {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            tool_calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

/// The MCP method dispatcher. One instance serves every repository.
pub struct McpServer {
    registry: ToolRegistry,
    stats: ServerStats,
    tool_call_counts: std::sync::Mutex<HashMap<String, u64>>,
}

impl Default for McpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl McpServer {
    pub fn new() -> Self {
        Self {
            registry: ToolRegistry::new(),
            stats: ServerStats::new(),
            tool_call_counts: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Parses and dispatches one raw message.
    ///
    /// Envelope errors are answered with their JSON-RPC error response.
    pub fn handle_message(&self, ctx: &ToolContext, raw: &[u8]) -> Option<JsonRpcResponse> {
        match parse_request(raw) {
            Ok(request) => self.handle_request(ctx, &request),
            Err(response) => {
                self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Some(response)
            }
        }
    }

    /// Dispatches a parsed JSON-RPC request to the appropriate handler.
    ///
    /// Returns `None` for notifications.
    pub fn handle_request(
        &self,
        ctx: &ToolContext,
        request: &JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        if request.is_notification() {
            debug!(method = %request.method, "notification received");
            return None;
        }

        let id = request.id.clone();
        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(ctx, id),
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(ctx, id, &request.params),
            "ping" => JsonRpcResponse::success(id, json!({})),
            _ => JsonRpcResponse::error(
                id,
                ErrorCode::MethodNotFound,
                format!("method not found: {}", request.method),
            ),
        };

        if response.error.is_some() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }

        Some(response)
    }

    /// Runs [`McpServer::handle_message`] on the blocking pool so tool
    /// execution never stalls the async workers.
    pub async fn handle_message_blocking(
        self: Arc<Self>,
        ctx: ToolContext,
        raw: Vec<u8>,
    ) -> Option<JsonRpcResponse> {
        match tokio::task::spawn_blocking(move || self.handle_message(&ctx, &raw)).await {
            Ok(response) => response,
            Err(e) => {
                error!("dispatch task failed: {}", e);
                Some(JsonRpcResponse::error(
                    Value::Null,
                    ErrorCode::InternalError,
                    "internal error".to_string(),
                ))
            }
        }
    }

    /// Runs [`McpServer::handle_request`] on the blocking pool.
    pub async fn handle_request_blocking(
        self: Arc<Self>,
        ctx: ToolContext,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let notification = request.is_notification();
        match tokio::task::spawn_blocking(move || self.handle_request(&ctx, &request)).await {
            Ok(response) => response,
            Err(e) => {
                error!("dispatch task failed: {}", e);
                (!notification).then(|| {
                    JsonRpcResponse::error(id, ErrorCode::InternalError, "internal error".to_string())
                })
            }
        }
    }

    /// Handles the `initialize` method, returning server capabilities.
    fn handle_initialize(&self, ctx: &ToolContext, id: Value) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": ctx.server_name(),
                    "version": env!("CARGO_PKG_VERSION")
                },
                "instructions": ctx.config().server.instructions,
            }),
        )
    }

    /// Handles the `tools/list` method, returning all available tool definitions.
    fn handle_tools_list(&self, id: Value) -> JsonRpcResponse {
        JsonRpcResponse::success(id, json!({ "tools": self.registry.definitions() }))
    }

    /// Handles the `tools/call` method, dispatching to the appropriate tool handler.
    fn handle_tools_call(
        &self,
        ctx: &ToolContext,
        id: Value,
        params: &Option<Value>,
    ) -> JsonRpcResponse {
        let params = match params {
            Some(p) => p,
            None => {
                return JsonRpcResponse::error(
                    id,
                    ErrorCode::InvalidParams,
                    "missing params for tools/call".to_string(),
                );
            }
        };

        let tool_name = match params.get("name").and_then(|v| v.as_str()) {
            Some(name) if !name.is_empty() => name,
            _ => {
                return JsonRpcResponse::error(
                    id,
                    ErrorCode::InvalidParams,
                    "missing 'name' in tools/call params".to_string(),
                );
            }
        };

        let arguments = match params.get("arguments") {
            Some(Value::Null) | None => json!({}),
            Some(args) => args.clone(),
        };

        self.stats.tool_calls.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut counts) = self.tool_call_counts.lock() {
            *counts.entry(tool_name.to_string()).or_insert(0) += 1;
        }

        let with_stats;
        let ctx = if tool_name == "identify" {
            with_stats = ToolContext {
                server_stats: Some(self.server_stats_json()),
                ..ctx.clone()
            };
            &with_stats
        } else {
            ctx
        };

        match self.registry.call(ctx, tool_name, &arguments) {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::error(
                    id,
                    ErrorCode::InternalError,
                    format!("failed to serialize tool result: {}", e),
                ),
            },
            Err(e) => {
                warn!(tool = tool_name, "tool execution failed: {}", e);
                JsonRpcResponse::error(
                    id,
                    ErrorCode::ToolExecution,
                    format!("tool execution failed: {}", e),
                )
            }
        }
    }

    /// Returns the current server runtime statistics as a JSON value.
    pub fn server_stats_json(&self) -> Value {
        let uptime = self.stats.started_at.elapsed();
        let tool_counts: Value = self
            .tool_call_counts
            .lock()
            .map(|counts| json!(*counts))
            .unwrap_or(json!({}));

        json!({
            "uptime_secs": uptime.as_secs(),
            "total_requests": self.stats.total_requests.load(Ordering::Relaxed),
            "tool_calls": self.stats.tool_calls.load(Ordering::Relaxed),
            "errors": self.stats.errors.load(Ordering::Relaxed),
            "tool_call_counts": tool_counts,
        })
    }

    /// Serves one repository over stdio, one JSON-RPC message per line.
    /// Runs until stdin is closed.
    pub async fn run_stdio(&self, ctx: &ToolContext) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(response) = self.handle_message(ctx, line.as_bytes()) else {
                continue;
            };

            let json_line = match serde_json::to_string(&response) {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to serialize response: {}", e);
                    continue;
                }
            };
            stdout.write_all(json_line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }

        Ok(())
    }
}
