//! MCP (Model Context Protocol) server for XML entity registries.
//!
//! Provides a JSON-RPC 2.0 interface over HTTP, SSE and stdio so that AI
//! assistants can query an indexed registry. Exposes tools for searching,
//! entity lookup, listing, validation and document generation.

/// Per-request tool context.
pub mod context;

/// HTTP routes and the SSE endpoint.
pub mod http;

/// JSON-RPC method dispatch.
pub mod server;

/// SSE session registry and event loop.
pub mod sse;

/// Tool definitions and dispatch.
pub mod tools;

/// JSON-RPC 2.0 transport types.
pub mod transport;

pub use context::ToolContext;
pub use http::{router, AppState};
pub use server::{McpServer, MCP_PROTOCOL_VERSION};
pub use sse::{SendError, SessionManager};
pub use tools::{get_tool_definitions, ToolCallResult, ToolDefinition, ToolRegistry};
pub use transport::{parse_request, ErrorCode, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
