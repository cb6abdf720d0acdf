//! JSON-RPC 2.0 message types shared by the HTTP, SSE and stdio transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request received from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version; must be `"2.0"`.
    pub jsonrpc: String,
    /// Request identifier. May be a number, string, or null.
    /// Absent for notifications.
    #[serde(default)]
    pub id: Value,
    /// The RPC method name.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Returns `true` for messages that must never be answered.
    pub fn is_notification(&self) -> bool {
        self.method.starts_with("notifications/") || self.method == "initialized"
    }
}

/// A JSON-RPC 2.0 response sent back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version; always `"2.0"`.
    pub jsonrpc: String,
    /// The request identifier that this response corresponds to.
    pub id: Value,
    /// The result on success; absent on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure; absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Creates a successful JSON-RPC response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error JSON-RPC response.
    pub fn error(id: Value, code: ErrorCode, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code: code.as_i32(),
                message,
                data: None,
            }),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 error codes used by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received.
    ParseError,
    /// The request is not a valid JSON-RPC request.
    InvalidRequest,
    /// The requested method does not exist.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal server error.
    InternalError,
    /// A tool handler failed while executing.
    ToolExecution,
}

impl ErrorCode {
    /// Returns the numeric error code as defined by JSON-RPC 2.0.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ToolExecution => -32000,
        }
    }
}

/// Parses one JSON-RPC request from raw bytes.
///
/// On failure returns the error response to send back: `-32700` for
/// invalid JSON and `-32600` for a well-formed but invalid envelope. The
/// id is echoed when it could be read, and is `null` otherwise.
pub fn parse_request(raw: &[u8]) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| {
        JsonRpcResponse::error(
            Value::Null,
            ErrorCode::ParseError,
            format!("failed to parse JSON-RPC request: {}", e),
        )
    })?;

    let Value::Object(mut obj) = value else {
        return Err(JsonRpcResponse::error(
            Value::Null,
            ErrorCode::InvalidRequest,
            "request must be a JSON object".to_string(),
        ));
    };

    let id = match obj.remove("id") {
        None => Value::Null,
        Some(id @ (Value::Null | Value::String(_) | Value::Number(_))) => id,
        Some(_) => {
            return Err(JsonRpcResponse::error(
                Value::Null,
                ErrorCode::InvalidRequest,
                "id must be a string, number or null".to_string(),
            ));
        }
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        other => {
            return Err(JsonRpcResponse::error(
                id,
                ErrorCode::InvalidRequest,
                format!("unsupported jsonrpc version: {}", other.unwrap_or("<missing>")),
            ));
        }
    }

    let Some(method) = obj.get("method").and_then(Value::as_str).map(str::to_string) else {
        return Err(JsonRpcResponse::error(
            id,
            ErrorCode::InvalidRequest,
            "missing method".to_string(),
        ));
    };

    Ok(JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        method,
        params: obj.remove("params"),
    })
}
