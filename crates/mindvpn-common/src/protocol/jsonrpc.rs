//! JSON-RPC 2.0 envelopes for the agent channel.
//!
//! The control plane sends every task to a node agent as a single
//! JSON-RPC 2.0 call:
//!
//! - Request: `{"jsonrpc": "2.0", "method": "agent.execute", "params": ..., "id": ...}`
//! - Response: `{"jsonrpc": "2.0", "result": ..., "error": ..., "id": ...}`
//! - Error: `{"code": ..., "message": "...", "data": ...}`
//!
//! # Example
//!
//! ```
//! use mindvpn_common::protocol::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new("agent.execute", json!({"task_id": 1}), json!(1));
//! assert_eq!(request.jsonrpc, "2.0");
//!
//! let response = JsonRpcResponse::error(json!(1), JsonRpcError::method_not_found());
//! assert!(response.result.is_none());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version string carried by every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name agents expose for task execution
pub const AGENT_EXECUTE_METHOD: &str = "agent.execute";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be "2.0"
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Number or string; echoed back in the response
    pub id: Value,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 response
///
/// Exactly one of `result` and `error` is present on a well-formed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Splits the envelope into its outcome.
    ///
    /// A response carrying neither field is reported as an internal error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(JsonRpcError::internal_error(
                "response carried neither result nor error",
            )),
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Invalid JSON was received
pub const PARSE_ERROR: i32 = -32700;
/// The JSON sent is not a valid request object
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Agent-side failure while executing the task (server error range)
pub const EXECUTION_FAILED: i32 = -32000;

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(EXECUTION_FAILED, message)
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}
