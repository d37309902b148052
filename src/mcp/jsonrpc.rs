//! JSON-RPC 2.0 envelope and error types.
//!
//! Error codes follow the JSON-RPC 2.0 standard range:
//! - -32700: parse error
//! - -32600 to -32603: request, method, params and internal errors

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum JsonRpcErrorCode {
    /// Invalid JSON was received by the server.
    ParseError = -32700,
    /// The JSON sent is not a valid Request object.
    InvalidRequest = -32600,
    /// The method does not exist / is not available.
    MethodNotFound = -32601,
    /// Invalid method parameter(s).
    InvalidParams = -32602,
    /// Internal JSON-RPC error.
    InternalError = -32603,
}

impl JsonRpcErrorCode {
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl JsonRpcError {
    /// Error with the code's default message.
    pub fn from_code(code: JsonRpcErrorCode) -> Self {
        Self {
            code: code as i32,
            message: code.default_message().to_string(),
            data: None,
        }
    }

    pub fn new(code: JsonRpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: JsonRpcErrorCode, message: impl Into<String>, data: Value) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(JsonRpcErrorCode::InvalidParams, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
        )
    }

    /// Convert to the JSON-RPC error object.
    pub fn to_dict(&self) -> Value {
        let mut error = serde_json::Map::new();
        error.insert("code".to_string(), Value::Number(self.code.into()));
        error.insert("message".to_string(), Value::String(self.message.clone()));
        if let Some(ref data) = self.data {
            error.insert("data".to_string(), data.clone());
        }
        Value::Object(error)
    }

    /// Convert to a full JSON-RPC error response.
    pub fn to_response(&self, request_id: Option<Value>) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "error": self.to_dict(),
            "id": request_id.unwrap_or(Value::Null),
        })
    }
}

/// An inbound JSON-RPC message: a request, or a notification when `id` is
/// absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Validate a parsed JSON value as a 2.0 request or notification.
    pub fn from_value(value: Value) -> Result<Self, JsonRpcError> {
        let id = value.get("id").cloned().filter(|id| !id.is_null());
        let version_ok = value.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION);
        let method = value.get("method").and_then(Value::as_str).map(str::to_string);
        match (version_ok, method) {
            (true, Some(method)) => Ok(Self {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                method,
                params: value.get("params").cloned(),
            }),
            (false, _) => Err(JsonRpcError::new(
                JsonRpcErrorCode::InvalidRequest,
                "Invalid Request: jsonrpc must be \"2.0\"",
            )),
            (true, None) => Err(JsonRpcError::new(
                JsonRpcErrorCode::InvalidRequest,
                "Invalid Request: method is required",
            )),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Params as an object, or an empty one when absent.
    pub fn params_object(&self) -> Result<serde_json::Map<String, Value>, JsonRpcError> {
        match &self.params {
            None | Some(Value::Null) => Ok(serde_json::Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(_) => Err(JsonRpcError::invalid_params("Invalid params: params must be an object")),
        }
    }
}

/// Successful JSON-RPC response.
pub fn success_response(id: Option<Value>, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.unwrap_or(Value::Null),
        "result": result,
    })
}
