//! JSON-RPC 2.0 frame parsing and formatting.
//!
//! The wire shapes are bit-exact: every outbound object carries
//! `"jsonrpc":"2.0"`, requests and responses carry an `id`, notifies do not.
//! Inbound classification follows the upstream convention that a *falsy* id
//! (absent, `null`, `false`, `0`, `""`) marks a notify rather than a request;
//! peers that use `0` as a numeric request id will not get a reply.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CoreError;

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The frame is not a valid JSON-RPC 2.0 object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method is not registered.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Default bucket for handler failures.
pub const INTERNAL_ERROR: i64 = -32603;
/// Server-side resource exhaustion (gate saturated).
pub const SERVER_ERROR: i64 = -32000;

/// A normalized JSON-RPC error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, default_message(PARSE_ERROR))
    }

    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, default_message(INVALID_REQUEST))
    }

    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, default_message(METHOD_NOT_FOUND))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(SERVER_ERROR, message)
    }

    /// Normalizes a heterogeneous error value to `{code, message}`.
    ///
    /// Accepts a bare numeric code, a bare message string, or an object
    /// carrying `code` and/or `message`; anything else lands in the internal
    /// bucket with its JSON rendering as the message.
    pub fn normalize(value: &Value) -> Self {
        match value {
            Value::Number(code) => {
                let code = code.as_i64().unwrap_or(INTERNAL_ERROR);
                Self::new(code, default_message(code))
            }
            Value::String(message) => Self::internal(message.clone()),
            Value::Object(fields) => {
                let code = fields
                    .get("code")
                    .and_then(Value::as_i64)
                    .unwrap_or(INTERNAL_ERROR);
                let message = fields
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| default_message(code).to_string());
                Self::new(code, message)
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl From<i64> for ErrorObject {
    fn from(code: i64) -> Self {
        Self::new(code, default_message(code))
    }
}

impl From<&str> for ErrorObject {
    fn from(message: &str) -> Self {
        Self::internal(message)
    }
}

impl From<String> for ErrorObject {
    fn from(message: String) -> Self {
        Self::internal(message)
    }
}

impl From<&CoreError> for ErrorObject {
    fn from(error: &CoreError) -> Self {
        match error {
            CoreError::Rpc(error) => error.clone(),
            CoreError::TooManyQueued => Self::server("server is busy"),
            CoreError::Aborted(reason) => Self::internal(reason.as_str()),
            other => Self::internal(other.to_string()),
        }
    }
}

fn default_message(code: i64) -> &'static str {
    match code {
        PARSE_ERROR => "parse error",
        INVALID_REQUEST => "invalid request",
        METHOD_NOT_FOUND => "method not found",
        INTERNAL_ERROR => "internal error",
        SERVER_ERROR => "server error",
        _ => "unknown error",
    }
}

/// A decoded JSON-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notify {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        result: Result<Value, ErrorObject>,
    },
}

impl Frame {
    pub fn method(&self) -> Option<&str> {
        match self {
            Frame::Request { method, .. } | Frame::Notify { method, .. } => Some(method),
            Frame::Response { .. } => None,
        }
    }
}

/// JavaScript-style truthiness, used for the request/notify id split.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Decodes an already-parsed JSON value into a [`Frame`].
pub fn parse_value(value: Value) -> Result<Frame, ErrorObject> {
    let Value::Object(fields) = value else {
        return Err(ErrorObject::invalid_request());
    };
    if fields.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(ErrorObject::invalid_request());
    }

    if let Some(method) = fields.get("method") {
        let method = method
            .as_str()
            .filter(|method| !method.is_empty())
            .ok_or_else(ErrorObject::invalid_request)?
            .to_string();
        let params = fields.get("params").cloned().unwrap_or(Value::Null);
        let id = fields.get("id").cloned().unwrap_or(Value::Null);
        if is_truthy(&id) {
            return Ok(Frame::Request { id, method, params });
        }
        return Ok(Frame::Notify { method, params });
    }

    let id = fields.get("id").cloned().unwrap_or(Value::Null);
    if let Some(error) = fields.get("error") {
        return Ok(Frame::Response {
            id,
            result: Err(ErrorObject::normalize(error)),
        });
    }
    if let Some(result) = fields.get("result") {
        return Ok(Frame::Response {
            id,
            result: Ok(result.clone()),
        });
    }
    Err(ErrorObject::invalid_request())
}

/// Decodes a raw JSON string into a [`Frame`].
pub fn parse_str(input: &str) -> Result<Frame, ErrorObject> {
    let value: Value = serde_json::from_str(input).map_err(|_| ErrorObject::parse_error())?;
    parse_value(value)
}

pub fn format_request(id: &str, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn format_notify(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub fn format_result(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn format_error(id: &Value, error: &ErrorObject) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": error.code, "message": error.message },
    })
}
