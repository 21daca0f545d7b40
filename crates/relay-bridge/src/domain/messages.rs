//! JSON-RPC 2.0 message types for the client-facing protocol.
//!
//! Every transport carries the same three JSON shapes:
//!
//! ```text
//! client → relay:  {"jsonrpc": "2.0", "method": "objects.query", "params": {...}, "id": 3}
//! relay  → client: {"jsonrpc": "2.0", "result": {...}, "id": 3}
//!                  {"jsonrpc": "2.0", "error": {"code": -32602, "message": "..."}, "id": 3}
//! relay  → client: {"jsonrpc": "2.0", "method": "status_update", "params": [...]}   (notification)
//! ```
//!
//! # Why hand-written structs instead of a JSON-RPC crate? (for beginners)
//!
//! The protocol is three small objects.  Plain `serde` structs keep the wire
//! format visible in one file and let the transports share a single parser,
//! [`parse_request`], which maps malformed input onto the standard JSON-RPC
//! error codes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol version string carried in every message.
pub const JSONRPC_VERSION: &str = "2.0";

// ── Notification method names ─────────────────────────────────────────────────

/// Object status slice for one client: params `[status, eventtime]`.
pub const NOTIFY_STATUS_UPDATE: &str = "status_update";
/// The control process became ready.
pub const NOTIFY_CONTROL_READY: &str = "control_ready";
/// The control process shut down or failed.
pub const NOTIFY_CONTROL_SHUTDOWN: &str = "control_shutdown";
/// The local channel to the control process was lost.
pub const NOTIFY_CONTROL_DISCONNECTED: &str = "control_disconnected";
/// Queue contents or scheduler state changed.
pub const NOTIFY_JOB_QUEUE_CHANGED: &str = "job_queue_changed";
/// Raw text output of the control process.
pub const NOTIFY_GCODE_RESPONSE: &str = "gcode_response";

// ── Standard error codes ──────────────────────────────────────────────────────

/// The text was not valid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON was not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// No such method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Parameters missing or of the wrong type.
pub const INVALID_PARAMS: i64 = -32602;
/// Unexpected internal failure.
pub const INTERNAL_ERROR: i64 = -32603;

// ── Inbound ───────────────────────────────────────────────────────────────────

/// A request (or, without `id`, a client notification).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Echoed verbatim in the response.  `None` means no response is sent.
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcRequest {
    /// Builds a request; used by tests and the in-process transports.
    pub fn new(method: impl Into<String>, params: Value, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }
}

/// Parses one request from text.
///
/// # Errors
///
/// Returns a ready-to-send error response: [`PARSE_ERROR`] for invalid JSON,
/// [`INVALID_REQUEST`] for JSON that is not a 2.0 request object.  The
/// response carries the request id when one could be recovered.
pub fn parse_request(text: &str) -> Result<RpcRequest, RpcResponse> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RpcResponse::failure(Value::Null, ErrorBody::new(PARSE_ERROR, e.to_string())))?;
    parse_request_value(value)
}

/// Same as [`parse_request`] for an already-decoded value.
///
/// # Errors
///
/// See [`parse_request`].
pub fn parse_request_value(value: Value) -> Result<RpcRequest, RpcResponse> {
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: RpcRequest = serde_json::from_value(value).map_err(|e| {
        RpcResponse::failure(id.clone(), ErrorBody::new(INVALID_REQUEST, e.to_string()))
    })?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(RpcResponse::failure(
            id,
            ErrorBody::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
        ));
    }
    Ok(request)
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A response to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: ErrorBody) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Serialises to a JSON string.  A response is always serialisable.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"jsonrpc":"2.0","error":{{"code":{INTERNAL_ERROR},"message":"unserialisable response"}},"id":null}}"#)
        })
    }
}

/// A server → client notification.  Params are always an array.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// `status_update [status, eventtime]`.
    pub fn status_update(status: serde_json::Map<String, Value>, eventtime: f64) -> Self {
        Self::new(NOTIFY_STATUS_UPDATE, vec![Value::Object(status), json!(eventtime)])
    }

    pub fn is_status_update(&self) -> bool {
        self.method == NOTIFY_STATUS_UPDATE
    }

    pub fn to_value(&self) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": self.method,
            "params": self.params,
        })
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
