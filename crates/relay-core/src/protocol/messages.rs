//! Upstream message types and inbound classification.
//!
//! Three shapes travel over the control-process channel:
//!
//! ```text
//! broker  → control:  {"id": 7, "method": "objects/query", "params": {...}}
//! control → broker:   {"id": 7, "result": {...}}  or  {"id": 7, "error": {...}}
//! control → broker:   {"method": "process_status_update", "params": {...}}   (push)
//! ```
//!
//! Anything carrying an `id` is a response and is matched to a pending call
//! by that id alone.  Anything without an `id` is an unsolicited push.
//! [`UpstreamMessage::classify`] performs that split and decodes the push
//! categories the broker understands.

use serde_json::{json, Map, Value};

use crate::domain::control::{ControlState, ControlStatus};
use crate::protocol::codec::{Frame, ProtocolError};

// ── Well-known upstream method names ──────────────────────────────────────────

/// Returns control-process identity and lifecycle state.
pub const METHOD_INFO: &str = "info";
/// Lists every queryable object.
pub const METHOD_OBJECTS_LIST: &str = "objects/list";
/// One-shot read of object attributes.
pub const METHOD_OBJECTS_QUERY: &str = "objects/query";
/// Replaces the broker's upstream subscription with a full object set.
pub const METHOD_OBJECTS_SUBSCRIBE: &str = "objects/subscribe";
/// Runs a script (job start commands, transition scripts).
pub const METHOD_GCODE_SCRIPT: &str = "gcode/script";

/// Push carrying a lifecycle change.
pub const PUSH_STATE_CHANGED: &str = "state_changed";
/// Push carrying a batch of object status changes.  Also used as the
/// `response_template` method for subscriptions.
pub const PUSH_STATUS_UPDATE: &str = "process_status_update";
/// Push carrying raw text output from the control process.
pub const PUSH_GCODE_RESPONSE: &str = "process_gcode_response";

// ── Outbound ──────────────────────────────────────────────────────────────────

/// A correlated request sent to the control process.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl UpstreamRequest {
    /// Builds the JSON object written on the wire.
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "method": self.method,
            "params": self.params,
        })
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// An explicit error returned by the control process for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFault {
    /// Error class reported by the control process (may be empty).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl UpstreamFault {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self {
                kind: String::new(),
                message: s.clone(),
            },
            Value::Object(obj) => Self {
                kind: obj
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string()),
            },
            other => Self {
                kind: String::new(),
                message: other.to_string(),
            },
        }
    }
}

/// Unsolicited messages from the control process.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    /// Lifecycle change of the control process.
    StateChanged(ControlStatus),
    /// A batch of changed object attributes.
    StatusUpdate {
        status: Map<String, Value>,
        eventtime: f64,
    },
    /// Raw text echoed by the control process.
    GcodeResponse(String),
    /// Any push the broker does not interpret; forwarded verbatim.
    Other { method: String, params: Value },
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    /// Reply to the call with correlation id `id`.
    Response {
        id: u64,
        outcome: Result<Value, UpstreamFault>,
    },
    /// Uncorrelated push.
    Push(PushMessage),
}

impl UpstreamMessage {
    /// Splits an inbound frame into a response or a push.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedFrame`] when the frame has neither a
    /// numeric `id` nor a `method`, or when a known push has unusable params.
    pub fn classify(mut frame: Frame) -> Result<Self, ProtocolError> {
        if let Some(id_value) = frame.remove("id") {
            let id = id_value.as_u64().ok_or_else(|| malformed("non-numeric response id"))?;
            let outcome = match frame.remove("error") {
                Some(err) => Err(UpstreamFault::from_value(&err)),
                None => Ok(frame.remove("result").unwrap_or(Value::Null)),
            };
            return Ok(UpstreamMessage::Response { id, outcome });
        }

        let method = match frame.remove("method") {
            Some(Value::String(m)) => m,
            _ => return Err(malformed("frame has neither id nor method")),
        };
        let params = frame.remove("params").unwrap_or(Value::Null);

        let push = match method.as_str() {
            PUSH_STATE_CHANGED => PushMessage::StateChanged(parse_state_params(&params)?),
            PUSH_STATUS_UPDATE => {
                let status = params
                    .get("status")
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or_else(|| malformed("status push without a status object"))?;
                let eventtime = params.get("eventtime").and_then(Value::as_f64).unwrap_or(0.0);
                PushMessage::StatusUpdate { status, eventtime }
            }
            PUSH_GCODE_RESPONSE => {
                let text = params
                    .get("response")
                    .and_then(Value::as_str)
                    .or_else(|| params.as_str())
                    .unwrap_or_default()
                    .to_string();
                PushMessage::GcodeResponse(text)
            }
            _ => PushMessage::Other { method, params },
        };
        Ok(UpstreamMessage::Push(push))
    }
}

/// Reads `{state, message}` (or the `info` reply's `{state, state_message}`).
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedFrame`] if `state` is missing or unknown.
pub fn parse_state_params(params: &Value) -> Result<ControlStatus, ProtocolError> {
    let state_str = params
        .get("state")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("state push without a state field"))?;
    let state = ControlState::from_wire(state_str)
        .ok_or_else(|| malformed(&format!("unknown control state '{state_str}'")))?;
    let message = params
        .get("message")
        .or_else(|| params.get("state_message"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(ControlStatus::new(state, message))
}

fn malformed(reason: &str) -> ProtocolError {
    ProtocolError::MalformedFrame {
        consumed: 0,
        reason: reason.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
