//! Error taxonomy for every client-visible operation.
//!
//! Each variant maps to a stable JSON-RPC error code via
//! [`RelayError::code`], so clients can branch on the number rather than on
//! the message text.

use relay_core::{InterestError, JobId, QueueError, QueueState};
use thiserror::Error;

use crate::domain::messages::{ErrorBody, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};

// ── Error code constants ──────────────────────────────────────────────────────

/// The channel to the control process dropped while the call was pending.
pub const LINK_DISCONNECTED: i64 = -32001;
/// No upstream response within the call deadline.
pub const CALL_TIMEOUT: i64 = -32002;
/// The control process rejected the call.
pub const UPSTREAM_ERROR: i64 = -32003;
/// The referenced connection does not exist.
pub const UNKNOWN_CLIENT: i64 = -32004;
/// The queue is in a state that does not allow the operation.
pub const QUEUE_STATE_CONFLICT: i64 = -32005;
/// The referenced job is not queued.
pub const JOB_NOT_FOUND: i64 = -32006;
/// The caller is not identified as an authorized client.
pub const UNAUTHORIZED: i64 = -32007;
/// `connection.identify` was called twice on one connection.
pub const ALREADY_IDENTIFIED: i64 = -32008;

/// Failure of a client-invoked or internal operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelayError {
    #[error("control process link disconnected")]
    LinkDisconnected,

    #[error("upstream call '{method}' timed out")]
    CallTimeout { method: String },

    #[error("upstream error: {message}")]
    UpstreamError { kind: String, message: String },

    #[error("invalid subscription: {0}")]
    InvalidInterest(#[from] InterestError),

    #[error("unknown connection {0}")]
    UnknownClient(u64),

    #[error("job queue is {state}; cannot {operation}")]
    QueueStateConflict {
        state: QueueState,
        operation: &'static str,
    },

    #[error("job {0} is not in the queue")]
    JobNotFound(JobId),

    #[error("method '{0}' not found")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("connection is not authorized for this call")]
    Unauthorized,

    #[error("connection {0} has already identified")]
    AlreadyIdentified(u64),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Stable JSON-RPC error code for this variant.
    pub fn code(&self) -> i64 {
        match self {
            Self::LinkDisconnected => LINK_DISCONNECTED,
            Self::CallTimeout { .. } => CALL_TIMEOUT,
            Self::UpstreamError { .. } => UPSTREAM_ERROR,
            Self::InvalidInterest(_) | Self::InvalidParams(_) => INVALID_PARAMS,
            Self::UnknownClient(_) => UNKNOWN_CLIENT,
            Self::QueueStateConflict { .. } => QUEUE_STATE_CONFLICT,
            Self::JobNotFound(_) => JOB_NOT_FOUND,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::Unauthorized => UNAUTHORIZED,
            Self::AlreadyIdentified(_) => ALREADY_IDENTIFIED,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

impl From<QueueError> for RelayError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::JobNotFound(id) => RelayError::JobNotFound(id),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
