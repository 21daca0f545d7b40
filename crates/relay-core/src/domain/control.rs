//! Control-process lifecycle state.
//!
//! The control process reports its own lifecycle through `state_changed`
//! pushes and through the `info` call.  The broker adds one state the control
//! process can never report itself: `Disconnected`, entered whenever the local
//! channel is lost.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the control process as seen by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    /// Connected, but the control process is still initialising.
    Starting,
    /// Fully operational; queries, subscriptions and jobs are allowed.
    Ready,
    /// The control process halted (e.g. emergency stop); needs a restart.
    Shutdown,
    /// The control process failed to start (configuration error, etc.).
    #[serde(rename = "error")]
    Errored,
    /// The local channel to the control process is down.
    Disconnected,
}

impl ControlState {
    /// Parses the state string used on the upstream wire.
    ///
    /// Unknown strings map to `None`; `"startup"` is accepted as an alias for
    /// `"starting"`.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "starting" | "startup" => Some(ControlState::Starting),
            "ready" => Some(ControlState::Ready),
            "shutdown" => Some(ControlState::Shutdown),
            "error" => Some(ControlState::Errored),
            "disconnected" => Some(ControlState::Disconnected),
            _ => None,
        }
    }

    /// The string used on the wire for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            ControlState::Starting => "starting",
            ControlState::Ready => "ready",
            ControlState::Shutdown => "shutdown",
            ControlState::Errored => "error",
            ControlState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`ControlState`] plus the free-text message reported with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStatus {
    pub state: ControlState,
    #[serde(default)]
    pub message: String,
}

impl ControlStatus {
    pub fn new(state: ControlState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }

    /// Status used before the first connection and after every channel loss.
    pub fn disconnected() -> Self {
        Self::new(ControlState::Disconnected, "control process not connected")
    }

    pub fn is_ready(&self) -> bool {
        self.state == ControlState::Ready
    }
}

impl Default for ControlStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire_accepts_startup_alias() {
        assert_eq!(ControlState::from_wire("startup"), Some(ControlState::Starting));
        assert_eq!(ControlState::from_wire("starting"), Some(ControlState::Starting));
    }

    #[test]
    fn test_from_wire_rejects_unknown_state() {
        assert_eq!(ControlState::from_wire("printing"), None);
    }

    #[test]
    fn test_errored_serializes_as_error() {
        let json = serde_json::to_string(&ControlState::Errored).unwrap();
        assert_eq!(json, "\"error\"");
        assert_eq!(ControlState::Errored.to_string(), "error");
    }

    #[test]
    fn test_default_status_is_disconnected() {
        let status = ControlStatus::default();
        assert_eq!(status.state, ControlState::Disconnected);
        assert!(!status.is_ready());
    }
}
