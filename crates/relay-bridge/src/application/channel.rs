//! The seam between the use cases and the control-process link.
//!
//! Use cases never touch the socket.  They issue calls through
//! [`ControlChannel`] and react to [`ControlEvent`]s the link produces, in
//! wire order, on a single channel.

use async_trait::async_trait;
use relay_core::ControlStatus;
use serde_json::{Map, Value};

use crate::application::error::RelayError;

/// Correlated calls to the control process.
///
/// The infrastructure implementation is `Link`; tests use recording fakes.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Issues `method` with `params` and waits for the matching response.
    ///
    /// # Errors
    ///
    /// [`RelayError::LinkDisconnected`], [`RelayError::CallTimeout`] or
    /// [`RelayError::UpstreamError`].
    async fn call(&self, method: &str, params: Value) -> Result<Value, RelayError>;
}

/// Something the control process (or the link itself) reported.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A new connection generation started.
    Connected { generation: u64 },
    /// The lifecycle state changed; `Disconnected` on channel loss.
    StateChanged(ControlStatus),
    /// A batch of changed object attributes.
    Status {
        status: Map<String, Value>,
        eventtime: f64,
    },
    /// Raw text output.
    GcodeResponse(String),
    /// A push the broker forwards without interpreting.
    Other { method: String, params: Value },
}

// ── Test support ──────────────────────────────────────────────────────────────

/// Recording [`ControlChannel`] shared by the application unit tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use tokio::sync::Notify;

    type Handler = Box<dyn Fn(&Value) -> Result<Value, RelayError> + Send + Sync>;

    /// Replies per method; records every call in order.
    #[derive(Default)]
    pub(crate) struct FakeControl {
        pub calls: Mutex<Vec<(String, Value)>>,
        handlers: Mutex<HashMap<String, Handler>>,
        gates: Mutex<HashMap<String, Arc<Notify>>>,
    }

    impl FakeControl {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Answers `method` with `f(params)`.
        pub fn on<F>(&self, method: &str, f: F)
        where
            F: Fn(&Value) -> Result<Value, RelayError> + Send + Sync + 'static,
        {
            self.handlers
                .lock()
                .unwrap()
                .insert(method.to_string(), Box::new(f));
        }

        /// Makes calls to `method` wait until the returned `Notify` fires.
        pub fn gate(&self, method: &str) -> Arc<Notify> {
            let notify = Arc::new(Notify::new());
            self.gates
                .lock()
                .unwrap()
                .insert(method.to_string(), Arc::clone(&notify));
            notify
        }

        pub fn calls_to(&self, method: &str) -> Vec<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == method)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ControlChannel for FakeControl {
        async fn call(&self, method: &str, params: Value) -> Result<Value, RelayError> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params.clone()));
            let gate = self.gates.lock().unwrap().get(method).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            match self.handlers.lock().unwrap().get(method) {
                Some(handler) => handler(&params),
                None => Ok(Value::Object(Map::new())),
            }
        }
    }
}
