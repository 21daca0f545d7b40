//! Link: the single connection to the control process.
//!
//! This module is the only code that reads or writes the upstream channel.
//!
//! # Correlation
//!
//! Every call gets a fresh id from a [`SequenceCounter`] and a oneshot
//! receiver parked in the pending map.  The reader task completes the
//! matching entry when a response arrives; responses may arrive in any order.
//!
//! # Generations
//!
//! The link counts connection generations.  Losing the channel bumps the
//! generation and fails every pending call of the old one with
//! [`LinkError::Disconnected`] in one step, so no caller ever receives a
//! response that belongs to a dead connection.
//!
//! ```text
//! call ─► lock writer ─► pending.insert(id, gen) ─► writer task ─► socket
//! socket ─► reader task ─► FrameDecoder ─► classify ─┬─► pending.remove(id) ─► caller
//!                                                    └─► ControlEvent channel (wire order)
//! ```
//!
//! # Single writer
//!
//! Frames are handed to one writer task over a channel.  Concurrent callers
//! never interleave bytes on the socket, and none of them waits for another
//! caller's response.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::protocol::messages::METHOD_INFO;
use relay_core::{
    encode_frame, parse_state_params, ControlState, ControlStatus, FrameDecoder, ProtocolError,
    PushMessage, SequenceCounter, UpstreamFault, UpstreamMessage, UpstreamRequest,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::application::channel::{ControlChannel, ControlEvent};
use crate::application::error::RelayError;

/// Failure of one upstream call.
#[derive(Debug, Error, PartialEq)]
pub enum LinkError {
    #[error("control process link disconnected")]
    Disconnected,

    #[error("call '{method}' timed out")]
    Timeout { method: String },

    #[error("control process error: {}", .0.message)]
    Upstream(UpstreamFault),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<LinkError> for RelayError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Disconnected => RelayError::LinkDisconnected,
            LinkError::Timeout { method } => RelayError::CallTimeout { method },
            LinkError::Upstream(fault) => RelayError::UpstreamError {
                kind: fault.kind,
                message: fault.message,
            },
            LinkError::Protocol(e) => RelayError::Internal(e.to_string()),
        }
    }
}

type CallResult = Result<Value, LinkError>;

struct PendingCall {
    generation: u64,
    method: String,
    reply: oneshot::Sender<CallResult>,
}

struct Shared {
    ids: SequenceCounter,
    generation: AtomicU64,
    /// Outbound frame queue of the live connection; `None` while detached.
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    status: RwLock<ControlStatus>,
    events: mpsc::UnboundedSender<ControlEvent>,
    call_timeout: Duration,
}

/// Handle to the control-process connection.  Cheap to clone.
#[derive(Clone)]
pub struct Link {
    shared: Arc<Shared>,
}

impl Link {
    /// Creates a detached link and the receiver for its events.
    pub fn new(call_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Self {
            shared: Arc::new(Shared {
                ids: SequenceCounter::starting_at(1),
                generation: AtomicU64::new(0),
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                status: RwLock::new(ControlStatus::disconnected()),
                events,
                call_timeout,
            }),
        };
        (link, rx)
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub async fn control_status(&self) -> ControlStatus {
        self.shared.status.read().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    pub async fn is_attached(&self) -> bool {
        self.shared.writer.lock().await.is_some()
    }

    /// Issues `method` and waits up to `timeout` for its response.
    ///
    /// # Errors
    ///
    /// [`LinkError::Disconnected`] if no connection is attached or it is lost
    /// before the response arrives, [`LinkError::Timeout`] after `timeout`,
    /// [`LinkError::Upstream`] for an explicit error response.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> CallResult {
        let id = self.shared.ids.next();
        let request = UpstreamRequest {
            id,
            method: method.to_string(),
            params,
        };
        let bytes = encode_frame(&request.to_value())?;

        let rx = {
            let writer = self.shared.writer.lock().await;
            let tx = writer.as_ref().ok_or(LinkError::Disconnected)?;
            let (reply, rx) = oneshot::channel();
            let generation = self.generation();
            self.shared.pending.lock().await.insert(
                id,
                PendingCall {
                    generation,
                    method: method.to_string(),
                    reply,
                },
            );
            if tx.send(bytes).is_err() {
                self.shared.pending.lock().await.remove(&id);
                return Err(LinkError::Disconnected);
            }
            trace!(id, method, generation, "call sent");
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                debug!(id, method, "call timed out");
                Err(LinkError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Starts a new connection generation over `stream`.
    ///
    /// Spawns the reader and writer tasks and asks the control process for
    /// its current state.  The returned handle completes once the connection
    /// is lost and every pending call of this generation has failed.
    pub async fn attach<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let generation = {
            let mut writer = self.shared.writer.lock().await;
            *writer = Some(tx);
            self.generation()
        };
        info!(generation, "control link attached");
        self.emit(ControlEvent::Connected { generation });

        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!(generation, error = %e, "upstream write failed");
                    break;
                }
            }
        });

        let reader = self.clone();
        let handle = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = vec![0u8; 8192];
            loop {
                let n = match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!(generation, "control process closed the channel");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(generation, error = %e, "upstream read failed");
                        break;
                    }
                };
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => match UpstreamMessage::classify(frame) {
                            Ok(message) => reader.dispatch(message).await,
                            Err(e) => warn!(generation, error = %e, "unusable frame dropped"),
                        },
                        Ok(None) => break,
                        Err(e) => warn!(generation, error = %e, "malformed frame dropped"),
                    }
                }
            }
            reader.handle_loss(generation).await;
        });

        let refresher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = refresher.refresh_status().await {
                debug!(generation, error = %e, "initial state query failed");
            }
        });

        handle
    }

    /// Asks the control process for its state.
    ///
    /// The reader adopts the answer when the response frame arrives, so a
    /// `state_changed` push that follows it on the wire still wins.
    ///
    /// # Errors
    ///
    /// Any [`LinkError`] of the `info` call.
    pub async fn refresh_status(&self) -> Result<ControlStatus, LinkError> {
        let result = self
            .call_with_timeout(METHOD_INFO, json!({}), self.shared.call_timeout)
            .await?;
        Ok(parse_state_params(&result)?)
    }

    /// Connects to the Unix socket at `socket_path` and reattaches after every
    /// loss, every `reconnect_interval`, until `running` clears.
    #[cfg(unix)]
    pub async fn run(self, socket_path: PathBuf, reconnect_interval: Duration, running: Arc<AtomicBool>) {
        info!(path = %socket_path.display(), "control link started");
        while running.load(Ordering::Relaxed) {
            match tokio::net::UnixStream::connect(&socket_path).await {
                Ok(stream) => {
                    let mut handle = self.attach(stream).await;
                    loop {
                        tokio::select! {
                            _ = &mut handle => break,
                            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                                if !running.load(Ordering::Relaxed) {
                                    handle.abort();
                                    self.handle_loss(self.generation()).await;
                                    return;
                                }
                            }
                        }
                    }
                    warn!(generation = self.generation(), "control link lost; reconnecting");
                }
                Err(e) => {
                    debug!(path = %socket_path.display(), error = %e, "control socket unavailable");
                }
            }
            tokio::time::sleep(reconnect_interval).await;
        }
        info!("control link stopped");
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn dispatch(&self, message: UpstreamMessage) {
        match message {
            UpstreamMessage::Response { id, outcome } => {
                let Some(call) = self.shared.pending.lock().await.remove(&id) else {
                    debug!(id, "response for unknown or expired call");
                    return;
                };
                if call.generation != self.generation() {
                    return;
                }
                trace!(id, method = %call.method, "response");
                if call.method == METHOD_INFO {
                    if let Ok(result) = &outcome {
                        match parse_state_params(result) {
                            Ok(status) => self.set_status(status).await,
                            Err(e) => debug!(id, error = %e, "unusable info response"),
                        }
                    }
                }
                let _ = call.reply.send(outcome.map_err(LinkError::Upstream));
            }
            UpstreamMessage::Push(push) => match push {
                PushMessage::StateChanged(status) => self.set_status(status).await,
                PushMessage::StatusUpdate { status, eventtime } => {
                    self.emit(ControlEvent::Status { status, eventtime });
                }
                PushMessage::GcodeResponse(text) => self.emit(ControlEvent::GcodeResponse(text)),
                PushMessage::Other { method, params } => {
                    self.emit(ControlEvent::Other { method, params });
                }
            },
        }
    }

    /// Ends `generation`: detaches the writer, fails its pending calls and
    /// reports `disconnected`.  A no-op if `generation` already ended.
    async fn handle_loss(&self, generation: u64) {
        {
            let mut writer = self.shared.writer.lock().await;
            if self.generation() != generation || writer.is_none() {
                return;
            }
            *writer = None;
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
        }
        let failed: Vec<PendingCall> = self.shared.pending.lock().await.drain().map(|(_, c)| c).collect();
        if !failed.is_empty() {
            info!(generation, calls = failed.len(), "failing calls of lost connection");
        }
        for call in failed {
            let _ = call.reply.send(Err(LinkError::Disconnected));
        }
        self.set_status(ControlStatus::disconnected()).await;
    }

    async fn set_status(&self, status: ControlStatus) {
        {
            let mut current = self.shared.status.write().await;
            if current.state == status.state {
                *current = status;
                return;
            }
            *current = status.clone();
        }
        if status.state != ControlState::Ready {
            debug!(state = %status.state, message = %status.message, "control state");
        }
        self.emit(ControlEvent::StateChanged(status));
    }

    fn emit(&self, event: ControlEvent) {
        if self.shared.events.send(event).is_err() {
            trace!("control event receiver dropped");
        }
    }
}

#[async_trait]
impl ControlChannel for Link {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RelayError> {
        self.call_with_timeout(method, params, self.shared.call_timeout)
            .await
            .map_err(RelayError::from)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
