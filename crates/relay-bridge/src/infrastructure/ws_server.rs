//! WebSocket server: accept loop and per-session task management for the
//! duplex transport.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Upgrading each accepted connection to a WebSocket session.
//! 3. Registering the session with the [`Broker`] as a duplex connection.
//! 4. Running two concurrent tasks per session:
//!    - **Client → Broker**: reads JSON-RPC text frames and submits each
//!      request in its own task, so slow calls never block later ones.
//!    - **Broker → Client**: drains the session's bounded send queue into
//!      the WebSocket.
//! 5. Releasing the connection (and its interest) when either task ends.
//!
//! # Backpressure
//!
//! The hub owns the only strong sender of a session's queue.  When the queue
//! is full the hub drops the connection and resolves the session's close
//! signal, which aborts both tasks even while the writer is stuck on a
//! stalled socket.  Request handlers hold a weak sender, so they can never
//! keep an evicted session alive.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};

use crate::application::hub::{ClientSink, TransportKind};
use crate::application::Broker;
use crate::domain::messages::parse_request;

// ── Public API ────────────────────────────────────────────────────────────────

/// Runs the WebSocket accept loop until `running` is set to `false`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot be bound.
pub async fn run_ws_server(
    addr: SocketAddr,
    broker: Arc<Broker>,
    max_send_queue: usize,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;
    info!("WebSocket transport listening on {addr}");
    serve_ws(listener, broker, max_send_queue, running).await;
    Ok(())
}

/// Accept loop over an already bound listener.
pub async fn serve_ws(
    listener: TcpListener,
    broker: Arc<Broker>,
    max_send_queue: usize,
    running: Arc<AtomicBool>,
) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping WebSocket accept loop");
            break;
        }

        // Short timeout so the loop re-checks `running` while idle.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!("new WebSocket connection from {peer_addr}");
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    handle_session(stream, peer_addr, broker, max_send_queue).await;
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }
}

// ── Per-session handler ───────────────────────────────────────────────────────

async fn handle_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broker: Arc<Broker>,
    max_send_queue: usize,
) {
    match run_session(stream, peer_addr, broker, max_send_queue).await {
        Ok(()) => debug!("session {peer_addr} closed normally"),
        Err(e) => warn!("session {peer_addr} closed with error: {e:#}"),
    }
}

async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broker: Arc<Broker>,
    max_send_queue: usize,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

    let (tx, mut rx) = mpsc::channel::<Arc<String>>(max_send_queue.max(1));
    let replies = tx.downgrade();
    let id = broker
        .connect(TransportKind::Duplex, ClientSink::Queue(tx))
        .await;
    info!(connection_id = id, %peer_addr, "WebSocket client connected");
    let Some(mut closed) = broker.hub().closed(id).await else {
        broker.disconnect(id).await;
        return Ok(());
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // ── Task A: Broker → Client ───────────────────────────────────────────────
    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(text.as_ref().clone())).await.is_err() {
                debug!(connection_id = id, "WebSocket send failed (client disconnected)");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // ── Task B: Client → Broker ───────────────────────────────────────────────
    let reader_broker = Arc::clone(&broker);
    let mut reader = tokio::spawn(async move {
        loop {
            let msg = match ws_rx.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) | None => {
                    debug!(connection_id = id, "client stream ended");
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection_id = id, "WebSocket error: {e}");
                    break;
                }
            };

            match msg {
                WsMessage::Text(text) => {
                    let broker = Arc::clone(&reader_broker);
                    let replies = replies.clone();
                    tokio::spawn(async move {
                        let response = match parse_request(&text) {
                            Ok(request) => broker.submit(id, request).await,
                            Err(error_response) => Some(error_response),
                        };
                        let (Some(response), Some(tx)) = (response, replies.upgrade()) else {
                            return;
                        };
                        if tx.send(Arc::new(response.to_json())).await.is_err() {
                            debug!(connection_id = id, "response dropped; session closed");
                        }
                    });
                }
                WsMessage::Binary(_) => {
                    warn!(connection_id = id, "unexpected binary WebSocket frame (ignored)");
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                WsMessage::Close(_) => {
                    debug!(connection_id = id, "WebSocket Close frame received");
                    break;
                }
            }
        }
    });

    // Either side ending, or eviction by the hub, ends the session.
    tokio::select! {
        _ = &mut writer => debug!(connection_id = id, "writer task ended"),
        _ = &mut reader => debug!(connection_id = id, "reader task ended"),
        _ = &mut closed => debug!(connection_id = id, "connection evicted"),
    }
    writer.abort();
    reader.abort();
    broker.disconnect(id).await;
    info!(connection_id = id, %peer_addr, "WebSocket client disconnected");
    Ok(())
}
