//! Broker: JSON-RPC method dispatch and the control-event loop.
//!
//! Every transport hands its connections and requests to the same
//! [`Broker`]; it is the only place that branches on
//! [`TransportKind`] capabilities.
//!
//! # Event loop
//!
//! The link produces [`ControlEvent`]s in wire order on one channel.
//! [`Broker::run_events`] handles them one at a time, finishing every
//! delivery for a push before reading the next, which keeps per-client
//! `status_update` order identical to wire order.  The same loop releases
//! the interest of connections the hub evicted, whichever component was
//! delivering at the time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_core::{ControlState, ControlStatus, JobId};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::auth::ClientIdentity;
use crate::application::channel::ControlEvent;
use crate::application::error::RelayError;
use crate::application::hub::{ClientSink, ConnectionId, Target, TransportHub, TransportKind};
use crate::application::scheduler::{scheduler_interest, JobScheduler, RemoveSelection};
use crate::application::subscriptions::{Subscriber, SubscriptionService};
use crate::domain::messages::{
    Notification, RpcRequest, RpcResponse, NOTIFY_CONTROL_DISCONNECTED, NOTIFY_CONTROL_READY,
    NOTIFY_CONTROL_SHUTDOWN, NOTIFY_GCODE_RESPONSE,
};

/// Routes client requests and control events between the components.
pub struct Broker {
    hub: Arc<TransportHub>,
    subscriptions: Arc<SubscriptionService>,
    scheduler: Arc<JobScheduler>,
}

impl Broker {
    pub fn new(
        hub: Arc<TransportHub>,
        subscriptions: Arc<SubscriptionService>,
        scheduler: Arc<JobScheduler>,
    ) -> Self {
        Self {
            hub,
            subscriptions,
            scheduler,
        }
    }

    pub fn hub(&self) -> &Arc<TransportHub> {
        &self.hub
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionService> {
        &self.subscriptions
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Registers the scheduler's internal `print_stats` interest.
    pub async fn init(&self) {
        if let Err(e) = self
            .subscriptions
            .subscribe(Subscriber::Scheduler, &scheduler_interest())
            .await
        {
            warn!(error = %e, "scheduler subscription deferred");
        }
    }

    // ── Connections ──────────────────────────────────────────────────────────

    pub async fn connect(&self, kind: TransportKind, sink: ClientSink) -> ConnectionId {
        self.hub.register(kind, sink).await
    }

    /// Removes the connection and releases all of its interest.
    pub async fn disconnect(&self, id: ConnectionId) {
        let was_live = self.hub.unregister(id).await;
        let had_interest = self.subscriptions.remove_subscriber(Subscriber::Connection(id)).await;
        debug!(connection_id = id, was_live, had_interest, "connection closed");
    }

    /// Subscribes a topic client to every attribute of `objects` without
    /// a subscribe call.
    ///
    /// # Errors
    ///
    /// Link errors from the upstream resubscription; the interest stays
    /// registered and is retried.
    pub async fn register_static(&self, id: ConnectionId, objects: &[String]) -> Result<(), RelayError> {
        if objects.is_empty() {
            return Ok(());
        }
        let request: serde_json::Map<String, Value> = objects
            .iter()
            .map(|name| (name.clone(), json!("*")))
            .collect();
        self.subscriptions
            .subscribe(Subscriber::Connection(id), &Value::Object(request))
            .await
            .map(|_| ())
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Executes `request` for connection `id`.  Returns `None` for client
    /// notifications (requests without an id).
    pub async fn submit(&self, id: ConnectionId, request: RpcRequest) -> Option<RpcResponse> {
        debug!(connection_id = id, method = %request.method, "request");
        let outcome = self.dispatch(id, &request.method, &request.params).await;
        let reply_id = request.id?;
        Some(match outcome {
            Ok(result) => RpcResponse::success(reply_id, result),
            Err(e) => {
                debug!(connection_id = id, method = %request.method, error = %e, "request failed");
                RpcResponse::failure(reply_id, e.to_error_body())
            }
        })
    }

    async fn dispatch(&self, id: ConnectionId, method: &str, params: &Value) -> Result<Value, RelayError> {
        let kind = self.hub.kind(id).await?;
        match method {
            "objects.list" => self.subscriptions.list_objects().await,
            "objects.query" => {
                let snap = self.subscriptions.query(objects_param(params)?).await?;
                to_value(&snap)
            }
            "objects.subscribe" => {
                let objects = objects_param(params)?;
                let snap = if kind.supports_push() {
                    let snap = self.subscriptions.subscribe(Subscriber::Connection(id), objects).await;
                    if !self.hub.contains(id).await {
                        // Disconnected while subscribing; its removal may have run first.
                        self.subscriptions.remove_subscriber(Subscriber::Connection(id)).await;
                        return Err(RelayError::UnknownClient(id));
                    }
                    snap?
                } else {
                    self.subscriptions.peek(objects).await?
                };
                to_value(&snap)
            }
            "objects.unsubscribe" => self.unsubscribe(id, params).await,
            "connection.identify" => self.identify(id, params).await,
            "connection.list" => {
                self.require_authorized(id).await?;
                to_value(&self.hub.list().await)
            }
            "job_queue.status" => to_value(&self.scheduler.status().await),
            "job_queue.enqueue" => {
                let filenames = string_list(params, "filenames")?;
                let reset = params.get("reset").and_then(Value::as_bool).unwrap_or(false);
                to_value(&self.scheduler.enqueue(filenames, reset).await?)
            }
            "job_queue.remove" => {
                let selection = if params.get("all").and_then(Value::as_bool) == Some(true) {
                    RemoveSelection::All
                } else {
                    let ids = string_list(params, "job_ids")?
                        .iter()
                        .map(|s| parse_job_id(s))
                        .collect::<Result<Vec<_>, _>>()?;
                    RemoveSelection::Ids(ids)
                };
                to_value(&self.scheduler.remove(selection).await)
            }
            "job_queue.pause" => to_value(&self.scheduler.pause().await),
            "job_queue.start" => to_value(&self.scheduler.start().await?),
            "job_queue.jump" => {
                let raw = params
                    .get("job_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RelayError::InvalidParams("missing 'job_id'".into()))?;
                to_value(&self.scheduler.jump(parse_job_id(raw)?).await?)
            }
            other => Err(RelayError::MethodNotFound(other.to_string())),
        }
    }

    async fn identify(&self, id: ConnectionId, params: &Value) -> Result<Value, RelayError> {
        let field = |name: &str| params.get(name).and_then(Value::as_str).map(str::to_string);
        let client_name =
            field("client_name").ok_or_else(|| RelayError::InvalidParams("missing 'client_name'".into()))?;
        let identity = ClientIdentity {
            client_name,
            version: field("version").unwrap_or_default(),
            client_type: field("type").unwrap_or_default(),
            url: field("url"),
        };
        let token = field("access_token");
        let id = self.hub.identify(id, identity, token.as_deref()).await?;
        Ok(json!({"connection_id": id}))
    }

    async fn unsubscribe(&self, id: ConnectionId, params: &Value) -> Result<Value, RelayError> {
        let target = match params.get("connection_id") {
            None | Some(Value::Null) => id,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| RelayError::InvalidParams("'connection_id' must be an integer".into()))?,
        };
        if target != id {
            self.require_authorized(id).await?;
            if !self.hub.contains(target).await {
                return Err(RelayError::UnknownClient(target));
            }
        }
        self.subscriptions
            .remove_subscriber(Subscriber::Connection(target))
            .await;
        Ok(json!({"connection_id": target}))
    }

    async fn require_authorized(&self, id: ConnectionId) -> Result<(), RelayError> {
        if self.hub.is_authorized(id).await? {
            Ok(())
        } else {
            Err(RelayError::Unauthorized)
        }
    }

    // ── Control events ───────────────────────────────────────────────────────

    pub async fn handle_event(&self, event: ControlEvent) {
        match event {
            ControlEvent::Connected { generation } => {
                info!(generation, "control link connected");
            }
            ControlEvent::StateChanged(status) => self.on_state_changed(status).await,
            ControlEvent::Status { status, eventtime } => {
                let routed = self.subscriptions.on_status_push(&status, eventtime).await;
                for (who, slice) in routed {
                    match who {
                        Subscriber::Connection(id) => {
                            let note = Notification::status_update(slice, eventtime);
                            self.deliver(Target::Connection(id), &note).await;
                        }
                        Subscriber::Scheduler => self.scheduler.on_status(&slice).await,
                    }
                }
            }
            ControlEvent::GcodeResponse(text) => {
                let note = Notification::new(NOTIFY_GCODE_RESPONSE, vec![Value::String(text)]);
                self.deliver(Target::All, &note).await;
            }
            ControlEvent::Other { method, params } => {
                let params = match params {
                    Value::Null => Vec::new(),
                    Value::Array(items) => items,
                    other => vec![other],
                };
                self.deliver(Target::All, &Notification::new(method, params)).await;
            }
        }
    }

    async fn on_state_changed(&self, status: ControlStatus) {
        info!(state = %status.state, message = %status.message, "control state changed");
        self.subscriptions.on_control_state(&status).await;
        self.scheduler.on_control_state(&status).await;
        let note = match status.state {
            ControlState::Ready => Notification::new(NOTIFY_CONTROL_READY, vec![]),
            ControlState::Shutdown | ControlState::Errored => Notification::new(
                NOTIFY_CONTROL_SHUTDOWN,
                vec![json!({"state": status.state, "message": status.message})],
            ),
            ControlState::Disconnected => Notification::new(NOTIFY_CONTROL_DISCONNECTED, vec![]),
            ControlState::Starting => return,
        };
        self.deliver(Target::All, &note).await;
    }

    /// Delivers through the hub and releases the interest of evicted clients.
    async fn deliver(&self, target: Target, note: &Notification) {
        for id in self.hub.deliver(target, note).await {
            self.subscriptions
                .remove_subscriber(Subscriber::Connection(id))
                .await;
        }
    }

    /// Consumes control events until the channel closes or `running` clears.
    /// A dirty composite subscription is retried every `resync_interval`.
    pub async fn run_events(
        &self,
        mut events: mpsc::UnboundedReceiver<ControlEvent>,
        running: Arc<AtomicBool>,
        resync_interval: Duration,
    ) {
        let mut evictions = self.hub.take_evictions().await;
        if evictions.is_none() {
            warn!("eviction receiver already taken; evicted interest is released on delivery only");
        }
        let mut resync = tokio::time::interval(resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(id) = next_eviction(&mut evictions) => {
                    let had_interest = self
                        .subscriptions
                        .remove_subscriber(Subscriber::Connection(id))
                        .await;
                    debug!(connection_id = id, had_interest, "evicted connection released");
                },
                _ = resync.tick() => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.subscriptions.resync_if_dirty().await;
                }
            }
        }
        info!("control event loop stopped");
    }
}

async fn next_eviction(
    evictions: &mut Option<mpsc::UnboundedReceiver<ConnectionId>>,
) -> Option<ConnectionId> {
    match evictions {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RelayError> {
    serde_json::to_value(value).map_err(|e| RelayError::Internal(e.to_string()))
}

fn objects_param(params: &Value) -> Result<&Value, RelayError> {
    params
        .get("objects")
        .ok_or_else(|| RelayError::InvalidParams("missing 'objects'".into()))
}

fn string_list(params: &Value, key: &str) -> Result<Vec<String>, RelayError> {
    let invalid = || RelayError::InvalidParams(format!("'{key}' must be a list of strings"));
    params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(invalid)?
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}

fn parse_job_id(raw: &str) -> Result<JobId, RelayError> {
    raw.parse()
        .map_err(|_| RelayError::InvalidParams(format!("invalid job id '{raw}'")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
