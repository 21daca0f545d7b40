//! TransportHub: one registry and one delivery path for every client
//! connection, whatever transport carries it.
//!
//! # Transport kinds (for beginners)
//!
//! | kind               | requests          | pushes                          | backpressure          |
//! |--------------------|-------------------|---------------------------------|-----------------------|
//! | `Duplex`           | many in flight    | per connection, bounded queue   | disconnect when full  |
//! | `RequestResponse`  | one per exchange  | never                           | n/a                   |
//! | `Topic`            | request topic     | published to a configured topic | none (fire and forget)|
//!
//! The hub branches on [`TransportKind`] exactly once, in [`TransportHub::deliver`].
//! Everything above it (subscriptions, the scheduler, method dispatch) treats
//! connections uniformly by [`ConnectionId`].
//!
//! # Eviction
//!
//! Every connection removed by [`TransportHub::deliver`] is also reported on
//! the eviction channel (see [`TransportHub::take_evictions`]), whichever
//! component delivered, and resolves the receiver from
//! [`TransportHub::closed`] so its session can stop.
//!
//! # Serialise once
//!
//! A notification fanned out to 50 clients is serialised to JSON a single
//! time; each client queue receives an `Arc<String>` pointing at the same
//! text.

use std::collections::HashMap;
use std::sync::Arc;

use relay_core::SequenceCounter;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::application::auth::{Authorizer, ClientIdentity};
use crate::application::error::RelayError;
use crate::domain::messages::Notification;

/// Identifier of one client connection, unique for the process lifetime.
pub type ConnectionId = u64;

/// How a connection exchanges messages with the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Duplex,
    RequestResponse,
    Topic,
}

/// How a response is matched to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// The JSON-RPC `id` member.
    InBand,
    /// The request topic / response topic pair.
    TopicPair,
}

impl TransportKind {
    /// Whether asynchronous notifications can reach this kind at all.
    pub fn supports_push(self) -> bool {
        !matches!(self, TransportKind::RequestResponse)
    }

    pub fn correlation(self) -> Correlation {
        match self {
            TransportKind::Topic => Correlation::TopicPair,
            _ => Correlation::InBand,
        }
    }

    /// Whether a slow consumer of this kind is disconnected.
    pub fn has_backpressure(self) -> bool {
        matches!(self, TransportKind::Duplex)
    }
}

/// Publishes messages to a topic broker.
///
/// The infrastructure layer provides an in-process broker; a network
/// broker client implements the same trait.
pub trait TopicBroker: Send + Sync {
    fn publish(&self, topic: &str, payload: Arc<String>);
}

/// Where a connection's outbound notifications go.
pub enum ClientSink {
    /// Bounded per-connection queue drained by the session writer task.
    Queue(mpsc::Sender<Arc<String>>),
    /// Status updates go to `status_topic`, everything else to
    /// `notification_topic`.
    Topic {
        broker: Arc<dyn TopicBroker>,
        notification_topic: String,
        status_topic: String,
    },
    /// No push path (request-response connections).
    Detached,
}

/// Who a notification is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Connection(ConnectionId),
    All,
}

/// Public view of a live connection (`connection.list`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub transport: TransportKind,
    pub client_name: Option<String>,
    pub version: Option<String>,
    pub client_type: Option<String>,
    pub authorized: bool,
}

struct ClientConnection {
    kind: TransportKind,
    identity: Option<ClientIdentity>,
    authorized: bool,
    sink: ClientSink,
    /// Dropped with the record.
    on_close: Option<oneshot::Sender<()>>,
}

/// Registry and delivery path for all client connections.
pub struct TransportHub {
    connections: RwLock<HashMap<ConnectionId, ClientConnection>>,
    ids: SequenceCounter,
    authorizer: Arc<dyn Authorizer>,
    evictions: mpsc::UnboundedSender<ConnectionId>,
    eviction_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionId>>>,
}

impl TransportHub {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        let (evictions, eviction_rx) = mpsc::unbounded_channel();
        Self {
            connections: RwLock::new(HashMap::new()),
            ids: SequenceCounter::starting_at(1),
            authorizer,
            evictions,
            eviction_rx: Mutex::new(Some(eviction_rx)),
        }
    }

    /// Receiver of evicted connection ids.  Only the first caller gets it.
    pub async fn take_evictions(&self) -> Option<mpsc::UnboundedReceiver<ConnectionId>> {
        self.eviction_rx.lock().await.take()
    }

    /// Resolves once the record of `id` is removed, by [`unregister`] or by
    /// eviction.  `None` if it is already gone.
    ///
    /// [`unregister`]: TransportHub::unregister
    pub async fn closed(&self, id: ConnectionId) -> Option<oneshot::Receiver<()>> {
        let mut conns = self.connections.write().await;
        let conn = conns.get_mut(&id)?;
        let (tx, rx) = oneshot::channel();
        conn.on_close = Some(tx);
        Some(rx)
    }

    /// Creates a connection record and returns its id.
    pub async fn register(&self, kind: TransportKind, sink: ClientSink) -> ConnectionId {
        let id = self.ids.next();
        self.connections.write().await.insert(
            id,
            ClientConnection {
                kind,
                identity: None,
                authorized: false,
                sink,
                on_close: None,
            },
        );
        debug!(connection_id = id, ?kind, correlation = ?kind.correlation(), "connection registered");
        id
    }

    /// Destroys a connection record.  Returns `false` if it was already gone.
    ///
    /// Dropping the record drops the hub's sender, which ends a duplex
    /// session's writer once the session's own handles are gone.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(&id).is_some();
        if removed {
            debug!(connection_id = id, "connection unregistered");
        }
        removed
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Transport kind of `id`.
    ///
    /// # Errors
    ///
    /// [`RelayError::UnknownClient`] if the connection is gone.
    pub async fn kind(&self, id: ConnectionId) -> Result<TransportKind, RelayError> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|c| c.kind)
            .ok_or(RelayError::UnknownClient(id))
    }

    /// Records the identity of `id` and decides its authorization.
    ///
    /// # Errors
    ///
    /// [`RelayError::UnknownClient`] if the connection is gone,
    /// [`RelayError::AlreadyIdentified`] on a second call.
    pub async fn identify(
        &self,
        id: ConnectionId,
        identity: ClientIdentity,
        access_token: Option<&str>,
    ) -> Result<ConnectionId, RelayError> {
        let mut conns = self.connections.write().await;
        let conn = conns.get_mut(&id).ok_or(RelayError::UnknownClient(id))?;
        if conn.identity.is_some() {
            return Err(RelayError::AlreadyIdentified(id));
        }
        conn.authorized = self.authorizer.authorize(&identity, access_token);
        info!(
            connection_id = id,
            client_name = %identity.client_name,
            version = %identity.version,
            client_type = %identity.client_type,
            authorized = conn.authorized,
            "client identified"
        );
        conn.identity = Some(identity);
        Ok(id)
    }

    /// Whether `id` identified itself and was authorized.
    ///
    /// # Errors
    ///
    /// [`RelayError::UnknownClient`] if the connection is gone.
    pub async fn is_authorized(&self, id: ConnectionId) -> Result<bool, RelayError> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|c| c.identity.is_some() && c.authorized)
            .ok_or(RelayError::UnknownClient(id))
    }

    /// Snapshot of every live connection, ordered by id.
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let conns = self.connections.read().await;
        let mut out: Vec<ConnectionInfo> = conns
            .iter()
            .map(|(id, c)| ConnectionInfo {
                connection_id: *id,
                transport: c.kind,
                client_name: c.identity.as_ref().map(|i| i.client_name.clone()),
                version: c.identity.as_ref().map(|i| i.version.clone()),
                client_type: c.identity.as_ref().map(|i| i.client_type.clone()),
                authorized: c.authorized,
            })
            .collect();
        out.sort_by_key(|c| c.connection_id);
        out
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Sends `notification` to `target`.
    ///
    /// Request-response connections are skipped.  A duplex connection whose
    /// queue is full (or closed) is removed from the hub.  The ids of removed
    /// connections are returned and also sent on the eviction channel.
    pub async fn deliver(&self, target: Target, notification: &Notification) -> Vec<ConnectionId> {
        let payload = Arc::new(notification.to_json());
        let mut evicted = Vec::new();
        {
            let conns = self.connections.read().await;
            let recipients: Vec<(&ConnectionId, &ClientConnection)> = match target {
                Target::All => conns.iter().collect(),
                Target::Connection(id) => conns.get_key_value(&id).into_iter().collect(),
            };
            for (id, conn) in recipients {
                match &conn.sink {
                    ClientSink::Detached => {}
                    ClientSink::Queue(tx) => match tx.try_send(Arc::clone(&payload)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) if !conn.kind.has_backpressure() => {
                            debug!(connection_id = id, "queue full; notification dropped");
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(
                                connection_id = id,
                                method = %notification.method,
                                "send queue full; disconnecting slow client"
                            );
                            evicted.push(*id);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!(connection_id = id, "send queue closed");
                            evicted.push(*id);
                        }
                    },
                    ClientSink::Topic {
                        broker,
                        notification_topic,
                        status_topic,
                    } => {
                        let topic = if notification.is_status_update() {
                            status_topic
                        } else {
                            notification_topic
                        };
                        broker.publish(topic, Arc::clone(&payload));
                    }
                }
            }
        }
        if !evicted.is_empty() {
            let mut conns = self.connections.write().await;
            for id in &evicted {
                if conns.remove(id).is_some() {
                    let _ = self.evictions.send(*id);
                }
            }
        }
        evicted
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
