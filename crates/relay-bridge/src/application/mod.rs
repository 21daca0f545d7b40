//! Application layer for relay-bridge.
//!
//! The application layer holds the broker's use cases: it knows *what* to do
//! with a request or a control event, but reaches the outside world only
//! through traits the infrastructure layer implements.
//!
//! # Responsibilities
//!
//! - Merging per-client interest into one upstream subscription and splitting
//!   pushes back per client ([`subscriptions`])
//! - Tracking connections of every transport kind and delivering
//!   notifications to them ([`hub`])
//! - Running the job queue state machine ([`scheduler`])
//! - JSON-RPC method dispatch and the control-event loop ([`broker`])
//! - Defining the [`RelayError`] taxonomy and its stable error codes
//!
//! # What does NOT belong here?
//!
//! - Opening sockets or listening for connections (that is infrastructure)
//! - Framing bytes on the upstream channel (that is `relay-core`)
//! - WebSocket or HTTP handling (axum and tokio-tungstenite live in
//!   infrastructure)
//!
//! # For beginners: the trait seams
//!
//! [`ControlChannel`], [`Authorizer`], [`QueueStore`] and [`TopicBroker`]
//! are the only ways this layer talks to the outside.  Unit tests replace
//! them with small recording structs, so every use case runs without a real
//! control process.

pub mod auth;
pub mod broker;
pub mod channel;
pub mod error;
pub mod hub;
pub mod scheduler;
pub mod store;
pub mod subscriptions;

pub use auth::{Authorizer, ClientIdentity, ConfigAuthorizer};
pub use broker::Broker;
pub use channel::{ControlChannel, ControlEvent};
pub use error::RelayError;
pub use hub::{ClientSink, ConnectionId, Target, TopicBroker, TransportHub, TransportKind};
pub use scheduler::{JobScheduler, QueueStatus, RemoveSelection};
pub use store::{MemoryQueueStore, QueueStore, StoreError, StoredQueue};
pub use subscriptions::{Snapshot, Subscriber, SubscriptionService};
