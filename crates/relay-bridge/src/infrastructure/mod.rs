//! Infrastructure layer for relay-bridge.
//!
//! The infrastructure layer handles all I/O: the control-process socket, the
//! client listeners, the topic broker and the queue file.
//!
//! # Responsibilities
//!
//! - Owning the single upstream connection ([`link`]) and reconnecting it
//! - Accepting WebSocket sessions ([`ws_server`]) and HTTP calls
//!   ([`http_server`])
//! - Bridging the in-process topic broker ([`topic`])
//! - Persisting the job queue to disk ([`store`])
//! - Starting everything and handling shutdown ([`runtime`])
//!
//! # What does NOT belong here?
//!
//! - Interest bookkeeping and queue rules (that is the application layer)
//! - Message and configuration types (that is the domain layer)
//! - Command-line parsing (that is done in `main.rs`)

pub mod http_server;
pub mod link;
pub mod runtime;
pub mod store;
pub mod topic;
pub mod ws_server;

pub use link::{Link, LinkError};
pub use runtime::run_relay;
pub use store::TomlQueueStore;
pub use topic::{LocalTopicBroker, TopicMessage, TopicNames};
