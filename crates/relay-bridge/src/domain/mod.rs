//! Domain layer for relay-bridge.
//!
//! The domain layer contains pure types that have no dependencies on I/O,
//! networking, or an async runtime.
//!
//! # What belongs in the domain layer?
//!
//! - The client-facing JSON-RPC message types
//! - Configuration structures
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, socket or WebSocket types
//! - Anything that could block or fail due to external state (file loading
//!   is the one exception, kept next to the schema it fills)

pub mod config;
pub mod messages;

pub use config::{load_config, BridgeConfig, ConfigError};
pub use messages::{ErrorBody, Notification, RpcRequest, RpcResponse};
