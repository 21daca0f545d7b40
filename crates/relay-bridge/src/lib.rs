//! relay-bridge library crate.
//!
//! A local broker that owns the one connection to a machine-control process
//! and shares it between many JSON-RPC clients.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! WebSocket / HTTP / topic clients (JSON-RPC 2.0)
//!         ↕
//! [relay-bridge]
//!   ├── domain/           Pure types: JSON-RPC envelopes, BridgeConfig
//!   ├── application/      Broker, subscription registry, job scheduler,
//!   │                     transport hub
//!   └── infrastructure/
//!         ├── link/        The upstream connection (relay-core codec)
//!         ├── ws_server/   Duplex transport (tokio-tungstenite)
//!         ├── http_server/ Request-response transport (axum)
//!         ├── topic/       Topic transport
//!         └── store/       Job queue file
//!         ↕
//! control process  (ETX-delimited JSON over a Unix socket)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `relay-core`, and reaches the
//!   upstream only through the [`application::ControlChannel`] trait.
//! - `infrastructure` depends on all other layers plus `tokio`, `axum` and
//!   `tungstenite`.
//!
//! # For beginners: why this structure?
//!
//! The interesting rules (who is subscribed to what, when the next job may
//! start) live in the application layer and are tested against an in-memory
//! fake of the control process.  The infrastructure layer only moves bytes.

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: brokering, subscriptions and job scheduling.
pub mod application;

/// Infrastructure layer: sockets, listeners and persistence.
pub mod infrastructure;
