//! # relay-core
//!
//! Shared library for the control relay containing the upstream wire codec,
//! message classification and the pure domain model.
//!
//! It has zero dependencies on an async runtime, sockets or the filesystem.
//!
//! # Architecture overview (for beginners)
//!
//! The relay sits between one *control process* (a machine controller that
//! speaks JSON over a local socket) and many *clients* (web UIs, scripts,
//! dashboards).  The control process accepts a single connection and a single
//! subscription; the relay multiplexes that one channel for everybody.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel to and from the control process.  JSON
//!   objects are framed by an ETX (0x03) byte; inbound frames are split into
//!   correlated responses and unsolicited pushes.
//!
//! - **`domain`** – Pure logic: the control lifecycle state, per-client
//!   interest and its union (the composite subscription), the status cache,
//!   and the FIFO job queue.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `relay_core::JobQueue` instead of `relay_core::domain::queue::JobQueue`.
pub use domain::control::{ControlState, ControlStatus};
pub use domain::interest::{
    interest_covers, interest_to_wire, parse_query_request, parse_subscription_request,
    AttributeSet, InterestChanges, InterestError, InterestMap, ObjectCache,
};
pub use domain::queue::{JobId, JobQueue, ParseJobIdError, QueueError, QueueState, QueuedJob};
pub use domain::subscription::SubscriptionTable;
pub use protocol::codec::{decode_frame, encode_frame, Frame, FrameDecoder, ProtocolError};
pub use protocol::messages::{
    parse_state_params, PushMessage, UpstreamFault, UpstreamMessage, UpstreamRequest,
};
pub use protocol::sequence::SequenceCounter;
