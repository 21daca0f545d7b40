//! Domain entities for the control relay.
//!
//! This module contains pure business logic with no infrastructure
//! dependencies: no sockets, no async runtime, no clocks.  Time values are
//! passed in by the caller.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! Clean Architecture organises code into concentric layers.  The innermost
//! layer is the **domain**.  Domain code holds the core rules of the system,
//! imports nothing from OS or network libraries and can be tested on any
//! platform without setup.  Outer layers (application, infrastructure) depend
//! on the domain, never the other way round.

/// Control-process lifecycle state.
pub mod control;

/// Attribute sets, interest maps and the status cache.
pub mod interest;

/// FIFO job queue and scheduler state.
pub mod queue;

/// Per-client interest table and the composite subscription.
pub mod subscription;
