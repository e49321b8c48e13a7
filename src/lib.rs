//! vload library
//!
//! Scheduling core of a virtual-client load generator: a cancellable timer
//! queue, the per-client URL state machine, ramp-up and fixed-rate pacing,
//! and multi-threaded sub-batch execution over a pluggable transport.

pub mod batch;
pub mod client;
pub mod config;
pub mod metrics;
pub mod pacing;
pub mod timer;
pub mod transport;
pub mod utils;
