//! Sub-batch execution
//!
//! The client population is split into sub-batches, one per thread. Each
//! batch owns its clients, timer queue, pacing state and transport and runs
//! its own event loop; the only shared state is [`SharedCounters`] and the
//! per-batch [`BatchControl`] flags.

pub mod context;
pub mod control;
pub mod counters;
pub mod dispatch;
pub mod orchestrator;
pub mod state;

pub use context::RunContext;
pub use control::{BatchControl, Command, ControlHandle};
pub use counters::{ProgressSnapshot, SharedCounters};
pub use dispatch::{DispatchLoop, PollLoop, ReactiveLoop};
pub use orchestrator::{Orchestrator, TransportKind};
pub use state::{BatchReport, BatchState, BatchTimer};
