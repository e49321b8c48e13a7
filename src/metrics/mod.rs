//! Fetch statistics and run reporting
//!
//! - collector: per-batch counters and latency histogram fed by the client
//!   state machine and the batch
//! - reporter: merged run summary, console and JSON output

pub mod collector;
pub mod reporter;

pub use collector::{BatchStats, FetchStatus, StatisticsCollector, UrlCounters};
pub use reporter::LoadReport;
