//! Virtual clients: per-client record and lifecycle state machine

pub mod fsm;
pub mod record;

pub use fsm::{advance, Transition};
pub use record::{ClientRecord, ClientState};
