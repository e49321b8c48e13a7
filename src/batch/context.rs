//! Per-thread run context: randomness, clock and the cross-thread handles

use std::sync::Arc;
use std::time::Instant;

use super::control::BatchControl;
use super::counters::SharedCounters;

pub struct RunContext {
    pub rng: fastrand::Rng,
    pub counters: Arc<SharedCounters>,
    pub control: Arc<BatchControl>,
    start: Instant,
}

impl RunContext {
    /// Clock epoch is the counters' start time, shared by every batch
    pub fn new(seed: u64, counters: Arc<SharedCounters>, control: Arc<BatchControl>) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
            start: counters.start_time(),
            counters,
            control,
        }
    }

    /// Context with private counters and control, for a lone batch
    pub fn standalone(seed: u64) -> Self {
        Self::new(
            seed,
            Arc::new(SharedCounters::new()),
            Arc::new(BatchControl::new()),
        )
    }

    /// Milliseconds since the run started
    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
