//! Timer scheduling
//!
//! - FixedObjectPool: page-blocked object allocator backing heap slots
//! - IdAllocator: timer id recycling (smallest released id first)
//! - TimerQueue: cancellable min-heap of deadlines with periodic re-arm

pub mod ids;
pub mod pool;
pub mod queue;

pub use pool::{FixedObjectPool, PoolHandle, PAGE_SIZE};
pub use queue::{
    Fired, Timer, TimerCallback, TimerId, TimerPayload, TimerQueue, DEFAULT_GROWTH_STEP,
    MIN_PERIOD_MS,
};
