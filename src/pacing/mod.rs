//! Pacing: population ramp-up and fixed-rate firing
//!
//! - RampUp: how many clients are allowed to run
//! - RateScheduler: how many free clients to fire per sub-second tick
//! - FreeClients: idle clients waiting for a rate tick

pub mod free_pool;
pub mod rampup;
pub mod rate;

pub use free_pool::FreeClients;
pub use rampup::RampUp;
pub use rate::RateScheduler;

/// Clients a rate tick may fire.
///
/// `population` is the size of the batch; every client that is neither
/// running nor finished sits in the free pool, so
/// `scheduled - (population - free)` is the number of free clients ramp-up
/// has already released.
pub fn fire_budget(per_tick: u64, free: usize, scheduled: usize, population: usize) -> usize {
    let eligible = scheduled.saturating_sub(population.saturating_sub(free));
    usize::try_from(per_tick)
        .unwrap_or(usize::MAX)
        .min(free)
        .min(eligible)
}
