//! Fixed aggregate request rate
//!
//! A second is split into `T` ticks. Tick `k` schedules `R / T` clients plus
//! one more when `k < R % T`, so every full second schedules exactly `R`.

use crate::timer::MIN_PERIOD_MS;
use crate::utils::PacingError;

#[derive(Debug, Clone)]
pub struct RateScheduler {
    rate: u64,
    ticks_per_sec: u32,
    /// Position inside the current second, wraps every `ticks_per_sec`
    tick_in_second: u32,
}

impl RateScheduler {
    pub fn new(rate: u64, ticks_per_sec: u32) -> Result<Self, PacingError> {
        let bad = PacingError::TickRate {
            ticks: ticks_per_sec,
            min: MIN_PERIOD_MS,
        };
        if ticks_per_sec == 0 || 1000 % ticks_per_sec != 0 {
            return Err(bad);
        }
        if u64::from(1000 / ticks_per_sec) < MIN_PERIOD_MS {
            return Err(bad);
        }
        Ok(Self {
            rate,
            ticks_per_sec,
            tick_in_second: 0,
        })
    }

    /// Timer period of one tick
    pub fn period_ms(&self) -> u64 {
        u64::from(1000 / self.ticks_per_sec)
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Clients to fire on this tick
    pub fn tick(&mut self) -> u64 {
        let ticks = u64::from(self.ticks_per_sec);
        let k = u64::from(self.tick_in_second);
        let n = self.rate / ticks + u64::from(k < self.rate % ticks);
        self.tick_in_second = (self.tick_in_second + 1) % self.ticks_per_sec;
        n
    }
}
