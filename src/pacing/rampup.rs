//! Population ramp-up
//!
//! Every tick hands a contiguous range of client indices over to the
//! scheduler. The first tick uses the start count when one is configured
//! (zero included); later ticks add the increment until the target is reached, at which
//! point ramp-up disables itself.

use std::ops::Range;

#[derive(Debug, Clone)]
pub struct RampUp {
    scheduled: usize,
    target_max: usize,
    /// Hard bound on `target_max` (clients allocated in the batch)
    capacity: usize,
    increment: usize,
    start: Option<usize>,
    started: bool,
    paused: bool,
    disabled: bool,
}

impl RampUp {
    /// Without a `start` the first tick uses the increment; `increment == 0`
    /// hands over every remaining client at once
    pub fn new(
        capacity: usize,
        target_max: usize,
        start: Option<usize>,
        increment: usize,
    ) -> Self {
        let target_max = target_max.min(capacity);
        Self {
            scheduled: 0,
            target_max,
            capacity,
            increment,
            start,
            started: false,
            paused: false,
            disabled: target_max == 0,
        }
    }

    /// Clients that became eligible on this tick, in index order
    pub fn tick(&mut self) -> Range<usize> {
        let from = self.scheduled;
        if self.disabled || self.paused {
            return from..from;
        }
        if self.scheduled >= self.target_max {
            self.disabled = true;
            return from..from;
        }

        let remaining = self.target_max - self.scheduled;
        let wanted = match self.start {
            Some(start) if !self.started => start,
            _ if self.increment == 0 => remaining,
            _ => self.increment,
        };
        self.started = true;

        self.scheduled += wanted.min(remaining);
        if self.scheduled >= self.target_max {
            self.disabled = true;
        }
        from..self.scheduled
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// No more clients for good, unlike `pause`
    pub fn stop(&mut self) {
        self.disabled = true;
    }

    /// Raise the target by up to `n` clients. Returns how many were added;
    /// a non-zero result re-enables ramp-up.
    pub fn add_clients(&mut self, n: usize) -> usize {
        let new_target = self.target_max.saturating_add(n).min(self.capacity);
        let added = new_target - self.target_max;
        if added > 0 {
            self.target_max = new_target;
            self.disabled = false;
        }
        added
    }

    pub fn scheduled(&self) -> usize {
        self.scheduled
    }

    pub fn target_max(&self) -> usize {
        self.target_max
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// More clients will become eligible later
    pub fn is_pending(&self) -> bool {
        !self.disabled && self.scheduled < self.target_max
    }
}
