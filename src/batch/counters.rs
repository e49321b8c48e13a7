//! Atomic counters shared between sub-batch threads
//!
//! These and the per-batch control flags are the only cross-thread state.
//! Counters use relaxed ordering; they feed progress output, not decisions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::metrics::FetchStatus;

/// Live totals at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub elapsed_ms: u64,
    pub fetches_started: u64,
    pub fetches_ok: u64,
    pub fetches_failed: u64,
    pub fetches_timed_out: u64,
    pub clients_active: u64,
    pub clients_done: u64,
}

impl ProgressSnapshot {
    pub fn fetches_done(&self) -> u64 {
        self.fetches_ok + self.fetches_failed + self.fetches_timed_out
    }
}

pub struct SharedCounters {
    pub fetches_started: AtomicU64,
    pub fetches_ok: AtomicU64,
    pub fetches_failed: AtomicU64,
    pub fetches_timed_out: AtomicU64,
    /// Clients released by ramp-up and not yet terminal
    pub clients_active: AtomicU64,
    pub clients_done: AtomicU64,
    /// Stop signal for every batch and the progress reporter
    pub shutdown: AtomicBool,
    start_time: Instant,
    /// Written by the leader batch only
    snapshots: Mutex<Vec<ProgressSnapshot>>,
}

impl SharedCounters {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start_time: Instant) -> Self {
        Self {
            fetches_started: AtomicU64::new(0),
            fetches_ok: AtomicU64::new(0),
            fetches_failed: AtomicU64::new(0),
            fetches_timed_out: AtomicU64::new(0),
            clients_active: AtomicU64::new(0),
            clients_done: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            start_time,
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    #[inline]
    pub fn record_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_done(&self, status: FetchStatus) {
        let counter = match status {
            FetchStatus::Ok => &self.fetches_ok,
            FetchStatus::Failed => &self.fetches_failed,
            FetchStatus::TimedOut => &self.fetches_timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn client_started(&self) {
        self.clients_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn client_done(&self) {
        self.clients_active.fetch_sub(1, Ordering::Relaxed);
        self.clients_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            fetches_ok: self.fetches_ok.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            fetches_timed_out: self.fetches_timed_out.load(Ordering::Relaxed),
            clients_active: self.clients_active.load(Ordering::Relaxed),
            clients_done: self.clients_done.load(Ordering::Relaxed),
        }
    }

    /// Append the current totals to the snapshot log
    pub fn take_snapshot(&self) -> ProgressSnapshot {
        let snapshot = self.progress();
        self.snapshots.lock().push(snapshot);
        snapshot
    }

    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.snapshots.lock().clone()
    }
}

impl Default for SharedCounters {
    fn default() -> Self {
        Self::new()
    }
}
