//! Statistics collection for one sub-batch
//!
//! The batch calls into a [`StatisticsCollector`] on every transition out of
//! the URL state, every finished fetch and every cycle start. [`BatchStats`]
//! is the collector used in production; per-batch instances are merged after
//! the threads are joined.

use hdrhistogram::Histogram;
use serde::Serialize;
use tracing::warn;

use crate::client::ClientState;
use crate::utils::LoaderError;

/// Upper bound of the latency histogram (one hour, in ms)
const MAX_LATENCY_MS: u64 = 3_600_000;

/// Outcome of one fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Ok,
    Failed,
    TimedOut,
}

/// Sink for scheduling events
pub trait StatisticsCollector {
    /// A client left the URL state (`prev` is always `Urls`)
    fn on_transition(&mut self, prev: ClientState, next: ClientState, prev_url: Option<usize>);

    /// A fetch of `url` finished after `latency_ms`
    fn on_fetch_done(&mut self, url: usize, status: FetchStatus, latency_ms: u64);

    /// A client began a new pass through the cycling URLs
    fn on_cycle_start(&mut self, client: usize);
}

/// Per-URL tallies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UrlCounters {
    pub ok: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Transitions from this URL into `Error`
    pub errors: u64,
    /// Transitions from this URL into `FinishedOk`
    pub finished: u64,
}

impl UrlCounters {
    pub fn attempts(&self) -> u64 {
        self.ok + self.failed + self.timed_out
    }

    fn merge(&mut self, other: &UrlCounters) {
        self.ok += other.ok;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.errors += other.errors;
        self.finished += other.finished;
    }
}

/// Statistics of one sub-batch
pub struct BatchStats {
    urls: Vec<UrlCounters>,
    latency: Histogram<u64>,
    cycles_started: u64,
    clients_finished: u64,
    clients_errored: u64,
}

impl BatchStats {
    pub fn new(url_count: usize) -> Result<Self, LoaderError> {
        Ok(Self {
            urls: vec![UrlCounters::default(); url_count],
            latency: Histogram::new_with_bounds(1, MAX_LATENCY_MS, 3)?,
            cycles_started: 0,
            clients_finished: 0,
            clients_errored: 0,
        })
    }

    pub fn url(&self, index: usize) -> Option<&UrlCounters> {
        self.urls.get(index)
    }

    pub fn urls(&self) -> &[UrlCounters] {
        &self.urls
    }

    pub fn latency(&self) -> &Histogram<u64> {
        &self.latency
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles_started
    }

    /// Clients that reached `FinishedOk`
    pub fn clients_finished(&self) -> u64 {
        self.clients_finished
    }

    /// Transitions into `Error`; a recovering client may count several times
    pub fn clients_errored(&self) -> u64 {
        self.clients_errored
    }

    pub fn total(&self) -> UrlCounters {
        let mut total = UrlCounters::default();
        for u in &self.urls {
            total.merge(u);
        }
        total
    }

    /// Fold another batch's statistics into this one
    pub fn merge(&mut self, other: &BatchStats) {
        if self.urls.len() < other.urls.len() {
            self.urls.resize(other.urls.len(), UrlCounters::default());
        }
        for (mine, theirs) in self.urls.iter_mut().zip(&other.urls) {
            mine.merge(theirs);
        }
        if let Err(e) = self.latency.add(&other.latency) {
            warn!("Dropping latency samples during merge: {}", e);
        }
        self.cycles_started += other.cycles_started;
        self.clients_finished += other.clients_finished;
        self.clients_errored += other.clients_errored;
    }

    /// Note a client that finished without ever leaving the URL state
    /// through the FSM (run-time budget cut-off on a sleeping client)
    pub fn on_forced_finish(&mut self) {
        self.clients_finished += 1;
    }
}

impl StatisticsCollector for BatchStats {
    fn on_transition(&mut self, _prev: ClientState, next: ClientState, prev_url: Option<usize>) {
        let counters = prev_url.and_then(|i| self.urls.get_mut(i));
        match next {
            ClientState::Error => {
                self.clients_errored += 1;
                if let Some(c) = counters {
                    c.errors += 1;
                }
            }
            ClientState::FinishedOk => {
                self.clients_finished += 1;
                if let Some(c) = counters {
                    c.finished += 1;
                }
            }
            ClientState::Init | ClientState::Urls => {}
        }
    }

    fn on_fetch_done(&mut self, url: usize, status: FetchStatus, latency_ms: u64) {
        let Some(c) = self.urls.get_mut(url) else {
            warn!("Fetch result for unknown URL index {}", url);
            return;
        };
        match status {
            FetchStatus::Ok => {
                c.ok += 1;
                self.latency.saturating_record(latency_ms);
            }
            FetchStatus::Failed => c.failed += 1,
            FetchStatus::TimedOut => c.timed_out += 1,
        }
    }

    fn on_cycle_start(&mut self, _client: usize) {
        self.cycles_started += 1;
    }
}
