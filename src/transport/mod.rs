//! Transport seam
//!
//! The scheduling core starts and cancels fetches through [`Transport`] and
//! learns about finished fetches as [`Completion`] values. No application
//! protocol is spoken here; the shipped transports simulate fetches or probe
//! TCP connectivity.

pub mod simulated;
pub mod tcp_probe;

use std::io;

use mio::event::Event;
use mio::Registry;

use crate::utils::TransportError;

pub use simulated::SimulatedTransport;
pub use tcp_probe::TcpProbeTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    Failure,
}

/// A fetch that finished on its own (not cancelled)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub client: usize,
    pub outcome: FetchOutcome,
}

impl Completion {
    pub fn success(client: usize) -> Self {
        Self {
            client,
            outcome: FetchOutcome::Success,
        }
    }

    pub fn failure(client: usize) -> Self {
        Self {
            client,
            outcome: FetchOutcome::Failure,
        }
    }
}

/// Fetch engine driven by one batch thread.
///
/// `client` is the batch-local client index, `url` an index into the URL
/// list the transport was built with, `now` the batch clock in ms.
pub trait Transport {
    fn begin_fetch(&mut self, client: usize, url: usize, now: u64) -> Result<(), TransportError>;

    /// Abandon a fetch; no completion is reported for it. Unknown clients
    /// are ignored.
    fn cancel_fetch(&mut self, client: usize);

    /// Attach to the loop's readiness poller
    fn register(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }

    /// Handle one readiness event
    fn on_event(&mut self, _event: &Event, _now: u64, _out: &mut Vec<Completion>) {}

    /// Do pending non-blocking work and collect finished fetches
    fn perform(&mut self, now: u64, out: &mut Vec<Completion>);

    /// Earliest batch time at which `perform` has something to report
    fn next_wakeup(&self) -> Option<u64> {
        None
    }

    fn in_flight(&self) -> usize;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn begin_fetch(&mut self, client: usize, url: usize, now: u64) -> Result<(), TransportError> {
        (**self).begin_fetch(client, url, now)
    }

    fn cancel_fetch(&mut self, client: usize) {
        (**self).cancel_fetch(client)
    }

    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        (**self).register(registry)
    }

    fn on_event(&mut self, event: &Event, now: u64, out: &mut Vec<Completion>) {
        (**self).on_event(event, now, out)
    }

    fn perform(&mut self, now: u64, out: &mut Vec<Completion>) {
        (**self).perform(now, out)
    }

    fn next_wakeup(&self) -> Option<u64> {
        (**self).next_wakeup()
    }

    fn in_flight(&self) -> usize {
        (**self).in_flight()
    }
}
