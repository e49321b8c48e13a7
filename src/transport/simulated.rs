//! Simulated transport: fetches finish after a drawn latency, failing with
//! a configured probability. Seeded, so runs are reproducible.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::{Completion, FetchOutcome, Transport};
use crate::config::MsRange;
use crate::utils::TransportError;

#[derive(Debug, Clone, Copy)]
struct Pending {
    due: u64,
    generation: u64,
    outcome: FetchOutcome,
}

pub struct SimulatedTransport {
    latency: MsRange,
    failure_percent: u8,
    rng: fastrand::Rng,
    pending: Vec<Option<Pending>>,
    /// (due, client, generation); entries whose generation no longer
    /// matches were cancelled
    due: BinaryHeap<Reverse<(u64, usize, u64)>>,
    generation: u64,
    in_flight: usize,
}

impl SimulatedTransport {
    pub fn new(clients: usize, latency: MsRange, failure_percent: u8, seed: u64) -> Self {
        Self {
            latency,
            failure_percent: failure_percent.min(100),
            rng: fastrand::Rng::with_seed(seed),
            pending: vec![None; clients],
            due: BinaryHeap::new(),
            generation: 0,
            in_flight: 0,
        }
    }
}

impl Transport for SimulatedTransport {
    fn begin_fetch(&mut self, client: usize, _url: usize, now: u64) -> Result<(), TransportError> {
        let slot = self
            .pending
            .get_mut(client)
            .ok_or(TransportError::Busy(client))?;
        if slot.is_some() {
            return Err(TransportError::Busy(client));
        }

        let due = now + self.latency.sample(&mut self.rng);
        let outcome = if self.failure_percent > 0 && self.rng.u8(1..=100) <= self.failure_percent {
            FetchOutcome::Failure
        } else {
            FetchOutcome::Success
        };
        self.generation += 1;
        *slot = Some(Pending {
            due,
            generation: self.generation,
            outcome,
        });
        self.due.push(Reverse((due, client, self.generation)));
        self.in_flight += 1;
        Ok(())
    }

    fn cancel_fetch(&mut self, client: usize) {
        if let Some(slot) = self.pending.get_mut(client) {
            if slot.take().is_some() {
                self.in_flight -= 1;
            }
        }
    }

    fn perform(&mut self, now: u64, out: &mut Vec<Completion>) {
        while let Some(&Reverse((due, client, generation))) = self.due.peek() {
            if due > now {
                break;
            }
            self.due.pop();
            let slot = &mut self.pending[client];
            match *slot {
                Some(p) if p.generation == generation => {
                    *slot = None;
                    self.in_flight -= 1;
                    out.push(Completion {
                        client,
                        outcome: p.outcome,
                    });
                }
                _ => {}
            }
        }
    }

    fn next_wakeup(&self) -> Option<u64> {
        self.due.peek().map(|Reverse((due, _, _))| *due)
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}
