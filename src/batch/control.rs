//! Interactive pacing control
//!
//! Commands are posted to per-batch atomic flags; each batch applies them
//! on its next control poll timer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::counters::SharedCounters;

/// Pending commands for one sub-batch
#[derive(Debug, Default)]
pub struct BatchControl {
    paused: AtomicBool,
    pending_add: AtomicUsize,
    /// Clients the batch can still take above its ramp-up target
    room: AtomicUsize,
}

impl BatchControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_room(room: usize) -> Self {
        Self {
            room: AtomicUsize::new(room),
            ..Self::default()
        }
    }

    /// Claim up to `n` clients of the remaining room
    fn reserve(&self, n: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .room
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |room| {
                granted = room.min(n);
                Some(room - granted)
            });
        granted
    }

    pub fn room(&self) -> usize {
        self.room.load(Ordering::Relaxed)
    }

    pub fn pause_rampup(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume_rampup(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn add_clients(&self, n: usize) {
        self.pending_add.fetch_add(n, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Clients requested since the last call
    pub fn take_added(&self) -> usize {
        self.pending_add.swap(0, Ordering::Relaxed)
    }
}

/// A parsed interactive command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Add(usize),
    Stop,
}

impl Command {
    /// `p`/`pause`, `r`/`resume`, `+N`/`add N`, `q`/`quit`/`stop`
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if let Some(n) = line.strip_prefix('+') {
            return n.trim().parse().ok().map(Command::Add);
        }
        let mut words = line.split_whitespace();
        let cmd = match words.next()?.to_ascii_lowercase().as_str() {
            "p" | "pause" => Command::Pause,
            "r" | "resume" => Command::Resume,
            "a" | "add" => Command::Add(words.next()?.parse().ok()?),
            "q" | "quit" | "stop" => Command::Stop,
            _ => return None,
        };
        if words.next().is_some() {
            return None;
        }
        Some(cmd)
    }
}

/// Controls every sub-batch of a run
#[derive(Clone)]
pub struct ControlHandle {
    batches: Vec<Arc<BatchControl>>,
    counters: Arc<SharedCounters>,
}

impl ControlHandle {
    pub fn new(batches: Vec<Arc<BatchControl>>, counters: Arc<SharedCounters>) -> Self {
        Self { batches, counters }
    }

    pub fn pause_rampup(&self) {
        self.batches.iter().for_each(|b| b.pause_rampup());
    }

    pub fn resume_rampup(&self) {
        self.batches.iter().for_each(|b| b.resume_rampup());
    }

    /// Spread `n` clients over the batches that have room for them, evenly
    /// first and then filling the lowest-numbered ones. Returns how many
    /// were placed.
    pub fn add_clients(&self, n: usize) -> usize {
        let count = self.batches.len();
        if count == 0 {
            return 0;
        }
        let mut granted = vec![0; count];
        for (i, batch) in self.batches.iter().enumerate() {
            let share = n / count + usize::from(i < n % count);
            granted[i] = batch.reserve(share);
        }
        let mut left = n - granted.iter().sum::<usize>();
        for (i, batch) in self.batches.iter().enumerate() {
            if left == 0 {
                break;
            }
            let extra = batch.reserve(left);
            granted[i] += extra;
            left -= extra;
        }

        for (batch, &share) in self.batches.iter().zip(&granted) {
            if share > 0 {
                batch.add_clients(share);
            }
        }
        n - left
    }

    pub fn stop(&self) {
        self.counters.signal_shutdown();
    }

    pub fn apply(&self, command: Command) {
        info!("Control command: {:?}", command);
        match command {
            Command::Pause => self.pause_rampup(),
            Command::Resume => self.resume_rampup(),
            Command::Add(n) => {
                let added = self.add_clients(n);
                if added < n {
                    warn!(requested = n, added, "Not enough room for every client");
                }
            }
            Command::Stop => self.stop(),
        }
    }
}
