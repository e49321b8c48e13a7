//! Event loop drivers
//!
//! Both loops block on a mio `Poll` and hand readiness events to the
//! batch; they differ only in how they wait:
//! - Reactive: wake on readiness or the next deadline, with a short
//!   secondary tick that pumps finished fetches and expired timers
//! - Poll: ask the transport to perform its work first, then wait a bounded
//!   slice for readiness

use std::io::{self, ErrorKind};
use std::time::Duration;

use mio::{Events, Poll};

use super::context::RunContext;
use super::state::BatchState;
use crate::transport::Transport;
use crate::utils::LoaderError;

/// Upper bound on a reactive wait
pub const SECONDARY_TICK_MS: u64 = 10;

/// Upper bound on a poll-model wait
pub const POLL_SLICE_MS: u64 = 250;

const EVENTS_CAPACITY: usize = 1024;

/// How a batch waits between pumps.
///
/// The reactive loop has no separate secondary timer: capping each wait at
/// [`SECONDARY_TICK_MS`] means the caller's pump after every wait is that
/// tick. The poll loop runs the transport before waiting instead.
pub trait DispatchLoop {
    /// Hand the loop's registry to the transport
    fn attach<T: Transport>(&mut self, transport: &mut T) -> io::Result<()>;

    /// Block until something may be due and feed readiness to the batch.
    /// The caller pumps completions and timers afterwards.
    fn wait<T: Transport>(
        &mut self,
        batch: &mut BatchState<T>,
        ctx: &mut RunContext,
    ) -> Result<(), LoaderError>;
}

pub struct ReactiveLoop {
    poll: Poll,
    events: Events,
}

impl ReactiveLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
        })
    }
}

impl DispatchLoop for ReactiveLoop {
    fn attach<T: Transport>(&mut self, transport: &mut T) -> io::Result<()> {
        transport.register(self.poll.registry())
    }

    fn wait<T: Transport>(
        &mut self,
        batch: &mut BatchState<T>,
        ctx: &mut RunContext,
    ) -> Result<(), LoaderError> {
        wait_and_feed(&mut self.poll, &mut self.events, batch, ctx, SECONDARY_TICK_MS)?;
        Ok(())
    }
}

pub struct PollLoop {
    poll: Poll,
    events: Events,
}

impl PollLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
        })
    }
}

impl DispatchLoop for PollLoop {
    fn attach<T: Transport>(&mut self, transport: &mut T) -> io::Result<()> {
        transport.register(self.poll.registry())
    }

    fn wait<T: Transport>(
        &mut self,
        batch: &mut BatchState<T>,
        ctx: &mut RunContext,
    ) -> Result<(), LoaderError> {
        let now = ctx.now_ms();
        batch.perform(ctx, now);

        wait_and_feed(&mut self.poll, &mut self.events, batch, ctx, POLL_SLICE_MS)?;
        Ok(())
    }
}

/// Wait until the batch's next deadline, at most `cap_ms`, and hand any
/// readiness over to it
fn wait_and_feed<T: Transport>(
    poll: &mut Poll,
    events: &mut Events,
    batch: &mut BatchState<T>,
    ctx: &RunContext,
    cap_ms: u64,
) -> io::Result<()> {
    let timeout = batch.wait_hint(ctx.now_ms()).min(cap_ms);
    poll_events(poll, events, timeout)?;

    let now = ctx.now_ms();
    for event in events.iter() {
        batch.on_event(event, now);
    }
    Ok(())
}

fn poll_events(poll: &mut Poll, events: &mut Events, timeout_ms: u64) -> io::Result<()> {
    match poll.poll(events, Some(Duration::from_millis(timeout_ms))) {
        Ok(()) => Ok(()),
        // Signal during the wait; nothing to report
        Err(e) if e.kind() == ErrorKind::Interrupted => {
            events.clear();
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadConfig, MsRange, UrlConfig};
    use crate::transport::SimulatedTransport;
    use std::net::TcpListener;
    use std::sync::Arc;

    fn config(clients: usize) -> Arc<LoadConfig> {
        let mut c = LoadConfig {
            client_num_max: clients,
            cycles_num: 3,
            snapshot_interval_ms: 0,
            urls: ["login", "a", "b", "logoff"]
                .iter()
                .map(|p| UrlConfig::new(format!("http://127.0.0.1/{}", p)))
                .collect(),
            ..LoadConfig::default()
        };
        c.urls[0].dont_cycle = true;
        c.urls[3].dont_cycle = true;
        c.validate().unwrap();
        Arc::new(c)
    }

    fn run<L: DispatchLoop>(mut dispatch: L) {
        let cfg = config(5);
        let transport =
            SimulatedTransport::new(cfg.client_num_max, MsRange::new(1, 3).unwrap(), 0, 7);
        let mut ctx = RunContext::standalone(3);
        let mut batch = BatchState::init(0, Arc::clone(&cfg), transport, ctx.now_ms()).unwrap();

        batch.run_until_done(&mut dispatch, &mut ctx).unwrap();
        assert!(batch.is_done());
        assert_eq!(batch.transport().in_flight(), 0);

        let report = batch.shutdown().unwrap();
        assert_eq!(report.finished_ok, 5);
        // login + 3 passes over two URLs + logoff, per client
        assert_eq!(report.stats.total().ok, 5 * 8);
        assert_eq!(report.stats.url(1).unwrap().ok, 15);
        assert_eq!(report.stats.url(3).unwrap().finished, 5);
        assert_eq!(report.stats.cycles_started(), 15);
    }

    #[test]
    fn test_reactive_loop_runs_to_completion() {
        run(ReactiveLoop::new().unwrap());
    }

    #[test]
    fn test_poll_loop_runs_to_completion() {
        run(PollLoop::new().unwrap());
    }

    #[test]
    fn test_shutdown_signal_stops_batch() {
        let mut c = LoadConfig {
            urls: vec![UrlConfig {
                after_sleep: MsRange::fixed(60_000),
                ..UrlConfig::new("http://127.0.0.1/")
            }],
            snapshot_interval_ms: 0,
            ..LoadConfig::default()
        };
        c.validate().unwrap();
        let transport = SimulatedTransport::new(1, MsRange::fixed(1), 0, 1);
        let mut ctx = RunContext::standalone(1);
        let mut batch = BatchState::init(0, Arc::new(c), transport, 0).unwrap();

        // Let the client start and go to sleep, then stop
        let mut dispatch = ReactiveLoop::new().unwrap();
        for _ in 0..20 {
            let now = ctx.now_ms();
            batch.pump(&mut ctx, now);
            if batch.client(0).is_sleeping() {
                break;
            }
            dispatch.wait(&mut batch, &mut ctx).unwrap();
        }
        assert!(batch.client(0).is_sleeping());

        ctx.counters.signal_shutdown();
        batch.run_until_done(&mut dispatch, &mut ctx).unwrap();
        assert!(batch.is_done());
        assert_eq!(batch.stats().clients_finished(), 1);
    }

    #[test]
    fn test_tcp_probe_through_reactive_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let mut c = LoadConfig {
            client_num_max: 2,
            cycles_num: 2,
            snapshot_interval_ms: 0,
            urls: vec![UrlConfig {
                completion_timeout: MsRange::fixed(5_000),
                ..UrlConfig::new(url)
            }],
            ..LoadConfig::default()
        };
        c.validate().unwrap();
        let transport = crate::transport::TcpProbeTransport::new(&c.urls, 2).unwrap();
        let mut ctx = RunContext::standalone(1);
        let mut batch = BatchState::init(0, Arc::new(c), transport, 0).unwrap();

        batch
            .run_until_done(&mut ReactiveLoop::new().unwrap(), &mut ctx)
            .unwrap();
        let report = batch.shutdown().unwrap();
        assert_eq!(report.finished_ok, 2);
        assert_eq!(report.stats.url(0).unwrap().ok, 4);
    }
}
