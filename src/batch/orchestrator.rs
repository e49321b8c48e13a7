//! Run orchestrator
//!
//! Splits the configuration into sub-batches, runs each on its own thread,
//! reports progress and merges the per-batch results.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use super::context::RunContext;
use super::control::{BatchControl, ControlHandle};
use super::counters::SharedCounters;
use super::dispatch::{PollLoop, ReactiveLoop};
use super::state::{BatchReport, BatchState};
use crate::config::{DispatchModel, LoadConfig, MsRange};
use crate::metrics::{BatchStats, LoadReport};
use crate::transport::{tcp_probe, SimulatedTransport, TcpProbeTransport, Transport};
use crate::utils::{format_count, LoaderError, Result};

/// Which fetch engine the batches use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Simulated { latency: MsRange, failure_percent: u8 },
    TcpProbe,
}

pub struct Orchestrator {
    config: Arc<LoadConfig>,
    parts: Vec<Arc<LoadConfig>>,
    transport: TransportKind,
    counters: Arc<SharedCounters>,
    controls: Vec<Arc<BatchControl>>,
    progress: bool,
}

impl Orchestrator {
    /// `config` must be validated. Probe targets are resolved here so a bad
    /// host fails the run before any thread starts.
    pub fn new(config: LoadConfig, transport: TransportKind) -> Result<Self> {
        if transport == TransportKind::TcpProbe {
            for url in &config.urls {
                tcp_probe::resolve(&url.url)?;
            }
        }

        let parts: Vec<_> = config.split().into_iter().map(Arc::new).collect();
        let controls = parts
            .iter()
            .map(|p| {
                let room = p.client_num_max - p.effective_rampup_target();
                Arc::new(BatchControl::with_room(room))
            })
            .collect();
        Ok(Self {
            config: Arc::new(config),
            parts,
            transport,
            counters: Arc::new(SharedCounters::new()),
            controls,
            progress: false,
        })
    }

    /// Show a progress bar while the run is going
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle::new(self.controls.clone(), Arc::clone(&self.counters))
    }

    pub fn counters(&self) -> Arc<SharedCounters> {
        Arc::clone(&self.counters)
    }

    pub fn batch_count(&self) -> usize {
        self.parts.len()
    }

    /// Run every sub-batch to completion and merge their results
    pub fn run(&self) -> Result<LoadReport> {
        let start = Instant::now();
        info!(
            clients = self.config.client_num_max,
            batches = self.parts.len(),
            rate = self.config.req_rate,
            dispatch = self.config.dispatch.as_str(),
            "Starting load"
        );

        let mut handles: Vec<JoinHandle<Result<BatchReport>>> = Vec::with_capacity(self.parts.len());
        for (id, part) in self.parts.iter().enumerate() {
            let part = Arc::clone(part);
            let counters = Arc::clone(&self.counters);
            let control = Arc::clone(&self.controls[id]);
            let kind = self.transport;
            let seed = batch_seed(self.config.seed, id);

            let spawned = thread::Builder::new()
                .name(format!("batch-{}", id))
                .spawn(move || run_batch(id, part, kind, seed, counters, control));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Stop what is already running before bailing out
                    self.counters.signal_shutdown();
                    for (bid, h) in handles.into_iter().enumerate() {
                        match h.join() {
                            Ok(Ok(_)) => {}
                            Ok(Err(err)) => warn!(batch = bid, "Batch failed during abort: {}", err),
                            Err(_) => warn!(batch = bid, "Batch panicked during abort"),
                        }
                    }
                    return Err(LoaderError::Io(e));
                }
            }
        }

        let reporter = self.progress.then(|| {
            let counters = Arc::clone(&self.counters);
            let clients = self.config.client_num_max as u64;
            let run_time_ms = self.config.run_time_ms;
            thread::spawn(move || report_progress(&counters, clients, run_time_ms))
        });

        let results: Vec<Result<BatchReport>> = handles
            .into_iter()
            .enumerate()
            .map(|(id, h)| {
                h.join()
                    .unwrap_or_else(|_| Err(LoaderError::Batch(format!("batch {} panicked", id))))
            })
            .collect();
        let duration = start.elapsed();

        // Releases the progress reporter
        self.counters.signal_shutdown();
        if let Some(h) = reporter {
            if h.join().is_err() {
                warn!("Progress reporter panicked");
            }
        }

        let mut reports = Vec::with_capacity(results.len());
        for result in results {
            reports.push(result?);
        }
        self.merge(reports, duration)
    }

    fn merge(&self, reports: Vec<BatchReport>, duration: Duration) -> Result<LoadReport> {
        let mut stats = BatchStats::new(self.config.urls.len())?;
        let (mut clients, mut finished_ok, mut errored, mut never_started) = (0, 0, 0, 0);
        for report in &reports {
            stats.merge(&report.stats);
            clients += report.clients;
            finished_ok += report.finished_ok;
            errored += report.errored;
            never_started += report.never_started;
        }

        Ok(LoadReport {
            name: self.config.name.clone(),
            urls: self.config.urls.iter().map(|u| u.url.clone()).collect(),
            duration,
            batches: reports.len(),
            clients,
            finished_ok,
            errored,
            never_started,
            stats,
            snapshots: self.counters.snapshots(),
        })
    }
}

/// Per-batch seed; zero asks for a random one
fn batch_seed(seed: u64, id: usize) -> u64 {
    if seed == 0 {
        fastrand::u64(..)
    } else {
        seed.wrapping_add(id as u64)
    }
}

fn run_batch(
    id: usize,
    config: Arc<LoadConfig>,
    kind: TransportKind,
    seed: u64,
    counters: Arc<SharedCounters>,
    control: Arc<BatchControl>,
) -> Result<BatchReport> {
    let shutdown = Arc::clone(&counters);
    let result = drive_batch(id, config, kind, seed, counters, control);
    if let Err(ref e) = result {
        error!(batch = id, "Batch failed: {}", e);
        shutdown.signal_shutdown();
    }
    result
}

fn drive_batch(
    id: usize,
    config: Arc<LoadConfig>,
    kind: TransportKind,
    seed: u64,
    counters: Arc<SharedCounters>,
    control: Arc<BatchControl>,
) -> Result<BatchReport> {
    let mut ctx = RunContext::new(seed, counters, control);
    let transport: Box<dyn Transport> = match kind {
        TransportKind::Simulated {
            latency,
            failure_percent,
        } => Box::new(SimulatedTransport::new(
            config.client_num_max,
            latency,
            failure_percent,
            seed,
        )),
        TransportKind::TcpProbe => {
            Box::new(TcpProbeTransport::new(&config.urls, config.client_num_max)?)
        }
    };

    let mut batch = BatchState::init(id, Arc::clone(&config), transport, ctx.now_ms())?;
    match config.dispatch {
        DispatchModel::Reactive => batch.run_until_done(&mut ReactiveLoop::new()?, &mut ctx)?,
        DispatchModel::Poll => batch.run_until_done(&mut PollLoop::new()?, &mut ctx)?,
    }
    batch.shutdown()
}

/// Progress bar over finished clients, or over elapsed seconds when the run
/// has a time budget
fn report_progress(counters: &SharedCounters, clients: u64, run_time_ms: u64) {
    let timed = run_time_ms > 0;
    let (len, template) = if timed {
        (
            run_time_ms.div_ceil(1000),
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}s/{len}s | {msg}",
        )
    } else {
        (
            clients,
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} clients | {msg}",
        )
    };

    let pb = ProgressBar::new(len);
    match ProgressStyle::default_bar().template(template) {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => warn!("Progress style: {}", e),
    }

    let mut last_done = 0u64;
    let mut last_time = Instant::now();
    while !counters.is_shutdown() {
        let p = counters.progress();
        pb.set_position(if timed { p.elapsed_ms / 1000 } else { p.clients_done });

        let now = Instant::now();
        let interval = now.duration_since(last_time).as_secs_f64();
        if interval >= 1.0 {
            let done = p.fetches_done();
            let rate = (done - last_done) as f64 / interval;
            pb.set_message(format!(
                "{}/s, active: {}, fetches: {}",
                format_count(rate as u64),
                format_count(p.clients_active),
                format_count(done)
            ));
            last_done = done;
            last_time = now;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let p = counters.progress();
    pb.finish_with_message(format!("done - {} fetches", format_count(p.fetches_done())));
}
