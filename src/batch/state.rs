//! Sub-batch state
//!
//! One `BatchState` per thread: the client population, its timer queue,
//! pacing state, transport and statistics. Everything here is driven from a
//! single thread by a [`DispatchLoop`](super::DispatchLoop); nothing is
//! shared except the counters and control flags in the [`RunContext`].

use std::ops::Range;
use std::sync::Arc;

use mio::event::Event;
use tracing::{debug, info, warn};

use super::context::RunContext;
use super::dispatch::DispatchLoop;
use crate::client::{advance, ClientRecord, ClientState, Transition};
use crate::config::LoadConfig;
use crate::metrics::{BatchStats, FetchStatus, StatisticsCollector};
use crate::pacing::{fire_budget, FreeClients, RampUp, RateScheduler};
use crate::timer::{Timer, TimerId, TimerPayload, TimerQueue, DEFAULT_GROWTH_STEP};
use crate::transport::{Completion, FetchOutcome, Transport};
use crate::utils::LoaderError;

/// Payload of every timer a batch schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTimer {
    /// Inter-request sleep; fetch the selected URL when it fires
    Sleep { client: usize },
    /// Fetch took too long
    Completion { client: usize },
    RampUp,
    RateTick,
    ControlPoll,
    /// Leader only
    StatsSnapshot,
}

impl TimerPayload for BatchTimer {
    type Owner = usize;

    fn owner(&self) -> Option<usize> {
        match *self {
            BatchTimer::Sleep { client } | BatchTimer::Completion { client } => Some(client),
            _ => None,
        }
    }
}

/// Final result of one sub-batch
pub struct BatchReport {
    pub batch_id: usize,
    pub clients: usize,
    pub finished_ok: usize,
    pub errored: usize,
    /// Never released by ramp-up
    pub never_started: usize,
    pub stats: BatchStats,
}

pub struct BatchState<T> {
    id: usize,
    leader: bool,
    config: Arc<LoadConfig>,
    clients: Vec<ClientRecord>,
    timers: TimerQueue<BatchTimer>,
    ramp: RampUp,
    rate: Option<RateScheduler>,
    /// Rate mode only
    free: Option<FreeClients>,
    transport: T,
    stats: BatchStats,
    rampup_timer: Option<TimerId>,
    rate_timer: Option<TimerId>,
    control_timer: Option<TimerId>,
    snapshot_timer: Option<TimerId>,
    /// Failures of fetches that could not be started, reported next turn
    deferred: Vec<Completion>,
    /// Completions collected from readiness events
    ready: Vec<Completion>,
    /// Released by ramp-up and not yet terminal
    active: usize,
    stopped: bool,
}

impl<T: Transport> BatchState<T> {
    /// Build the batch and arm its housekeeping timers. The first ramp-up
    /// tick is due at `now`.
    pub fn init(
        id: usize,
        config: Arc<LoadConfig>,
        transport: T,
        now: u64,
    ) -> Result<Self, LoaderError> {
        let count = config.client_num_max;
        let mut clients = Vec::new();
        clients
            .try_reserve_exact(count)
            .map_err(|_| LoaderError::Alloc {
                what: "client records",
            })?;
        clients.extend((0..count).map(|i| ClientRecord::new(i, id)));

        // At most one sleep or completion timer per client, plus housekeeping
        let timers = TimerQueue::new(count + 8, DEFAULT_GROWTH_STEP)?;

        let ramp = RampUp::new(
            count,
            config.effective_rampup_target(),
            config.ramp_start(),
            config.clients_rampup_inc,
        );
        let (rate, free) = if config.is_rate_mode() {
            (
                Some(RateScheduler::new(config.req_rate, config.rate_ticks_per_sec)?),
                Some(FreeClients::filled(count)),
            )
        } else {
            (None, None)
        };

        let mut batch = Self {
            id,
            leader: id == 0,
            stats: BatchStats::new(config.urls.len())?,
            config,
            clients,
            timers,
            ramp,
            rate,
            free,
            transport,
            rampup_timer: None,
            rate_timer: None,
            control_timer: None,
            snapshot_timer: None,
            deferred: Vec::new(),
            ready: Vec::new(),
            active: 0,
            stopped: false,
        };

        let cfg = Arc::clone(&batch.config);
        batch.rampup_timer = Some(batch.timers.schedule(Timer::periodic(
            now,
            cfg.rampup_interval_ms,
            BatchTimer::RampUp,
        ))?);
        if let Some(period) = batch.rate.as_ref().map(RateScheduler::period_ms) {
            batch.rate_timer = Some(batch.timers.schedule(Timer::periodic(
                now + period,
                period,
                BatchTimer::RateTick,
            ))?);
        }
        batch.control_timer = Some(batch.timers.schedule(Timer::periodic(
            now + cfg.control_poll_ms,
            cfg.control_poll_ms,
            BatchTimer::ControlPoll,
        ))?);
        if batch.leader && cfg.snapshot_interval_ms > 0 {
            batch.snapshot_timer = Some(batch.timers.schedule(Timer::periodic(
                now + cfg.snapshot_interval_ms,
                cfg.snapshot_interval_ms,
                BatchTimer::StatsSnapshot,
            ))?);
        }

        debug!(
            batch = id,
            clients = count,
            first_client = cfg.client_offset,
            rate = cfg.req_rate,
            "Batch initialized"
        );
        Ok(batch)
    }

    /// Drive the batch until every client is done, a stop is requested or
    /// the run-time budget elapses
    pub fn run_until_done<L: DispatchLoop>(
        &mut self,
        dispatch: &mut L,
        ctx: &mut RunContext,
    ) -> Result<(), LoaderError> {
        dispatch.attach(&mut self.transport)?;
        loop {
            let now = ctx.now_ms();
            if ctx.counters.is_shutdown() || self.budget_elapsed(now) {
                self.stop(ctx, now);
                break;
            }
            self.pump(ctx, now);
            if self.is_done() {
                break;
            }
            dispatch.wait(self, ctx)?;
        }
        info!(
            batch = self.id,
            finished = self.stats.clients_finished(),
            errors = self.stats.clients_errored(),
            "Batch done"
        );
        Ok(())
    }

    /// Release the timer queue and hand back the statistics
    pub fn shutdown(self) -> Result<BatchReport, LoaderError> {
        let count = |state: ClientState| self.clients.iter().filter(|c| c.state == state).count();
        let finished_ok = count(ClientState::FinishedOk);
        let errored = count(ClientState::Error);
        let never_started = self.clients.len() - self.ramp.scheduled();

        self.timers.shutdown()?;
        Ok(BatchReport {
            batch_id: self.id,
            clients: self.clients.len(),
            finished_ok,
            errored,
            never_started,
            stats: self.stats,
        })
    }

    /// Forward one readiness event to the transport
    pub fn on_event(&mut self, event: &Event, now: u64) {
        self.transport.on_event(event, now, &mut self.ready);
    }

    /// Handle finished fetches, then every expired timer
    pub fn pump(&mut self, ctx: &mut RunContext, now: u64) {
        self.perform(ctx, now);
        self.dispatch_expired(ctx, now);
    }

    /// Collect finished fetches (deferred failures, readiness completions,
    /// transport work) and advance their clients
    pub fn perform(&mut self, ctx: &mut RunContext, now: u64) {
        let mut done = std::mem::take(&mut self.ready);
        done.append(&mut self.deferred);
        self.transport.perform(now, &mut done);
        for completion in done.drain(..) {
            self.handle_completion(completion, ctx, now);
        }
        // Keep the allocation
        if self.ready.is_empty() {
            self.ready = done;
        }
    }

    pub fn dispatch_expired(&mut self, ctx: &mut RunContext, now: u64) {
        while let Some(fired) = self.timers.pop_expired(now) {
            let id = fired.id();
            let payload = *fired.payload();
            let status = self.on_timer(id, payload, ctx, now);
            if let Err(e) = self.timers.finish(fired, status, now) {
                warn!(batch = self.id, "Timer {} could not be completed: {}", id, e);
            }
        }
    }

    /// How long the loop may block before something is due
    pub fn wait_hint(&self, now: u64) -> u64 {
        if !self.deferred.is_empty() || !self.ready.is_empty() {
            return 0;
        }
        let budget = (self.config.run_time_ms > 0)
            .then(|| self.config.run_time_ms.saturating_sub(now));
        [
            self.timers.time_to_next(now),
            self.transport.next_wakeup().map(|t| t.saturating_sub(now)),
            budget,
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(u64::MAX)
    }

    /// No client is running, sleeping, waiting to be fired or waiting for
    /// ramp-up
    pub fn is_done(&self) -> bool {
        self.active == 0 && !self.ramp.is_pending() && self.deferred.is_empty()
    }

    /// Finish every active client now, cancelling its fetch and timers
    pub fn stop(&mut self, ctx: &mut RunContext, now: u64) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for ci in 0..self.ramp.scheduled() {
            let state = self.clients[ci].state;
            if state.is_terminal() {
                // Failed rate-mode clients wait in the pool until popped
                let waiting = state == ClientState::Error
                    && self.free.as_ref().is_some_and(|f| f.contains(ci));
                if waiting {
                    self.retire(ci, ctx);
                }
                continue;
            }
            let client = &mut self.clients[ci];
            client.snapshot();
            client.state = ClientState::FinishedOk;
            if client.prev_state == ClientState::Urls {
                self.stats
                    .on_transition(ClientState::Urls, ClientState::FinishedOk, client.prev_url);
            } else {
                self.stats.on_forced_finish();
            }
            self.retire(ci, ctx);
        }
        self.deferred.clear();
        self.ramp.stop();
        info!(batch = self.id, at_ms = now, "Batch stopped");
    }

    fn budget_elapsed(&self, now: u64) -> bool {
        self.config.run_time_ms > 0 && now >= self.config.run_time_ms
    }

    fn on_timer(&mut self, id: TimerId, payload: BatchTimer, ctx: &mut RunContext, now: u64) -> i32 {
        match payload {
            BatchTimer::Sleep { client } => {
                let record = &mut self.clients[client];
                if record.sleep_timer != Some(id) {
                    warn!(batch = self.id, client, "Stale sleep timer {}", id);
                    return 0;
                }
                record.sleep_timer = None;
                self.begin_fetch(client, ctx, now);
                0
            }
            BatchTimer::Completion { client } => {
                let record = &mut self.clients[client];
                if record.completion_timer != Some(id) {
                    warn!(batch = self.id, client, "Stale completion timer {}", id);
                    return 0;
                }
                record.completion_timer = None;
                self.time_out(client, ctx, now);
                0
            }
            BatchTimer::RampUp => self.on_rampup_tick(ctx, now),
            BatchTimer::RateTick => {
                self.on_rate_tick(ctx, now);
                0
            }
            BatchTimer::ControlPoll => {
                self.apply_control(ctx, now);
                0
            }
            BatchTimer::StatsSnapshot => {
                let s = ctx.counters.take_snapshot();
                info!(
                    elapsed_ms = s.elapsed_ms,
                    started = s.fetches_started,
                    ok = s.fetches_ok,
                    failed = s.fetches_failed,
                    timed_out = s.fetches_timed_out,
                    active = s.clients_active,
                    "Progress"
                );
                0
            }
        }
    }

    fn on_rampup_tick(&mut self, ctx: &mut RunContext, now: u64) -> i32 {
        let eligible: Range<usize> = self.ramp.tick();
        if !eligible.is_empty() {
            debug!(batch = self.id, "Ramp-up releases clients {:?}", eligible);
        }
        for ci in eligible {
            self.active += 1;
            ctx.counters.client_started();
            // Rate mode clients wait in the free pool for a rate tick
            if self.free.is_none() {
                self.next_step(ci, ctx, now);
            }
        }

        if self.ramp.is_disabled() {
            debug!(batch = self.id, clients = self.ramp.scheduled(), "Ramp-up complete");
            self.rampup_timer = None;
            -1
        } else {
            0
        }
    }

    fn on_rate_tick(&mut self, ctx: &mut RunContext, now: u64) {
        if self.stopped {
            return;
        }
        let Some(ref mut rate) = self.rate else {
            return;
        };
        let mut wanted = rate.tick();
        while wanted > 0 {
            let Some(ref mut free) = self.free else {
                return;
            };
            let budget = fire_budget(wanted, free.len(), self.ramp.scheduled(), self.clients.len());
            if budget == 0 {
                break;
            }
            let ci = match free.pop() {
                Ok(ci) => ci,
                Err(e) => {
                    warn!(batch = self.id, "Rate tick: {}", e);
                    break;
                }
            };
            self.next_step(ci, ctx, now);
            if !self.clients[ci].state.is_terminal() {
                wanted -= 1;
            }
        }
    }

    fn apply_control(&mut self, ctx: &mut RunContext, now: u64) {
        let paused = ctx.control.is_paused();
        if paused != self.ramp.is_paused() && !self.stopped {
            if paused {
                self.ramp.pause();
            } else {
                self.ramp.resume();
            }
            info!(batch = self.id, paused, "Ramp-up pacing changed");
        }

        let requested = ctx.control.take_added();
        if requested == 0 || self.stopped {
            return;
        }
        let added = self.ramp.add_clients(requested);
        info!(batch = self.id, requested, added, target = self.ramp.target_max(), "Clients added");
        if added > 0 && self.rampup_timer.is_none() {
            let timer = Timer::periodic(now, self.config.rampup_interval_ms, BatchTimer::RampUp);
            match self.timers.schedule(timer) {
                Ok(id) => self.rampup_timer = Some(id),
                Err(e) => warn!(batch = self.id, "Cannot re-arm ramp-up: {}", e),
            }
        }
    }

    /// Run the state machine for one client and apply the outcome
    fn next_step(&mut self, ci: usize, ctx: &mut RunContext, now: u64) {
        if let Some(id) = self.clients[ci].completion_timer.take() {
            self.cancel_timer(id);
        }
        let forced = self.stopped || self.budget_elapsed(now);

        let client = &mut self.clients[ci];
        client.snapshot();
        let t = if forced {
            Transition {
                state: ClientState::FinishedOk,
                wait_ms: 0,
            }
        } else {
            advance(client, &self.config, &mut ctx.rng, &mut self.stats)
        };
        client.state = t.state;
        if client.prev_state == ClientState::Urls {
            self.stats
                .on_transition(client.prev_state, t.state, client.prev_url);
        }

        match t.state {
            ClientState::Urls if t.wait_ms > 0 && self.rate.is_none() => {
                let timer = Timer::once(now + t.wait_ms, BatchTimer::Sleep { client: ci });
                match self.timers.schedule(timer) {
                    Ok(id) => self.clients[ci].sleep_timer = Some(id),
                    Err(e) => {
                        warn!(batch = self.id, client = ci, "Cannot schedule sleep: {}", e);
                        self.begin_fetch(ci, ctx, now);
                    }
                }
            }
            ClientState::Urls => self.begin_fetch(ci, ctx, now),
            ClientState::Error | ClientState::FinishedOk => self.retire(ci, ctx),
            ClientState::Init => {}
        }
    }

    fn begin_fetch(&mut self, ci: usize, ctx: &mut RunContext, now: u64) {
        let Some(url) = self.clients[ci].url_index else {
            warn!(batch = self.id, client = ci, "Fetch without a selected URL");
            return;
        };
        if let Err(e) = self.transport.begin_fetch(ci, url, now) {
            debug!(batch = self.id, client = ci, url, "Fetch did not start: {}", e);
            self.deferred.push(Completion::failure(ci));
        }
        ctx.counters.record_started();
        self.clients[ci].fetch_started_at = Some(now);

        let timeout = self.config.urls[url].completion_timeout;
        if !timeout.is_zero() {
            let ms = timeout.sample(&mut ctx.rng).max(1);
            let timer = Timer::once(now + ms, BatchTimer::Completion { client: ci });
            match self.timers.schedule(timer) {
                Ok(id) => self.clients[ci].completion_timer = Some(id),
                Err(e) => warn!(batch = self.id, client = ci, "Cannot schedule timeout: {}", e),
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion, ctx: &mut RunContext, now: u64) {
        let ci = completion.client;
        let Some(client) = self.clients.get_mut(ci) else {
            warn!(batch = self.id, "Completion for unknown client {}", ci);
            return;
        };
        let Some(started) = client.fetch_started_at.take() else {
            debug!(batch = self.id, client = ci, "Completion without a fetch in flight");
            return;
        };
        let url = client.url_index;
        if let Some(id) = client.completion_timer.take() {
            self.cancel_timer(id);
        }

        let status = match completion.outcome {
            FetchOutcome::Success => FetchStatus::Ok,
            FetchOutcome::Failure => FetchStatus::Failed,
        };
        if let Some(url) = url {
            self.stats
                .on_fetch_done(url, status, now.saturating_sub(started));
        }
        ctx.counters.record_done(status);

        if completion.outcome == FetchOutcome::Failure {
            self.enter_error(ci);
        }
        self.after_fetch(ci, ctx, now);
    }

    fn time_out(&mut self, ci: usize, ctx: &mut RunContext, now: u64) {
        self.transport.cancel_fetch(ci);
        self.deferred.retain(|c| c.client != ci);

        let client = &mut self.clients[ci];
        if let (Some(url), Some(started)) = (client.url_index, client.fetch_started_at.take()) {
            self.stats
                .on_fetch_done(url, FetchStatus::TimedOut, now.saturating_sub(started));
        }
        ctx.counters.record_done(FetchStatus::TimedOut);
        debug!(batch = self.id, client = ci, "Fetch timed out");

        self.enter_error(ci);
        self.after_fetch(ci, ctx, now);
    }

    /// A fetch failed or timed out: leave the URL state for `Error`
    fn enter_error(&mut self, ci: usize) {
        let client = &mut self.clients[ci];
        client.snapshot();
        client.state = ClientState::Error;
        self.stats
            .on_transition(ClientState::Urls, ClientState::Error, client.prev_url);
    }

    fn after_fetch(&mut self, ci: usize, ctx: &mut RunContext, now: u64) {
        if !self.stopped {
            if let Some(ref mut free) = self.free {
                if let Err(e) = free.push(ci) {
                    warn!(batch = self.id, "Free pool: {}", e);
                }
                return;
            }
        }
        self.next_step(ci, ctx, now);
    }

    /// Release everything a terminal client holds
    fn retire(&mut self, ci: usize, ctx: &mut RunContext) {
        self.transport.cancel_fetch(ci);
        self.timers.cancel_all_for(&ci);
        let client = &mut self.clients[ci];
        client.sleep_timer = None;
        client.completion_timer = None;
        client.fetch_started_at = None;

        self.active = self.active.saturating_sub(1);
        ctx.counters.client_done();
        debug!(batch = self.id, client = ci, state = %client.state, "Client retired");
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if let Err(e) = self.timers.cancel(id) {
            debug!(batch = self.id, "Cancel of timer {}: {}", id, e);
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn client(&self, index: usize) -> &ClientRecord {
        &self.clients[index]
    }

    pub fn clients(&self) -> &[ClientRecord] {
        &self.clients
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    pub fn ramp(&self) -> &RampUp {
        &self.ramp
    }

    pub fn timers(&self) -> &TimerQueue<BatchTimer> {
        &self.timers
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn free_count(&self) -> Option<usize> {
        self.free.as_ref().map(FreeClients::len)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn has_rampup_timer(&self) -> bool {
        self.rampup_timer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MsRange, UrlConfig};
    use crate::utils::TransportError;
    use std::collections::HashSet;

    /// Transport whose fetches finish only when the test says so
    #[derive(Default)]
    struct Scripted {
        started: Vec<(usize, usize, u64)>,
        cancelled: Vec<usize>,
        in_flight: HashSet<usize>,
        ready: Vec<Completion>,
        refuse: bool,
    }

    impl Scripted {
        fn complete(&mut self, client: usize, outcome: FetchOutcome) {
            assert!(self.in_flight.remove(&client), "client {} not in flight", client);
            self.ready.push(Completion { client, outcome });
        }

        fn complete_all(&mut self) {
            let mut clients: Vec<_> = self.in_flight.iter().copied().collect();
            clients.sort_unstable();
            for c in clients {
                self.complete(c, FetchOutcome::Success);
            }
        }
    }

    impl Transport for Scripted {
        fn begin_fetch(&mut self, client: usize, url: usize, now: u64) -> Result<(), TransportError> {
            if self.refuse {
                return Err(TransportError::Resolve("scripted".to_string()));
            }
            assert!(self.in_flight.insert(client), "client {} double fetch", client);
            self.started.push((client, url, now));
            Ok(())
        }

        fn cancel_fetch(&mut self, client: usize) {
            if self.in_flight.remove(&client) {
                self.cancelled.push(client);
            }
        }

        fn perform(&mut self, _now: u64, out: &mut Vec<Completion>) {
            out.append(&mut self.ready);
        }

        fn in_flight(&self) -> usize {
            self.in_flight.len()
        }
    }

    fn config(edit: impl FnOnce(&mut LoadConfig)) -> Arc<LoadConfig> {
        let mut c = LoadConfig {
            urls: vec![UrlConfig::new("http://127.0.0.1/a")],
            snapshot_interval_ms: 0,
            ..LoadConfig::default()
        };
        edit(&mut c);
        c.validate().unwrap();
        Arc::new(c)
    }

    fn batch(cfg: Arc<LoadConfig>) -> BatchState<Scripted> {
        BatchState::init(0, cfg, Scripted::default(), 0).unwrap()
    }

    #[test]
    fn test_single_client_two_cycles() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| c.cycles_num = 2));

        b.pump(&mut ctx, 0);
        assert_eq!(b.transport().started, vec![(0, 0, 0)]);
        assert!(!b.has_rampup_timer());

        b.transport_mut().complete(0, FetchOutcome::Success);
        b.pump(&mut ctx, 5);
        assert_eq!(b.transport().started.len(), 2);
        assert_eq!(b.client(0).state, ClientState::Urls);

        b.transport_mut().complete(0, FetchOutcome::Success);
        b.pump(&mut ctx, 9);
        assert_eq!(b.client(0).state, ClientState::FinishedOk);
        assert!(b.is_done());

        let report = b.shutdown().unwrap();
        assert_eq!(report.finished_ok, 1);
        assert_eq!(report.stats.url(0).unwrap().ok, 2);
        assert_eq!(report.stats.url(0).unwrap().finished, 1);
        assert_eq!(report.stats.latency().max(), 5);
    }

    #[test]
    fn test_completion_timeout_recovers_at_first_cycling_url() {
        let mut ctx = RunContext::standalone(1);
        let cfg = config(|c| {
            c.cycles_num = 2;
            c.urls = ["login", "a", "b"]
                .iter()
                .map(|p| UrlConfig {
                    completion_timeout: MsRange::fixed(100),
                    ..UrlConfig::new(format!("http://127.0.0.1/{}", p))
                })
                .collect();
            c.urls[0].dont_cycle = true;
        });
        let mut b = batch(cfg);

        b.pump(&mut ctx, 0);
        b.transport_mut().complete(0, FetchOutcome::Success);
        b.pump(&mut ctx, 10);
        assert_eq!(b.client(0).url_index, Some(1));
        // Login's completion timer was cancelled, only the new one is pending
        assert!(b.client(0).completion_timer.is_some());

        // No answer for URL 1: its timer fires at 110
        b.pump(&mut ctx, 109);
        assert!(b.transport().cancelled.is_empty());
        b.pump(&mut ctx, 110);

        assert_eq!(b.transport().cancelled, vec![0]);
        assert_eq!(b.client(0).state, ClientState::Urls);
        assert_eq!(b.client(0).url_index, Some(1));
        assert_eq!(b.client(0).cycle_num, 1);
        assert_eq!(b.transport().started.last(), Some(&(0, 1, 110)));
        assert_eq!(b.stats().url(1).unwrap().timed_out, 1);
        assert_eq!(b.stats().url(1).unwrap().errors, 1);

        // Second pass runs to completion
        b.transport_mut().complete(0, FetchOutcome::Success);
        b.pump(&mut ctx, 120);
        b.transport_mut().complete(0, FetchOutcome::Success);
        b.pump(&mut ctx, 130);
        assert_eq!(b.client(0).state, ClientState::FinishedOk);
        assert!(b.is_done());
        // Every completion timer is gone, only housekeeping remains
        assert_eq!(b.timers().len(), 1);
    }

    #[test]
    fn test_rampup_ticks_schedule_in_steps() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.client_num_max = 10;
            c.client_num_start = 2;
            c.clients_rampup_inc = 3;
        }));

        let mut sizes = Vec::new();
        let mut before = 0;
        for second in 0..5 {
            b.pump(&mut ctx, second * 1000);
            let started = b.transport().started.len();
            sizes.push(started - before);
            before = started;
        }
        assert_eq!(sizes, vec![2, 3, 3, 2, 0]);
        assert!(b.ramp().is_disabled());
        assert!(!b.has_rampup_timer());
        assert_eq!(b.active(), 10);
        // Clients are released in index order
        let order: Vec<usize> = b.transport().started.iter().map(|s| s.0).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_after_sleep_delays_next_fetch() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.cycles_num = 2;
            c.urls[0].after_sleep = MsRange::fixed(50);
        }));

        b.pump(&mut ctx, 0);
        b.transport_mut().complete(0, FetchOutcome::Success);
        b.pump(&mut ctx, 10);
        assert!(b.client(0).is_sleeping());
        assert_eq!(b.transport().started.len(), 1);
        assert_eq!(b.wait_hint(10), 50);

        b.pump(&mut ctx, 60);
        assert!(!b.client(0).is_sleeping());
        assert_eq!(b.transport().started.last(), Some(&(0, 0, 60)));
    }

    #[test]
    fn test_rate_mode_fires_exact_rate() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.client_num_max = 20;
            c.req_rate = 47;
            c.rate_ticks_per_sec = 10;
        }));

        b.pump(&mut ctx, 0);
        // Ramp-up releases everyone, but nothing fires before a rate tick
        assert_eq!(b.active(), 20);
        assert!(b.transport().started.is_empty());

        for tick in 1..=10 {
            b.transport_mut().complete_all();
            b.pump(&mut ctx, tick * 100);
        }
        assert_eq!(b.transport().started.len(), 47);

        // The next second fires the same amount again
        for tick in 11..=20 {
            b.transport_mut().complete_all();
            b.pump(&mut ctx, tick * 100);
        }
        assert_eq!(b.transport().started.len(), 94);
    }

    #[test]
    fn test_rate_mode_respects_rampup() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.client_num_max = 10;
            c.clients_rampup_inc = 2;
            c.req_rate = 50;
            c.rate_ticks_per_sec = 10;
        }));

        for tick in 0..10 {
            b.pump(&mut ctx, tick * 100);
        }
        // Only the two released clients can fire and neither completed
        assert_eq!(b.transport().started.len(), 2);

        // Ramp-up and rate tick share the 1000ms deadline; either order
        // fires the new clients by the next tick
        b.pump(&mut ctx, 1000);
        b.pump(&mut ctx, 1100);
        assert_eq!(b.transport().started.len(), 4);
        assert_eq!(b.free_count(), Some(6));
    }

    #[test]
    fn test_rate_mode_returns_completed_clients_to_pool() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.client_num_max = 3;
            c.req_rate = 10;
            c.rate_ticks_per_sec = 10;
        }));

        b.pump(&mut ctx, 0);
        b.pump(&mut ctx, 100);
        assert_eq!(b.free_count(), Some(2));
        b.transport_mut().complete(0, FetchOutcome::Success);
        b.perform(&mut ctx, 150);
        // Back in the pool, not re-advanced
        assert_eq!(b.free_count(), Some(3));
        assert_eq!(b.transport().started.len(), 1);
    }

    #[test]
    fn test_refused_fetch_is_deferred_failure() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| c.error_recovery_enabled = false));
        b.transport_mut().refuse = true;

        b.pump(&mut ctx, 0);
        assert!(b.client(0).is_in_flight());
        assert_eq!(b.wait_hint(0), 0);
        assert!(!b.is_done());

        b.pump(&mut ctx, 1);
        assert_eq!(b.client(0).state, ClientState::Error);
        assert_eq!(b.stats().url(0).unwrap().failed, 1);
        assert!(b.is_done());
    }

    #[test]
    fn test_failure_with_recovery_restarts() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| c.cycles_num = 3));

        b.pump(&mut ctx, 0);
        b.transport_mut().complete(0, FetchOutcome::Failure);
        b.pump(&mut ctx, 4);
        assert_eq!(b.client(0).state, ClientState::Urls);
        assert_eq!(b.client(0).cycle_num, 1);
        assert_eq!(b.transport().started.len(), 2);
        assert_eq!(b.stats().clients_errored(), 1);
    }

    #[test]
    fn test_run_time_budget_forces_finish() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.client_num_max = 2;
            c.run_time_ms = 500;
        }));

        b.pump(&mut ctx, 0);
        // Completion after the budget: finished instead of re-advanced
        b.transport_mut().complete(0, FetchOutcome::Success);
        b.pump(&mut ctx, 600);
        assert_eq!(b.client(0).state, ClientState::FinishedOk);
        assert_eq!(b.transport().started.len(), 2);

        // Client 1 is still in flight; stopping cancels it
        b.stop(&mut ctx, 600);
        assert_eq!(b.client(1).state, ClientState::FinishedOk);
        assert_eq!(b.transport().cancelled, vec![1]);
        assert!(b.is_done());
        assert_eq!(b.stats().clients_finished(), 2);
        assert_eq!(ctx.counters.progress().clients_active, 0);
    }

    #[test]
    fn test_stop_retires_failed_client_waiting_in_pool() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.client_num_max = 2;
            c.req_rate = 10;
            c.rate_ticks_per_sec = 10;
        }));

        b.pump(&mut ctx, 0);
        b.pump(&mut ctx, 100);
        b.transport_mut().complete(0, FetchOutcome::Failure);
        b.perform(&mut ctx, 150);
        assert_eq!(b.client(0).state, ClientState::Error);
        assert_eq!(b.active(), 2);

        b.stop(&mut ctx, 160);
        assert_eq!(b.active(), 0);
        assert!(b.is_done());
        assert_eq!(b.client(0).state, ClientState::Error);
        assert_eq!(b.client(1).state, ClientState::FinishedOk);
        assert_eq!(ctx.counters.progress().clients_active, 0);
    }

    #[test]
    fn test_stop_during_rampup_is_done() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.client_num_max = 4;
            c.clients_rampup_inc = 1;
        }));

        b.pump(&mut ctx, 0);
        assert!(b.ramp().is_pending());
        b.stop(&mut ctx, 10);
        assert!(b.is_done());

        // Later ramp-up ticks release nobody and drop the timer
        b.pump(&mut ctx, 1000);
        assert_eq!(b.transport().started.len(), 1);
        assert!(!b.has_rampup_timer());
        let report = b.shutdown().unwrap();
        assert_eq!(report.finished_ok, 1);
        assert_eq!(report.never_started, 3);
    }

    #[test]
    fn test_rate_mode_timeout_returns_client_to_pool() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.req_rate = 10;
            c.rate_ticks_per_sec = 10;
            c.urls[0].completion_timeout = MsRange::fixed(150);
        }));

        b.pump(&mut ctx, 0);
        b.pump(&mut ctx, 100);
        assert_eq!(b.transport().started, vec![(0, 0, 100)]);
        b.pump(&mut ctx, 200);
        assert_eq!(b.free_count(), Some(0));

        // No answer: the completion timer fires at 250
        b.pump(&mut ctx, 250);
        assert_eq!(b.transport().cancelled, vec![0]);
        assert_eq!(b.free_count(), Some(1));
        assert_eq!(b.client(0).state, ClientState::Error);
        assert_eq!(b.stats().url(0).unwrap().timed_out, 1);
        assert_eq!(b.active(), 1);

        // Recovered by the next rate tick
        b.pump(&mut ctx, 300);
        assert_eq!(b.free_count(), Some(0));
        assert_eq!(b.client(0).state, ClientState::Urls);
        assert_eq!(b.transport().started.last(), Some(&(0, 0, 300)));
    }

    #[test]
    fn test_control_pause_and_add() {
        let mut ctx = RunContext::standalone(1);
        let mut b = batch(config(|c| {
            c.client_num_max = 6;
            c.clients_rampup_inc = 1;
            c.rampup_target = Some(3);
        }));

        b.pump(&mut ctx, 0);
        ctx.control.pause_rampup();
        b.pump(&mut ctx, 100);
        assert!(b.ramp().is_paused());
        b.pump(&mut ctx, 1000);
        b.pump(&mut ctx, 2000);
        assert_eq!(b.transport().started.len(), 1);

        ctx.control.resume_rampup();
        b.pump(&mut ctx, 2100);
        b.pump(&mut ctx, 3000);
        b.pump(&mut ctx, 4000);
        assert_eq!(b.ramp().scheduled(), 3);
        assert!(!b.has_rampup_timer());

        // Raising the target re-arms the ramp-up timer
        ctx.control.add_clients(5);
        b.pump(&mut ctx, 4100);
        assert_eq!(b.ramp().target_max(), 6);
        assert!(b.has_rampup_timer());
        assert_eq!(b.transport().started.len(), 4);
    }

    #[test]
    fn test_leader_takes_snapshots() {
        let mut ctx = RunContext::standalone(1);
        let cfg = config(|c| c.snapshot_interval_ms = 100);
        let mut leader = BatchState::init(0, Arc::clone(&cfg), Scripted::default(), 0).unwrap();
        let mut other = BatchState::init(1, cfg, Scripted::default(), 0).unwrap();
        assert!(leader.is_leader() && !other.is_leader());

        leader.pump(&mut ctx, 100);
        leader.pump(&mut ctx, 200);
        assert_eq!(ctx.counters.snapshots().len(), 2);
        other.pump(&mut ctx, 100);
        other.pump(&mut ctx, 200);
        assert_eq!(ctx.counters.snapshots().len(), 2);
    }
}
