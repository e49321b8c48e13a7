//! Client lifecycle state machine
//!
//! `advance` decides what a client does next: which URL to fetch and how
//! long to wait before fetching it, or that it is done. Timer and transport
//! side effects are applied by the batch.
//!
//! URLs form three groups: leading non-cycling URLs (login), a contiguous
//! cycling range repeated `cycles_num` times, and trailing non-cycling URLs
//! (logoff).

use fastrand::Rng;

use super::record::{ClientRecord, ClientState};
use crate::config::{CyclingRange, LoadConfig, UrlConfig};
use crate::metrics::StatisticsCollector;

/// Result of one `advance`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: ClientState,
    /// Delay before fetching the selected URL
    pub wait_ms: u64,
}

impl Transition {
    fn to(state: ClientState) -> Self {
        Self { state, wait_ms: 0 }
    }
}

/// Compute the client's next state and select its next URL.
///
/// Does not modify `client.state`; the caller applies the transition.
pub fn advance<S>(
    client: &mut ClientRecord,
    config: &LoadConfig,
    rng: &mut Rng,
    stats: &mut S,
) -> Transition
where
    S: StatisticsCollector + ?Sized,
{
    match client.state {
        ClientState::Init => {
            let first = next_url(client, config, stats);
            select(client, config, rng, stats, first, 0)
        }
        ClientState::Urls => {
            let wait_ms = client
                .url_index
                .map(|i| config.urls[i].after_sleep.sample(rng))
                .unwrap_or(0);
            let next = next_url(client, config, stats);
            select(client, config, rng, stats, next, wait_ms)
        }
        ClientState::Error => recover(client, config, rng, stats),
        ClientState::FinishedOk => Transition::to(ClientState::FinishedOk),
    }
}

/// Restart an errored client at the first cycling URL if recovery is
/// enabled and the cycle budget allows it
fn recover<S>(client: &mut ClientRecord, config: &LoadConfig, rng: &mut Rng, stats: &mut S) -> Transition
where
    S: StatisticsCollector + ?Sized,
{
    let Some(range) = config.cycling else {
        return Transition::to(ClientState::Error);
    };
    if !config.error_recovery_enabled || client.cycling_done {
        return Transition::to(ClientState::Error);
    }

    client.cycle_num += 1;
    if cycles_exhausted(client, config) {
        client.cycling_done = true;
        return Transition::to(ClientState::Error);
    }
    stats.on_cycle_start(client.index);
    select(client, config, rng, stats, Some(range.first), 0)
}

/// Walk forward from `candidate` until the fetch-probability gate accepts a
/// URL or the sequence is exhausted
fn select<S>(
    client: &mut ClientRecord,
    config: &LoadConfig,
    rng: &mut Rng,
    stats: &mut S,
    mut candidate: Option<usize>,
    wait_ms: u64,
) -> Transition
where
    S: StatisticsCollector + ?Sized,
{
    let mut rejected = 0usize;
    loop {
        let Some(index) = candidate else {
            return Transition::to(ClientState::FinishedOk);
        };
        client.url_index = Some(index);
        if fetch_accepted(client, index, config, rng) {
            return Transition {
                state: ClientState::Urls,
                wait_ms,
            };
        }

        rejected += 1;
        if let Some(range) = config.cycling {
            // Once-mode rejections are permanent; stop cycling rather than
            // spinning through a range that will never be fetched again
            if !client.cycling_done
                && rejected > range.last - range.first
                && cycling_all_rejected(client, &config.urls, range)
            {
                client.cycling_done = true;
            }
        }
        candidate = next_url(client, config, stats);
    }
}

/// Cycling policy: the URL following the current one, or `None` when the
/// client has nothing left to fetch
fn next_url<S>(client: &mut ClientRecord, config: &LoadConfig, stats: &mut S) -> Option<usize>
where
    S: StatisticsCollector + ?Sized,
{
    let count = config.urls.len();
    let cycling = config.cycling.filter(|_| !client.cycling_done);

    let next = match client.url_index {
        None => 0,
        Some(current) => match cycling {
            Some(range) if current == range.last => {
                client.cycle_num += 1;
                if cycles_exhausted(client, config) {
                    client.cycling_done = true;
                    current + 1
                } else {
                    stats.on_cycle_start(client.index);
                    return Some(range.first);
                }
            }
            _ => current + 1,
        },
    };

    if next >= count {
        return None;
    }
    if let Some(range) = cycling {
        if next == range.first {
            stats.on_cycle_start(client.index);
        }
    }
    Some(next)
}

fn cycles_exhausted(client: &ClientRecord, config: &LoadConfig) -> bool {
    config.cycles_num > 0 && client.cycle_num >= config.cycles_num
}

fn fetch_accepted(client: &mut ClientRecord, index: usize, config: &LoadConfig, rng: &mut Rng) -> bool {
    let url = &config.urls[index];
    if !url.is_gated() {
        return true;
    }
    if !url.fetch_probability_once {
        return draw(rng, url.fetch_probability);
    }

    let decisions = client
        .fetch_decisions
        .get_or_insert_with(|| vec![None; config.urls.len()]);
    *decisions[index].get_or_insert_with(|| draw(rng, url.fetch_probability))
}

fn draw(rng: &mut Rng, percent: u8) -> bool {
    rng.u8(1..=100) <= percent
}

fn cycling_all_rejected(client: &ClientRecord, urls: &[UrlConfig], range: CyclingRange) -> bool {
    let Some(ref decisions) = client.fetch_decisions else {
        return false;
    };
    (range.first..=range.last).all(|i| {
        urls[i].is_gated() && urls[i].fetch_probability_once && decisions[i] == Some(false)
    })
}
