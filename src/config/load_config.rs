//! Load configuration consumed by the scheduling core
//!
//! Read from a JSON file, overridden by CLI flags, then validated. Validation
//! also derives the cycling URL range.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::cli::{CliArgs, DispatchModel};
use crate::timer::MIN_PERIOD_MS;
use crate::utils::ConfigError;

/// Inclusive millisecond range; a value is drawn uniformly on each use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MsRangeRepr", into = "[u64; 2]")]
pub struct MsRange {
    pub lo: u64,
    pub hi: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MsRangeRepr {
    Single(u64),
    Pair([u64; 2]),
}

impl TryFrom<MsRangeRepr> for MsRange {
    type Error = String;

    fn try_from(repr: MsRangeRepr) -> Result<Self, Self::Error> {
        match repr {
            MsRangeRepr::Single(v) => Ok(MsRange::fixed(v)),
            MsRangeRepr::Pair([lo, hi]) => MsRange::new(lo, hi),
        }
    }
}

impl From<MsRange> for [u64; 2] {
    fn from(r: MsRange) -> Self {
        [r.lo, r.hi]
    }
}

impl MsRange {
    pub fn new(lo: u64, hi: u64) -> Result<Self, String> {
        if lo > hi {
            return Err(format!("range lower bound {} exceeds upper bound {}", lo, hi));
        }
        Ok(Self { lo, hi })
    }

    pub const fn fixed(ms: u64) -> Self {
        Self { lo: ms, hi: ms }
    }

    pub fn is_zero(&self) -> bool {
        self.hi == 0
    }

    pub fn sample(&self, rng: &mut fastrand::Rng) -> u64 {
        if self.hi <= self.lo {
            self.lo
        } else {
            rng.u64(self.lo..=self.hi)
        }
    }
}

impl FromStr for MsRange {
    type Err = String;

    /// Accepts `N` or `LO-HI`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid milliseconds '{}'", v.trim()))
        };
        match s.split_once('-') {
            Some((lo, hi)) => MsRange::new(parse(lo)?, parse(hi)?),
            None => Ok(MsRange::fixed(parse(s)?)),
        }
    }
}

impl fmt::Display for MsRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}ms", self.lo)
        } else {
            write!(f, "{}-{}ms", self.lo, self.hi)
        }
    }
}

/// One URL of the client's fetch sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlConfig {
    pub url: String,
    /// Fetched once (login/logoff style) instead of every cycle
    #[serde(default)]
    pub dont_cycle: bool,
    /// Completion timeout; zero disables the timer
    #[serde(default)]
    pub completion_timeout: MsRange,
    /// Sleep after this URL completes before the next fetch
    #[serde(default)]
    pub after_sleep: MsRange,
    /// Percent chance (1-100) the URL is fetched; 0 means always
    #[serde(default)]
    pub fetch_probability: u8,
    /// Draw the fetch decision once per client and reuse it
    #[serde(default)]
    pub fetch_probability_once: bool,
}

impl UrlConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dont_cycle: false,
            completion_timeout: MsRange::default(),
            after_sleep: MsRange::default(),
            fetch_probability: 0,
            fetch_probability_once: false,
        }
    }

    pub fn is_gated(&self) -> bool {
        self.fetch_probability > 0 && self.fetch_probability < 100
    }
}

/// Contiguous range of URLs repeated on every cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclingRange {
    pub first: usize,
    pub last: usize,
}

impl CyclingRange {
    pub fn contains(&self, index: usize) -> bool {
        (self.first..=self.last).contains(&index)
    }
}

/// Complete load configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub name: String,
    pub client_num_max: usize,
    /// Clients started by the first ramp-up tick; 0 uses the increment
    pub client_num_start: usize,
    /// Clients added per ramp-up tick; 0 starts all of them at once
    pub clients_rampup_inc: usize,
    /// Ramp-up stops here until `add_clients` raises it; `None` means
    /// `client_num_max`
    pub rampup_target: Option<usize>,
    /// Passes through the cycling range; 0 = unbounded
    pub cycles_num: u64,
    /// Run-time budget in ms; 0 = unbounded
    pub run_time_ms: u64,
    /// Fixed aggregate request rate per second; 0 disables rate pacing
    pub req_rate: u64,
    pub error_recovery_enabled: bool,
    /// Sub-batches, one thread each
    pub threads: usize,
    pub rate_ticks_per_sec: u32,
    pub rampup_interval_ms: u64,
    /// Leader snapshot interval; 0 disables snapshots
    pub snapshot_interval_ms: u64,
    pub control_poll_ms: u64,
    pub dispatch: DispatchModel,
    /// RNG seed; 0 picks a random one
    pub seed: u64,
    pub urls: Vec<UrlConfig>,

    /// Derived by `validate`
    #[serde(skip)]
    pub cycling: Option<CyclingRange>,
    /// Global index of this sub-batch's first client
    #[serde(skip)]
    pub client_offset: usize,
    /// This sub-batch's part of `client_num_start`, zero included
    #[serde(skip)]
    pub start_share: Option<usize>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            name: "vload".to_string(),
            client_num_max: 1,
            client_num_start: 0,
            clients_rampup_inc: 0,
            rampup_target: None,
            cycles_num: 0,
            run_time_ms: 0,
            req_rate: 0,
            error_recovery_enabled: true,
            threads: 1,
            rate_ticks_per_sec: 10,
            rampup_interval_ms: 1000,
            snapshot_interval_ms: 3000,
            control_poll_ms: 100,
            dispatch: DispatchModel::Reactive,
            seed: 0,
            urls: Vec::new(),
            cycling: None,
            client_offset: 0,
            start_share: None,
        }
    }
}

impl LoadConfig {
    /// Parse a JSON configuration file (not validated)
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse JSON configuration text (not validated)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Build the configuration from CLI arguments: optional file first,
    /// then flag overrides, then validation
    pub fn from_cli(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match args.config {
            Some(ref path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if !args.urls.is_empty() {
            config.urls = args
                .urls
                .iter()
                .map(|u| UrlConfig {
                    completion_timeout: args.timeout.unwrap_or_default(),
                    after_sleep: args.sleep.unwrap_or_default(),
                    ..UrlConfig::new(u.clone())
                })
                .collect();
        }
        if let Some(v) = args.clients {
            config.client_num_max = v;
        }
        if let Some(v) = args.start {
            config.client_num_start = v;
        }
        if let Some(v) = args.rampup_inc {
            config.clients_rampup_inc = v;
        }
        if let Some(v) = args.rampup_target {
            config.rampup_target = Some(v);
        }
        if let Some(v) = args.cycles {
            config.cycles_num = v;
        }
        if let Some(v) = args.run_time {
            config.run_time_ms = v * 1000;
        }
        if let Some(v) = args.rate {
            config.req_rate = v;
        }
        if let Some(v) = args.threads {
            config.threads = v;
        }
        if let Some(v) = args.dispatch {
            config.dispatch = v;
        }
        if let Some(v) = args.seed {
            config.seed = v;
        }
        if args.no_recovery {
            config.error_recovery_enabled = false;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check settings and derive the cycling range
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.urls.is_empty() {
            return Err(ConfigError::NoUrls);
        }
        if self.client_num_max == 0 {
            return Err(ConfigError::invalid("client_num_max", "must be at least 1"));
        }
        if self.client_num_start > self.client_num_max {
            return Err(ConfigError::invalid(
                "client_num_start",
                format!("{} exceeds client_num_max {}", self.client_num_start, self.client_num_max),
            ));
        }
        if let Some(target) = self.rampup_target {
            if target > self.client_num_max {
                return Err(ConfigError::invalid(
                    "rampup_target",
                    format!("{} exceeds client_num_max {}", target, self.client_num_max),
                ));
            }
        }
        if self.threads == 0 || self.threads > self.client_num_max {
            return Err(ConfigError::invalid(
                "threads",
                format!("must be between 1 and client_num_max ({})", self.client_num_max),
            ));
        }
        if self.req_rate > 0 && (self.threads as u64) > self.req_rate {
            return Err(ConfigError::invalid(
                "threads",
                format!("req_rate {} cannot be shared by {} threads", self.req_rate, self.threads),
            ));
        }
        let ticks = self.rate_ticks_per_sec;
        if ticks == 0 || 1000 % ticks != 0 || u64::from(1000 / ticks) < MIN_PERIOD_MS {
            return Err(ConfigError::invalid(
                "rate_ticks_per_sec",
                format!("{} must divide 1000 with a tick of at least {}ms", ticks, MIN_PERIOD_MS),
            ));
        }
        for (field, value) in [
            ("rampup_interval_ms", self.rampup_interval_ms),
            ("control_poll_ms", self.control_poll_ms),
        ] {
            if value < MIN_PERIOD_MS {
                return Err(ConfigError::invalid(
                    field,
                    format!("{}ms is below the {}ms timer resolution", value, MIN_PERIOD_MS),
                ));
            }
        }
        if self.snapshot_interval_ms != 0 && self.snapshot_interval_ms < MIN_PERIOD_MS {
            return Err(ConfigError::invalid(
                "snapshot_interval_ms",
                format!("{}ms is below the {}ms timer resolution", self.snapshot_interval_ms, MIN_PERIOD_MS),
            ));
        }

        for (index, url) in self.urls.iter().enumerate() {
            if url.url.trim().is_empty() {
                return Err(ConfigError::Url {
                    index,
                    reason: "empty URL".to_string(),
                });
            }
            if url.fetch_probability > 100 {
                return Err(ConfigError::Url {
                    index,
                    reason: format!("fetch_probability {} exceeds 100", url.fetch_probability),
                });
            }
        }

        self.cycling = Self::cycling_range(&self.urls)?;
        Ok(())
    }

    fn cycling_range(urls: &[UrlConfig]) -> Result<Option<CyclingRange>, ConfigError> {
        let Some(first) = urls.iter().position(|u| !u.dont_cycle) else {
            return Ok(None);
        };
        let last = urls.iter().rposition(|u| !u.dont_cycle).unwrap_or(first);
        if let Some(offset) = urls[first..=last].iter().position(|u| u.dont_cycle) {
            return Err(ConfigError::Url {
                index: first + offset,
                reason: "non-cycling URL inside the cycling range".to_string(),
            });
        }
        Ok(Some(CyclingRange { first, last }))
    }

    pub fn is_rate_mode(&self) -> bool {
        self.req_rate > 0
    }

    pub fn effective_rampup_target(&self) -> usize {
        self.rampup_target
            .unwrap_or(self.client_num_max)
            .min(self.client_num_max)
    }

    /// Size of the first ramp-up tick; `None` uses the increment
    pub fn ramp_start(&self) -> Option<usize> {
        self.start_share
            .or((self.client_num_start > 0).then_some(self.client_num_start))
    }

    /// Partition the population and pacing across `self.threads`
    /// sub-batches, remainder going to the lowest-numbered ones
    pub fn split(&self) -> Vec<LoadConfig> {
        let n = self.threads.max(1);
        let share = |total: usize, i: usize| total / n + usize::from(i < total % n);

        let mut offset = 0;
        (0..n)
            .map(|i| {
                let clients = share(self.client_num_max, i);
                let mut inc = share(self.clients_rampup_inc, i);
                if self.clients_rampup_inc > 0 && inc == 0 {
                    inc = 1;
                }
                let rate = self.req_rate / n as u64 + u64::from((i as u64) < self.req_rate % n as u64);

                let start = share(self.client_num_start, i).min(clients);
                let part = LoadConfig {
                    client_num_max: clients,
                    client_num_start: start,
                    start_share: (self.client_num_start > 0).then_some(start),
                    clients_rampup_inc: inc,
                    rampup_target: self.rampup_target.map(|t| share(t, i).min(clients)),
                    req_rate: rate,
                    threads: 1,
                    client_offset: offset,
                    ..self.clone()
                };
                offset += clients;
                part
            })
            .collect()
    }
}
