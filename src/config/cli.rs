//! Command-line argument parsing
//!
//! Flags override values loaded from `--config`. Arguments are grouped by
//! category.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::load_config::MsRange;

/// Virtual-client load generator
#[derive(Parser, Debug, Clone)]
#[command(name = "vload")]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    // ===== Configuration Source =====
    /// JSON load configuration file
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Target URL (repeatable); replaces the URL list of the config file
    #[arg(long = "url", action = clap::ArgAction::Append)]
    pub urls: Vec<String>,

    /// Completion timeout for --url entries, `MS` or `LO-HI`
    #[arg(long = "timeout")]
    pub timeout: Option<MsRange>,

    /// Sleep after each --url entry completes, `MS` or `LO-HI`
    #[arg(long = "sleep")]
    pub sleep: Option<MsRange>,

    // ===== Population & Pacing =====
    /// Total number of virtual clients
    #[arg(short = 'c', long = "clients")]
    pub clients: Option<usize>,

    /// Clients started on the first ramp-up tick
    #[arg(long = "start")]
    pub start: Option<usize>,

    /// Clients added per ramp-up tick (0 = all at once)
    #[arg(long = "rampup-inc")]
    pub rampup_inc: Option<usize>,

    /// Stop ramp-up at this many clients until more are added interactively
    #[arg(long = "rampup-target")]
    pub rampup_target: Option<usize>,

    /// Passes through the cycling URLs (0 = unbounded)
    #[arg(long = "cycles")]
    pub cycles: Option<u64>,

    /// Run duration in seconds (0 = unbounded)
    #[arg(long = "run-time")]
    pub run_time: Option<u64>,

    /// Fixed aggregate request rate per second (0 = off)
    #[arg(long = "rate")]
    pub rate: Option<u64>,

    /// Do not restart clients after an error
    #[arg(long = "no-recovery")]
    pub no_recovery: bool,

    // ===== Execution =====
    /// Number of sub-batches, one thread each
    #[arg(long = "threads")]
    pub threads: Option<usize>,

    /// I/O concurrency model
    #[arg(long = "dispatch", value_enum)]
    pub dispatch: Option<DispatchModel>,

    /// RNG seed (0 = random)
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    // ===== Transport =====
    /// Use the simulated transport instead of TCP connect probes
    #[arg(long = "simulate")]
    pub simulate: bool,

    /// Simulated fetch latency, `MS` or `LO-HI`
    #[arg(long = "sim-latency", default_value = "5-50")]
    pub sim_latency: MsRange,

    /// Simulated failure percentage
    #[arg(long = "sim-failure", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub sim_failure: u8,

    // ===== Output & Control =====
    /// Write the final report as JSON
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Read pacing commands from stdin while running
    #[arg(long = "interactive")]
    pub interactive: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Quiet mode (minimal output)
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

/// How a sub-batch waits for I/O
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchModel {
    /// Readiness-driven: block on sockets and the next timer deadline
    #[default]
    Reactive,
    /// Drive the transport, then wait a bounded slice
    Poll,
}

impl DispatchModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchModel::Reactive => "reactive",
            DispatchModel::Poll => "poll",
        }
    }
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations
    pub fn validate(&self) -> Result<(), String> {
        if self.config.is_none() && self.urls.is_empty() {
            return Err("either --config or at least one --url is required".to_string());
        }
        if (self.timeout.is_some() || self.sleep.is_some()) && self.urls.is_empty() {
            return Err("--timeout and --sleep apply to --url entries only".to_string());
        }
        if self.verbose && self.quiet {
            return Err("--verbose and --quiet are mutually exclusive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = CliArgs::parse_from(["test", "--url", "http://localhost/"]);
        assert_eq!(args.urls, vec!["http://localhost/"]);
        assert_eq!(args.sim_latency, MsRange { lo: 5, hi: 50 });
        assert_eq!(args.sim_failure, 0);
        assert!(args.clients.is_none());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_pacing_args() {
        let args = CliArgs::parse_from([
            "test",
            "--url",
            "http://a/",
            "--url",
            "http://b/",
            "-c",
            "200",
            "--start",
            "20",
            "--rampup-inc",
            "10",
            "--rate",
            "100",
            "--dispatch",
            "poll",
            "--timeout",
            "100-300",
        ]);
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.clients, Some(200));
        assert_eq!(args.start, Some(20));
        assert_eq!(args.rampup_inc, Some(10));
        assert_eq!(args.rate, Some(100));
        assert_eq!(args.dispatch, Some(DispatchModel::Poll));
        assert_eq!(args.timeout, Some(MsRange { lo: 100, hi: 300 }));
    }

    #[test]
    fn test_validation_requires_target() {
        let args = CliArgs::parse_from(["test"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_sleep_without_url() {
        let args = CliArgs::parse_from(["test", "--config", "load.json", "--sleep", "10"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_sim_failure_range() {
        assert!(CliArgs::try_parse_from(["test", "--url", "x", "--sim-failure", "101"]).is_err());
    }
}
