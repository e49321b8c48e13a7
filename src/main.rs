//! vload - virtual-client load generator
//!
//! Runs a population of virtual clients through a URL sequence with
//! ramp-up, optional fixed-rate pacing and per-URL statistics.

use std::io::{self, BufRead};
use std::thread;

use anyhow::{Context, Result};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vload::batch::{Command, ControlHandle, Orchestrator, TransportKind};
use vload::config::{CliArgs, LoadConfig};

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_names(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn print_banner(config: &LoadConfig, transport: TransportKind) {
    println!("vload v{}", env!("CARGO_PKG_VERSION"));
    println!("====================================");
    println!("URLs: {}", config.urls.len());
    for (i, url) in config.urls.iter().enumerate() {
        let cycling = config.cycling.is_some_and(|r| r.contains(i));
        println!(
            "  [{}] {}{}",
            i,
            url.url,
            if cycling { " (cycling)" } else { "" }
        );
    }
    println!(
        "Clients: {}, Threads: {}, Dispatch: {}",
        config.client_num_max,
        config.threads,
        config.dispatch.as_str()
    );
    println!(
        "Ramp-up: start={} inc={} every {}ms",
        config.client_num_start, config.clients_rampup_inc, config.rampup_interval_ms
    );
    if config.is_rate_mode() {
        println!(
            "Rate: {}/s over {} ticks",
            config.req_rate, config.rate_ticks_per_sec
        );
    }
    println!(
        "Cycles: {}, Run time: {}",
        if config.cycles_num == 0 {
            "unbounded".to_string()
        } else {
            config.cycles_num.to_string()
        },
        if config.run_time_ms == 0 {
            "unbounded".to_string()
        } else {
            format!("{}s", config.run_time_ms / 1000)
        }
    );
    match transport {
        TransportKind::Simulated {
            latency,
            failure_percent,
        } => println!(
            "Transport: simulated, latency {}ms, {}% failures",
            latency, failure_percent
        ),
        TransportKind::TcpProbe => println!("Transport: TCP connect probe"),
    }
    println!("====================================\n");
}

/// Apply commands typed on stdin until EOF or a stop command
fn spawn_command_reader(handle: ControlHandle) -> io::Result<()> {
    thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Some(command) => {
                        handle.apply(command);
                        if command == Command::Stop {
                            break;
                        }
                    }
                    None => warn!("Unknown command {:?} (p, r, +N, q)", line.trim()),
                }
            }
        })?;
    Ok(())
}

fn run() -> Result<()> {
    let args = CliArgs::parse_args();
    setup_logging(args.verbose, args.quiet);

    args.validate()
        .map_err(|e| anyhow::anyhow!("Invalid arguments: {}", e))?;
    let config = LoadConfig::from_cli(&args).context("Configuration error")?;

    let transport = if args.simulate {
        TransportKind::Simulated {
            latency: args.sim_latency,
            failure_percent: args.sim_failure,
        }
    } else {
        TransportKind::TcpProbe
    };

    if !args.quiet {
        print_banner(&config, transport);
    }

    let orchestrator = Orchestrator::new(config, transport)?.with_progress(!args.quiet);
    if args.interactive {
        spawn_command_reader(orchestrator.control_handle())
            .context("Failed to start command reader")?;
        info!("Commands: p(ause), r(esume), +N (add clients), q(uit)");
    }

    let report = orchestrator.run()?;
    if !args.quiet {
        report.print_summary();
    }

    if let Some(ref path) = args.output {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
