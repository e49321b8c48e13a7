//! Run report: console summary and JSON export

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use serde_json::json;

use super::collector::BatchStats;
use crate::batch::ProgressSnapshot;
use crate::utils::format_count;

/// Merged result of every sub-batch
pub struct LoadReport {
    pub name: String,
    pub urls: Vec<String>,
    pub duration: Duration,
    pub batches: usize,
    pub clients: usize,
    pub finished_ok: usize,
    pub errored: usize,
    pub never_started: usize,
    pub stats: BatchStats,
    /// Periodic progress log taken by the leader batch
    pub snapshots: Vec<ProgressSnapshot>,
}

impl LoadReport {
    /// Successful fetches per second
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.stats.total().ok as f64 / secs
    }

    pub fn percentile_ms(&self, p: f64) -> u64 {
        self.stats.latency().value_at_percentile(p)
    }

    pub fn print_summary(&self) {
        print!("{}", self.render());
    }

    /// Human-readable summary
    pub fn render(&self) -> String {
        let total = self.stats.total();
        let latency = self.stats.latency();
        let mut out = String::new();

        out.push_str(&format!("\n=== {} ===\n", self.name));
        out.push_str(&format!(
            "Fetches: {} ok | {} failed | {} timed out | Duration: {:.2}s | Throughput: {} fetch/s\n",
            format_count(total.ok),
            format_count(total.failed),
            format_count(total.timed_out),
            self.duration.as_secs_f64(),
            format_count(self.throughput() as u64),
        ));
        out.push_str(&format!(
            "Clients: {} finished | {} errored | {} never started | Cycles: {} | Batches: {}\n",
            format_count(self.finished_ok as u64),
            format_count(self.errored as u64),
            format_count(self.never_started as u64),
            format_count(self.stats.cycles_started()),
            self.batches,
        ));
        if !latency.is_empty() {
            out.push_str(&format!(
                "Latency (ms): avg={:.2} p50={} p95={} p99={} p99.9={} max={}\n",
                latency.mean(),
                self.percentile_ms(50.0),
                self.percentile_ms(95.0),
                self.percentile_ms(99.0),
                self.percentile_ms(99.9),
                latency.max(),
            ));
        }

        out.push_str(&format!(
            "\n{:>3} {:40} {:>10} {:>8} {:>9} {:>7} {:>9}\n",
            "#", "URL", "Ok", "Failed", "Timeouts", "Errors", "Finished"
        ));
        out.push_str(&format!("{}\n", "-".repeat(92)));
        for (i, counters) in self.stats.urls().iter().enumerate() {
            let url = self.urls.get(i).map(String::as_str).unwrap_or("?");
            out.push_str(&format!(
                "{:>3} {:40} {:>10} {:>8} {:>9} {:>7} {:>9}\n",
                i,
                truncate(url, 40),
                format_count(counters.ok),
                format_count(counters.failed),
                format_count(counters.timed_out),
                format_count(counters.errors),
                format_count(counters.finished),
            ));
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Value {
        let latency = self.stats.latency();
        json!({
            "name": self.name,
            "duration_secs": self.duration.as_secs_f64(),
            "throughput": self.throughput(),
            "batches": self.batches,
            "clients": {
                "total": self.clients,
                "finished_ok": self.finished_ok,
                "errored": self.errored,
                "never_started": self.never_started,
                "error_transitions": self.stats.clients_errored(),
            },
            "cycles_started": self.stats.cycles_started(),
            "totals": self.stats.total(),
            "latency_ms": {
                "count": latency.len(),
                "mean": latency.mean(),
                "p50": self.percentile_ms(50.0),
                "p95": self.percentile_ms(95.0),
                "p99": self.percentile_ms(99.0),
                "p999": self.percentile_ms(99.9),
                "max": latency.max(),
            },
            "urls": self.stats.urls().iter().enumerate().map(|(i, c)| {
                json!({
                    "index": i,
                    "url": self.urls.get(i),
                    "counters": c,
                })
            }).collect::<Vec<_>>(),
            "snapshots": self.snapshots,
        })
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut file, &self.to_json())?;
        writeln!(file)?;
        file.flush()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
