//! Result rendering: console tables and the JSON report file.

use crate::driver::{BenchmarkResult, Scenario, Summary};
use anyhow::{Context, Result};
use chrono::Local;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// `benchmark_report_<YYYYmmdd_HHMMSS>.json` in the current directory.
pub fn default_report_path() -> PathBuf {
    PathBuf::from(format!(
        "benchmark_report_{}.json",
        Local::now().format("%Y%m%d_%H%M%S")
    ))
}

/// Groups results by scenario name, preserving run order within a scenario.
pub fn group_by_scenario(results: &[BenchmarkResult]) -> BTreeMap<&'static str, Vec<&BenchmarkResult>> {
    let mut grouped: BTreeMap<&'static str, Vec<&BenchmarkResult>> = BTreeMap::new();
    for r in results {
        grouped.entry(r.scenario.name()).or_default().push(r);
    }
    grouped
}

pub enum OutputWriter {
    Stdout,
    File { path: PathBuf, file: File },
}

impl OutputWriter {
    pub fn new_stdout() -> Self {
        Self::Stdout
    }

    pub async fn new_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .await
            .with_context(|| format!("creating report file {}", path.display()))?;
        Ok(Self::File { path, file })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Stdout => None,
            Self::File { path, .. } => Some(path),
        }
    }

    /// Writes the report object keyed by scenario name.
    pub async fn write_report(&mut self, results: &[BenchmarkResult]) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(&group_by_scenario(results))
            .context("serializing benchmark report")?;
        json.push(b'\n');
        match self {
            Self::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(&json).await?;
                out.flush().await?;
            }
            Self::File { path, file } => {
                file.write_all(&json)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                file.flush().await?;
            }
        }
        Ok(())
    }
}

/// Plain-text tables, one per scenario present, followed by the summary.
pub fn render_tables(results: &[BenchmarkResult], summary: &Summary) -> String {
    let mut out = String::new();
    for (name, rows) in group_by_scenario(results) {
        let _ = writeln!(out, "\n== {} ==", name.to_uppercase());
        let scenario = rows.first().map(|r| r.scenario);
        match scenario {
            Some(Scenario::Latency) => {
                for r in rows {
                    let _ = writeln!(out, "messages tested: {}", r.messages);
                    match &r.snapshot.latency {
                        Some(l) => {
                            let _ = writeln!(out, "mean latency:    {:.2}ms", l.mean_ms);
                            let _ = writeln!(out, "min latency:     {:.2}ms", l.min_ms);
                            let _ = writeln!(out, "max latency:     {:.2}ms", l.max_ms);
                            let _ = writeln!(out, "p95 latency:     {:.2}ms", l.p95_ms);
                        }
                        None => {
                            let _ = writeln!(out, "latency:         no data");
                        }
                    }
                }
            }
            _ => {
                let _ = writeln!(
                    out,
                    "{:<24} {:>9} {:>9} {:>7} {:>12} {:>9} {:>10}",
                    "run", "messages", "sent", "errors", "rate msg/s", "duration", "depth"
                );
                for r in rows {
                    let depth = r
                        .queue_depth_after
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".into());
                    let _ = writeln!(
                        out,
                        "{:<24} {:>9} {:>9} {:>7} {:>12.2} {:>8.2}s {:>10}",
                        r.label,
                        r.messages,
                        r.snapshot.sent,
                        r.snapshot.errors,
                        r.snapshot.rate,
                        r.snapshot.duration_secs,
                        depth
                    );
                }
            }
        }
    }

    let _ = writeln!(out, "\n== SUMMARY ==");
    if let (Some(rate), Some(n)) = (summary.best_throughput_rate, summary.best_throughput_messages) {
        let _ = writeln!(out, "best throughput:  {:.2} msg/s ({} messages)", rate, n);
    }
    if let (Some(rate), Some(w)) = (summary.best_concurrency_rate, summary.best_concurrency_workers) {
        let _ = writeln!(out, "best concurrency: {:.2} msg/s ({} workers)", rate, w);
    }
    if let Some(ms) = summary.mean_latency_ms {
        let _ = writeln!(out, "mean latency:     {:.2}ms", ms);
    }
    out
}
