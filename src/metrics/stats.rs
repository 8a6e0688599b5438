use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A point in the run, kept both monotonic (for the duration) and wall
/// clock (for the report).
#[derive(Debug, Clone, Copy)]
struct Mark {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Mark {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

// A panicked worker must not take the report down with it.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters and timing for a single run.
///
/// One instance belongs to exactly one scheduler invocation. Workers only
/// touch it through atomic increments; the owner reads it through
/// `snapshot` once every worker has joined.
#[derive(Debug, Default)]
pub struct RunStatistics {
    pub sent: AtomicU64,
    pub errors: AtomicU64,
    pub retries: AtomicU64,
    pub connection_errors: AtomicU64,

    start_time: Mutex<Option<Mark>>,
    end_time: Mutex<Option<Mark>>,

    // Only allocated for runs that report percentiles.
    latencies: Option<Mutex<Vec<Duration>>>,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collector that also keeps every round-trip sample.
    pub fn with_latency() -> Self {
        Self {
            latencies: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Merge a worker's local tally.
    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_errors(&self, n: u64) {
        self.errors.fetch_add(n, Ordering::Relaxed);
    }

    /// No-op unless built with `with_latency`.
    pub fn record_latency(&self, sample: Duration) {
        if let Some(latencies) = &self.latencies {
            lock(latencies).push(sample);
        }
    }

    pub fn tracks_latency(&self) -> bool {
        self.latencies.is_some()
    }

    /// Marks the first dispatch. Later calls keep the original instant.
    pub fn mark_started(&self) {
        let mut start = lock(&self.start_time);
        if start.is_none() {
            *start = Some(Mark::now());
        }
    }

    /// Marks the last completion.
    pub fn mark_finished(&self) {
        *lock(&self.end_time) = Some(Mark::now());
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Wall clock from `mark_started` to `mark_finished` (or now, while running).
    pub fn duration(&self) -> Duration {
        let start = *lock(&self.start_time);
        let end = *lock(&self.end_time);
        match (start, end) {
            (Some(s), Some(e)) => e.at.saturating_duration_since(s.at),
            (Some(s), None) => s.at.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let sent = self.sent.load(Ordering::Relaxed);
        let duration = self.duration();
        let latency = self
            .latencies
            .as_ref()
            .and_then(|l| LatencySummary::from_samples(&lock(l)));
        RunSnapshot {
            sent,
            errors: self.errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            started_at: lock(&self.start_time).map(|m| m.wall.to_rfc3339()),
            finished_at: lock(&self.end_time).map(|m| m.wall.to_rfc3339()),
            duration_secs: duration.as_secs_f64(),
            rate: throughput(sent, duration),
            latency,
        }
    }
}

/// Messages per second; 0 when nothing measurable elapsed.
pub fn throughput(count: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Immutable result of one run. Every scheduling mode produces this shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub sent: u64,
    pub errors: u64,
    /// Attempts that were followed by another attempt of the same message.
    /// The final failed attempt of an exhausted message is an error, not a
    /// retry, and failed pool acquires count here as well as in
    /// `connection_errors`.
    pub retries: u64,
    pub connection_errors: u64,
    /// RFC 3339 wall clock of the first dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// RFC 3339 wall clock of the last completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub duration_secs: f64,
    pub rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySummary>,
}

impl RunSnapshot {
    /// Run that failed before anything was dispatched: every message is an error.
    pub fn all_failed(total: u64) -> Self {
        Self {
            errors: total,
            ..Self::default()
        }
    }
}

/// Round-trip summary in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
}

impl LatencySummary {
    /// `None` means "no data".
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut ms: Vec<f64> = samples
            .iter()
            .map(|d| d.as_nanos() as f64 / 1_000_000.0)
            .collect();
        ms.sort_by(|a, b| a.total_cmp(b));
        let n = ms.len();
        let mean = ms.iter().sum::<f64>() / n as f64;
        Some(Self {
            samples: n,
            mean_ms: mean,
            min_ms: ms[0],
            max_ms: ms[n - 1],
            p95_ms: ms[nearest_rank(n, 95)],
        })
    }
}

/// Index of the nearest-rank `percent`-th percentile in a sorted slice of
/// length `n > 0`: `ceil(percent / 100 * n) - 1`, clamped to `[0, n - 1]`.
pub fn nearest_rank(n: usize, percent: usize) -> usize {
    let rank = (percent * n).div_ceil(100);
    rank.saturating_sub(1).min(n - 1)
}
