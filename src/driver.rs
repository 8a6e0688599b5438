//! Named benchmark scenarios on top of the scheduler.
//!
//! A scenario is a fixed sequence of runs separated by a cool-down. Every run
//! appends one `BenchmarkResult` to the driver's log, whatever its outcome.

use crate::config::DriverConfig;
use crate::metrics::stats::RunSnapshot;
use crate::scheduler::{LoadScheduler, RunPlan, ScheduleMode, StopSignal};
use crate::transport::{Connection, TransportError};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_THROUGHPUT_COUNTS: [usize; 5] = [10, 50, 100, 500, 1000];
pub const DEFAULT_CONCURRENCY_MESSAGES: usize = 500;
pub const DEFAULT_CONCURRENCY_WORKERS: [usize; 5] = [1, 2, 5, 10, 15];
pub const DEFAULT_LATENCY_COUNT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Throughput,
    Concurrency,
    Stress,
    Latency,
    Load,
}

impl Scenario {
    pub fn name(self) -> &'static str {
        match self {
            Self::Throughput => "throughput",
            Self::Concurrency => "concurrency",
            Self::Stress => "stress",
            Self::Latency => "latency",
            Self::Load => "load",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Running(Scenario),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressLevel {
    pub name: String,
    pub messages: usize,
    pub workers: usize,
}

impl StressLevel {
    pub fn new(name: &str, messages: usize, workers: usize) -> Self {
        Self {
            name: name.to_string(),
            messages,
            workers,
        }
    }

    /// Medium 1000x10, High 5000x15, Extreme 10000x20.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("Medium", 1000, 10),
            Self::new("High", 5000, 15),
            Self::new("Extreme", 10000, 20),
        ]
    }

    /// Lighter levels used by the full suite.
    pub fn suite() -> Vec<Self> {
        vec![Self::new("Medium", 500, 8), Self::new("High", 2000, 12)]
    }
}

/// One row of the result log.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResult {
    pub scenario: Scenario,
    pub label: String,
    pub queue: String,
    pub messages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(flatten)]
    pub snapshot: RunSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth_after: Option<u32>,
    pub status: RunStatus,
    pub timestamp: String,
}

/// Headline numbers across the whole log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub best_throughput_rate: Option<f64>,
    pub best_throughput_messages: Option<usize>,
    pub best_concurrency_rate: Option<f64>,
    pub best_concurrency_workers: Option<usize>,
    pub mean_latency_ms: Option<f64>,
}

/// Depths of the monitored queues at one instant. `None` means the query failed.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSample {
    pub elapsed_secs: f64,
    pub depths: Vec<(String, Option<u32>)>,
}

struct Invocation {
    label: String,
    plan: RunPlan,
    workers: Option<usize>,
    batch_size: Option<usize>,
    purge_before: bool,
    depth_after: bool,
}

pub struct BenchmarkDriver {
    scheduler: LoadScheduler,
    config: DriverConfig,
    stop: Arc<StopSignal>,
    state: DriverState,
    results: Vec<BenchmarkResult>,
}

impl BenchmarkDriver {
    pub fn new(scheduler: LoadScheduler, config: DriverConfig) -> Self {
        let stop = scheduler.stop_signal();
        Self {
            scheduler,
            config,
            stop,
            state: DriverState::Idle,
            results: Vec::new(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn results(&self) -> &[BenchmarkResult] {
        &self.results
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    /// Declares every configured queue. Failures are logged and returned
    /// after all queues have been tried.
    pub async fn prepare(&self) -> Result<(), TransportError> {
        let conn = self.scheduler.transport().connect().await?;
        let mut first_error = None;
        for queue in &self.config.setup_queues {
            match conn.declare_queue(queue, self.scheduler.durable()).await {
                Ok(()) => debug!(queue = %queue, "Queue declared"),
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Queue declare failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        let _ = conn.close().await;
        first_error.map_or(Ok(()), Err)
    }

    /// Pooled runs of increasing size against an emptied queue.
    pub async fn throughput(&mut self, counts: &[usize]) -> &[BenchmarkResult] {
        let load = self.scheduler.load();
        let (batch_size, inter_batch_delay) = (load.batch_size, load.inter_batch_delay);
        let invocations = counts
            .iter()
            .map(|&n| Invocation {
                label: format!("{} messages", n),
                plan: RunPlan::new(
                    self.config.queue.clone(),
                    n,
                    ScheduleMode::Pooled {
                        batch_size,
                        inter_batch_delay,
                    },
                ),
                workers: None,
                batch_size: Some(batch_size),
                purge_before: true,
                depth_after: false,
            })
            .collect();
        let cooldown = self.config.throughput_cooldown;
        self.run_scenario(Scenario::Throughput, invocations, cooldown)
            .await
    }

    /// Same message count across increasing worker counts.
    pub async fn concurrency(&mut self, messages: usize, workers: &[usize]) -> &[BenchmarkResult] {
        let invocations = workers
            .iter()
            .map(|&w| Invocation {
                label: format!("{} workers", w),
                plan: RunPlan::new(
                    self.config.queue.clone(),
                    messages,
                    ScheduleMode::Workers { workers: w },
                ),
                workers: Some(w),
                batch_size: None,
                purge_before: true,
                depth_after: false,
            })
            .collect();
        let cooldown = self.config.concurrency_cooldown;
        self.run_scenario(Scenario::Concurrency, invocations, cooldown)
            .await
    }

    /// Heavy worker-mode runs; queue depth is recorded after each.
    pub async fn stress(&mut self, levels: &[StressLevel]) -> &[BenchmarkResult] {
        let invocations = levels
            .iter()
            .map(|level| Invocation {
                label: level.name.clone(),
                plan: RunPlan::new(
                    self.config.queue.clone(),
                    level.messages,
                    ScheduleMode::Workers {
                        workers: level.workers,
                    },
                ),
                workers: Some(level.workers),
                batch_size: None,
                purge_before: false,
                depth_after: true,
            })
            .collect();
        let cooldown = self.config.stress_cooldown;
        self.run_scenario(Scenario::Stress, invocations, cooldown)
            .await
    }

    pub async fn latency(&mut self, count: usize) -> &[BenchmarkResult] {
        let invocations = vec![Invocation {
            label: format!("{} messages", count),
            plan: RunPlan::new(self.config.queue.clone(), count, ScheduleMode::Sequential),
            workers: None,
            batch_size: None,
            purge_before: false,
            depth_after: false,
        }];
        self.run_scenario(Scenario::Latency, invocations, Duration::ZERO)
            .await
    }

    /// Single pooled run with explicit batch shaping.
    pub async fn load(
        &mut self,
        queue: &str,
        messages: usize,
        batch_size: usize,
        inter_batch_delay: Duration,
    ) -> &[BenchmarkResult] {
        let invocations = vec![Invocation {
            label: format!("{} messages, batch {}", messages, batch_size),
            plan: RunPlan::new(
                queue,
                messages,
                ScheduleMode::Pooled {
                    batch_size,
                    inter_batch_delay,
                },
            ),
            workers: None,
            batch_size: Some(batch_size),
            purge_before: false,
            depth_after: true,
        }];
        self.run_scenario(Scenario::Load, invocations, Duration::ZERO)
            .await
    }

    /// Throughput, concurrency, latency and a reduced stress pass.
    pub async fn suite(&mut self) -> &[BenchmarkResult] {
        let start = self.results.len();
        self.throughput(&[50, 100, 500, 1000]).await;
        if !self.stop.is_stopped() {
            self.concurrency(DEFAULT_CONCURRENCY_MESSAGES, &[1, 3, 5, 10])
                .await;
        }
        if !self.stop.is_stopped() {
            self.latency(50).await;
        }
        if !self.stop.is_stopped() {
            self.stress(&StressLevel::suite()).await;
        }
        &self.results[start..]
    }

    pub fn summary(&self) -> Summary {
        let best = |scenario: Scenario| {
            self.results
                .iter()
                .filter(|r| r.scenario == scenario && r.status != RunStatus::Cancelled)
                .filter(|r| !matches!(r.status, RunStatus::Failed { .. }))
                .max_by(|a, b| a.snapshot.rate.total_cmp(&b.snapshot.rate))
        };
        let throughput = best(Scenario::Throughput);
        let concurrency = best(Scenario::Concurrency);
        let mean_latency_ms = self
            .results
            .iter()
            .filter(|r| r.scenario == Scenario::Latency)
            .find_map(|r| r.snapshot.latency.as_ref().map(|l| l.mean_ms));
        Summary {
            best_throughput_rate: throughput.map(|r| r.snapshot.rate),
            best_throughput_messages: throughput.map(|r| r.messages),
            best_concurrency_rate: concurrency.map(|r| r.snapshot.rate),
            best_concurrency_workers: concurrency.and_then(|r| r.workers),
            mean_latency_ms,
        }
    }

    /// Polls queue depths every `interval` for `duration`, logging one row
    /// per tick. Ends early when the stop signal fires.
    pub async fn monitor(
        &self,
        queues: &[String],
        duration: Duration,
        interval: Duration,
    ) -> Result<Vec<QueueSample>, TransportError> {
        let conn = self.scheduler.transport().connect().await?;
        let started = Instant::now();
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut samples = Vec::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop.stopped() => break,
            }
            let depths = sample_depths(conn.as_ref(), queues).await;
            let elapsed = started.elapsed();
            info!(
                elapsed_secs = elapsed.as_secs(),
                depths = ?depths,
                "Queue depths"
            );
            samples.push(QueueSample {
                elapsed_secs: elapsed.as_secs_f64(),
                depths,
            });
            if elapsed >= duration {
                break;
            }
        }
        let _ = conn.close().await;
        Ok(samples)
    }

    /// One-shot depth reading of `queues`.
    pub async fn queue_status(&self, queues: &[String]) -> Result<QueueSample, TransportError> {
        let conn = self.scheduler.transport().connect().await?;
        let depths = sample_depths(conn.as_ref(), queues).await;
        let _ = conn.close().await;
        for (queue, depth) in &depths {
            match depth {
                Some(d) => info!(queue = %queue, depth = d, "Queue status"),
                None => warn!(queue = %queue, "Queue status unavailable"),
            }
        }
        Ok(QueueSample {
            elapsed_secs: 0.0,
            depths,
        })
    }

    /// Empties every queue in `queues`. A queue that cannot be purged is
    /// logged and reported as `None`; the others are still purged.
    pub async fn purge_queues(
        &self,
        queues: &[String],
    ) -> Result<Vec<(String, Option<u32>)>, TransportError> {
        let conn = self.scheduler.transport().connect().await?;
        let mut purged = Vec::with_capacity(queues.len());
        for queue in queues {
            match conn.purge_queue(queue).await {
                Ok(n) => {
                    info!(queue = %queue, purged = n, "Queue purged");
                    purged.push((queue.clone(), Some(n)));
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Queue purge failed");
                    purged.push((queue.clone(), None));
                }
            }
        }
        let _ = conn.close().await;
        Ok(purged)
    }

    /// Closes every pooled connection.
    pub async fn shutdown(&self) {
        self.scheduler.executor().pool().close_all().await;
    }

    async fn run_scenario(
        &mut self,
        scenario: Scenario,
        invocations: Vec<Invocation>,
        cooldown: Duration,
    ) -> &[BenchmarkResult] {
        let start = self.results.len();
        let runs = invocations.len();
        self.state = DriverState::Running(scenario);
        info!(%scenario, runs, "Starting scenario");

        for (i, inv) in invocations.into_iter().enumerate() {
            if self.stop.is_stopped() {
                info!(%scenario, skipped = runs - i, "Stop requested, skipping remaining runs");
                break;
            }
            if inv.purge_before {
                self.purge(&inv.plan.queue).await;
            }
            let total = inv.plan.total;
            let (snapshot, status) = match self.scheduler.run(&inv.plan).await {
                Ok(snapshot) => {
                    let incomplete = snapshot.sent + snapshot.errors < total as u64;
                    let status = if self.stop.is_stopped() && incomplete {
                        RunStatus::Cancelled
                    } else {
                        RunStatus::Completed
                    };
                    (snapshot, status)
                }
                Err(e) => {
                    warn!(%scenario, label = %inv.label, error = %e, "Run failed");
                    (
                        RunSnapshot::all_failed(total as u64),
                        RunStatus::Failed {
                            reason: e.to_string(),
                        },
                    )
                }
            };
            let queue_depth_after = if inv.depth_after {
                self.queue_depth(&inv.plan.queue).await
            } else {
                None
            };
            info!(
                %scenario,
                label = %inv.label,
                sent = snapshot.sent,
                errors = snapshot.errors,
                rate = snapshot.rate,
                status = ?status,
                "Run recorded"
            );
            let cancelled = status == RunStatus::Cancelled;
            self.results.push(BenchmarkResult {
                scenario,
                label: inv.label,
                queue: inv.plan.queue,
                messages: total,
                workers: inv.workers,
                batch_size: inv.batch_size,
                snapshot,
                queue_depth_after,
                status,
                timestamp: Utc::now().to_rfc3339(),
            });
            if cancelled {
                break;
            }
            if i + 1 < runs && !cooldown.is_zero() {
                debug!(cooldown_ms = cooldown.as_millis() as u64, "Cooling down");
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    _ = self.stop.stopped() => {}
                }
            }
        }

        self.state = DriverState::Idle;
        &self.results[start..]
    }

    async fn purge(&self, queue: &str) {
        let conn = match self.scheduler.transport().connect().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(queue, error = %e, "Purge skipped, connect failed");
                return;
            }
        };
        match conn.purge_queue(queue).await {
            Ok(purged) => debug!(queue, purged, "Queue purged"),
            Err(e) => debug!(queue, error = %e, "Queue purge failed, continuing"),
        }
        let _ = conn.close().await;
    }

    async fn queue_depth(&self, queue: &str) -> Option<u32> {
        let conn = self.scheduler.transport().connect().await.ok()?;
        let depth = conn.queue_depth(queue).await;
        let _ = conn.close().await;
        match depth {
            Ok(d) => Some(d),
            Err(e) => {
                debug!(queue, error = %e, "Depth query failed");
                None
            }
        }
    }
}

async fn sample_depths(conn: &dyn Connection, queues: &[String]) -> Vec<(String, Option<u32>)> {
    let mut depths = Vec::with_capacity(queues.len());
    for queue in queues {
        let depth = match conn.queue_depth(queue).await {
            Ok(d) => Some(d),
            Err(e) => {
                debug!(queue = %queue, error = %e, "Depth query failed");
                None
            }
        };
        depths.push((queue.clone(), depth));
    }
    depths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stress_defaults_match_documented_levels() {
        let levels = StressLevel::defaults();
        let shape: Vec<_> = levels.iter().map(|l| (l.messages, l.workers)).collect();
        assert_eq!(shape, vec![(1000, 10), (5000, 15), (10000, 20)]);
    }

    #[test]
    fn status_serializes_with_reason() {
        let failed = RunStatus::Failed {
            reason: "connect: refused".into(),
        };
        let v = serde_json::to_value(&failed).expect("json");
        assert_eq!(v["state"], "failed");
        assert_eq!(v["reason"], "connect: refused");
        let v = serde_json::to_value(RunStatus::Completed).expect("json");
        assert_eq!(v["state"], "completed");
    }

    #[test]
    fn scenario_names_are_stable() {
        assert_eq!(Scenario::Throughput.to_string(), "throughput");
        assert_eq!(Scenario::Load.name(), "load");
    }
}
