//! Turns "send N messages to queue Q" into concurrent publishing work.
//!
//! Three shapes are supported:
//! - worker mode: one task per worker, each on its own dedicated connection;
//! - pooled mode: fixed-size batches through the shared `PublishExecutor`;
//! - sequential mode: one connection, one message at a time, latency sampled.
//!
//! Every mode reports the same `RunSnapshot`. Cancellation goes through a
//! shared [`StopSignal`] that is checked between messages (or batches); work
//! already in flight is allowed to finish.

use crate::config::LoadConfig;
use crate::metrics::stats::{RunSnapshot, RunStatistics};
use crate::payload::{MessageFactory, MessageKind};
use crate::publish::{PublishExecutor, CONTENT_TYPE_JSON};
use crate::transport::{Transport, TransportError};
use bytes::Bytes;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Upper bound on concurrently publishing messages within one pooled batch.
pub const MAX_BATCH_IN_FLIGHT: usize = 5;
const PROGRESS_EVERY: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("run setup failed: {0}")]
    Setup(#[from] TransportError),
}

/// Cooperative cancellation flag shared by the driver and every worker.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Workers {
        workers: usize,
    },
    Pooled {
        batch_size: usize,
        inter_batch_delay: Duration,
    },
    Sequential,
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub queue: String,
    pub total: usize,
    pub mode: ScheduleMode,
    pub kind: MessageKind,
}

impl RunPlan {
    /// Message kind follows the target queue.
    pub fn new(queue: impl Into<String>, total: usize, mode: ScheduleMode) -> Self {
        let queue = queue.into();
        let kind = MessageKind::for_queue(&queue);
        Self {
            queue,
            total,
            mode,
            kind,
        }
    }
}

/// Splits `total` into `workers` near-equal shares; the first
/// `total % workers` shares get one extra. Zero workers count as one.
pub fn partition(total: usize, workers: usize) -> Vec<usize> {
    let workers = workers.max(1);
    let base = total / workers;
    let extra = total % workers;
    (0..workers).map(|w| base + usize::from(w < extra)).collect()
}

pub struct LoadScheduler {
    transport: Arc<dyn Transport>,
    executor: Arc<PublishExecutor>,
    load: LoadConfig,
    durable: bool,
    stop: Arc<StopSignal>,
}

impl LoadScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        executor: Arc<PublishExecutor>,
        load: LoadConfig,
        durable: bool,
    ) -> Self {
        Self {
            transport,
            executor,
            load,
            durable,
            stop: Arc::new(StopSignal::new()),
        }
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    pub fn executor(&self) -> &Arc<PublishExecutor> {
        &self.executor
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn load(&self) -> &LoadConfig {
        &self.load
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Runs one plan to completion (or until stopped).
    ///
    /// Only setup failures are errors; everything after dispatch is counted.
    pub async fn run(&self, plan: &RunPlan) -> Result<RunSnapshot, SchedulerError> {
        info!(
            queue = %plan.queue,
            total = plan.total,
            mode = ?plan.mode,
            kind = ?plan.kind,
            "Starting run"
        );
        let snapshot = match plan.mode {
            ScheduleMode::Workers { workers } => {
                self.setup(&plan.queue).await?;
                self.run_workers(plan, workers).await
            }
            ScheduleMode::Pooled {
                batch_size,
                inter_batch_delay,
            } => {
                self.setup(&plan.queue).await?;
                self.run_pooled(plan, batch_size, inter_batch_delay).await
            }
            ScheduleMode::Sequential => self.run_sequential(plan).await?,
        };
        info!(
            queue = %plan.queue,
            sent = snapshot.sent,
            errors = snapshot.errors,
            retries = snapshot.retries,
            connection_errors = snapshot.connection_errors,
            duration_secs = snapshot.duration_secs,
            rate = snapshot.rate,
            "Run finished"
        );
        Ok(snapshot)
    }

    async fn setup(&self, queue: &str) -> Result<(), SchedulerError> {
        let conn = self.transport.connect().await.map_err(|e| {
            error!(error = %e, endpoint = %self.transport.endpoint(), "Setup connect failed");
            e
        })?;
        let declared = conn.declare_queue(queue, self.durable).await;
        let _ = conn.close().await;
        declared.map_err(|e| {
            error!(error = %e, queue, "Setup declare failed");
            e.into()
        })
    }

    async fn run_workers(&self, plan: &RunPlan, workers: usize) -> RunSnapshot {
        let stats = Arc::new(RunStatistics::new());
        let shares = partition(plan.total, workers);
        debug!(?shares, "Worker shares");
        let queue: Arc<str> = Arc::from(plan.queue.as_str());

        stats.mark_started();
        let mut offset = 0u64;
        let mut handles = Vec::with_capacity(shares.len());
        for (id, &share) in shares.iter().enumerate() {
            let worker = Worker {
                id,
                share,
                offset,
                queue: queue.clone(),
                kind: plan.kind,
                persistent: self.load.persistent,
                pause_every: self.load.pause_every,
                pause: self.load.worker_pause,
                transport: self.transport.clone(),
                stats: stats.clone(),
                stop: self.stop.clone(),
            };
            offset += share as u64;
            handles.push(tokio::spawn(worker.run()));
        }
        for (id, (joined, share)) in join_all(handles).await.into_iter().zip(shares).enumerate() {
            match joined {
                Ok(tally) => {
                    stats.add_sent(tally.sent);
                    stats.add_errors(tally.errors);
                }
                Err(e) => {
                    error!(worker = id, share, error = %e, "Worker task failed");
                    stats.add_errors(share as u64);
                }
            }
        }
        stats.mark_finished();
        stats.snapshot()
    }

    async fn run_pooled(
        &self,
        plan: &RunPlan,
        batch_size: usize,
        inter_batch_delay: Duration,
    ) -> RunSnapshot {
        let stats = Arc::new(RunStatistics::new());
        let batch_size = batch_size.max(1);
        let max_retries = self.load.max_retries;
        let mut factory = MessageFactory::new(plan.kind);

        stats.mark_started();
        let mut dispatched = 0usize;
        while dispatched < plan.total {
            if self.stop.is_stopped() {
                info!(dispatched, total = plan.total, "Stop requested, skipping remaining batches");
                break;
            }
            let len = batch_size.min(plan.total - dispatched);
            let slots = Arc::new(Semaphore::new(len.min(MAX_BATCH_IN_FLIGHT)));
            let tasks: Vec<_> = (0..len)
                .map(|i| {
                    let message = factory.build((dispatched + i) as u64);
                    let executor = self.executor.clone();
                    let stats = stats.clone();
                    let slots = slots.clone();
                    let queue = plan.queue.clone();
                    tokio::spawn(async move {
                        let _slot = slots.acquire_owned().await;
                        executor.publish(&queue, &message, max_retries, &stats).await
                    })
                })
                .collect();
            for joined in join_all(tasks).await {
                if let Err(e) = joined {
                    error!(error = %e, "Publish task failed");
                    stats.record_error();
                }
            }

            let before = dispatched;
            dispatched += len;
            if dispatched / PROGRESS_EVERY > before / PROGRESS_EVERY {
                info!(
                    dispatched,
                    total = plan.total,
                    sent = stats.sent_count(),
                    errors = stats.error_count(),
                    "Progress"
                );
            }
            if dispatched < plan.total && !inter_batch_delay.is_zero() {
                tokio::time::sleep(inter_batch_delay).await;
            }
        }
        stats.mark_finished();
        stats.snapshot()
    }

    async fn run_sequential(&self, plan: &RunPlan) -> Result<RunSnapshot, SchedulerError> {
        let conn = self.transport.connect().await?;
        if let Err(e) = conn.declare_queue(&plan.queue, self.durable).await {
            let _ = conn.close().await;
            return Err(e.into());
        }
        let stats = RunStatistics::with_latency();
        let mut factory = MessageFactory::new(plan.kind);

        stats.mark_started();
        for i in 0..plan.total {
            if self.stop.is_stopped() {
                info!(completed = i, total = plan.total, "Stop requested, ending latency probe");
                break;
            }
            let body = match serde_json::to_vec(&factory.build(i as u64)) {
                Ok(body) => Bytes::from(body),
                Err(e) => {
                    warn!(error = %e, "Failed to serialize message");
                    stats.record_error();
                    continue;
                }
            };
            let started = Instant::now();
            match conn
                .publish(&plan.queue, body, CONTENT_TYPE_JSON, self.load.persistent)
                .await
            {
                Ok(()) => {
                    stats.record_latency(started.elapsed());
                    stats.record_sent();
                }
                Err(e) => {
                    debug!(error = %e, index = i, "Latency probe publish failed");
                    stats.record_error();
                }
            }
        }
        stats.mark_finished();
        let _ = conn.close().await;
        Ok(stats.snapshot())
    }
}

/// What one worker got through. Merged into the run only after it joins.
#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    sent: u64,
    errors: u64,
}

/// One dedicated-connection publisher in worker mode.
struct Worker {
    id: usize,
    share: usize,
    offset: u64,
    queue: Arc<str>,
    kind: MessageKind,
    persistent: bool,
    pause_every: usize,
    pause: Duration,
    transport: Arc<dyn Transport>,
    stats: Arc<RunStatistics>,
    stop: Arc<StopSignal>,
}

impl Worker {
    async fn run(self) -> WorkerTally {
        if self.share == 0 {
            return WorkerTally::default();
        }
        let conn = match self.transport.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(worker = self.id, share = self.share, error = %e, "Worker could not connect");
                self.stats.record_connection_error();
                return WorkerTally {
                    sent: 0,
                    errors: self.share as u64,
                };
            }
        };

        let mut factory = MessageFactory::new(self.kind);
        let (mut sent, mut errors) = (0u64, 0u64);
        for i in 0..self.share {
            if self.stop.is_stopped() {
                debug!(worker = self.id, completed = i, "Worker stopping early");
                break;
            }
            match serde_json::to_vec(&factory.build(self.offset + i as u64)) {
                Ok(body) => match conn
                    .publish(&self.queue, Bytes::from(body), CONTENT_TYPE_JSON, self.persistent)
                    .await
                {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        debug!(worker = self.id, error = %e, "Worker publish failed");
                        errors += 1;
                    }
                },
                Err(e) => {
                    warn!(worker = self.id, error = %e, "Failed to serialize message");
                    errors += 1;
                }
            }
            if self.pause_every > 0 && (i + 1) % self.pause_every == 0 {
                tokio::time::sleep(self.pause).await;
            }
        }

        if let Err(e) = conn.close().await {
            debug!(worker = self.id, error = %e, "Error closing worker connection");
        }
        debug!(worker = self.id, sent, errors, "Worker finished");
        WorkerTally { sent, errors }
    }
}
