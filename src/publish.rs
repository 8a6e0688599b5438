//! Admission-controlled, retrying publisher on top of the connection pool.

use crate::config::LoadConfig;
use crate::metrics::stats::RunStatistics;
use crate::pool::{ConnectionPool, PoolError};
use crate::transport::TransportError;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PublishStatus {
    Sent,
    RetriedThenSent,
    Failed,
}

/// One message ready to go out.
#[derive(Debug, Clone)]
pub struct PublishTask {
    pub queue: String,
    pub body: Bytes,
    pub max_retries: u32,
    pub correlation_id: Uuid,
}

impl PublishTask {
    pub fn json<T: Serialize + ?Sized>(
        queue: &str,
        payload: &T,
        max_retries: u32,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            queue: queue.to_string(),
            body: Bytes::from(serde_json::to_vec(payload)?),
            max_retries,
            correlation_id: Uuid::new_v4(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome {
    pub status: PublishStatus,
    pub attempts: u32,
    pub elapsed: Duration,
    pub correlation_id: Uuid,
}

impl PublishOutcome {
    pub fn success(&self) -> bool {
        self.status != PublishStatus::Failed
    }
}

#[derive(thiserror::Error, Debug)]
enum AttemptError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Publishes through pooled connections with a global in-flight ceiling and
/// linear backoff between attempts. Failures never escape as errors; they
/// are folded into the outcome and the run's counters.
pub struct PublishExecutor {
    pool: ConnectionPool,
    permits: Arc<Semaphore>,
    base_delay: Duration,
    acquire_timeout: Duration,
    durable: bool,
    persistent: bool,
}

impl PublishExecutor {
    pub fn new(pool: ConnectionPool, load: &LoadConfig, durable: bool) -> Self {
        Self {
            pool,
            permits: Arc::new(Semaphore::new(load.rate_limit.max(1))),
            base_delay: load.retry_base_delay,
            acquire_timeout: load.acquire_timeout,
            durable,
            persistent: load.persistent,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Serializes `payload` as JSON and publishes it with up to `max_retries`
    /// extra attempts.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        max_retries: u32,
        stats: &RunStatistics,
    ) -> PublishOutcome {
        match PublishTask::json(queue, payload, max_retries) {
            Ok(task) => self.execute(task, stats).await,
            Err(e) => {
                warn!(queue, error = %e, "Failed to serialize message");
                stats.record_error();
                PublishOutcome {
                    status: PublishStatus::Failed,
                    attempts: 0,
                    elapsed: Duration::ZERO,
                    correlation_id: Uuid::nil(),
                }
            }
        }
    }

    pub async fn execute(&self, task: PublishTask, stats: &RunStatistics) -> PublishOutcome {
        let started = Instant::now();
        let outcome = |status, attempts| PublishOutcome {
            status,
            attempts,
            elapsed: started.elapsed(),
            correlation_id: task.correlation_id,
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                stats.record_error();
                return outcome(PublishStatus::Failed, 0);
            }
        };

        let mut attempts = 0;
        for attempt in 0..=task.max_retries {
            attempts += 1;
            match self.attempt(&task, stats).await {
                Ok(()) => {
                    stats.record_sent();
                    let status = if attempt == 0 {
                        PublishStatus::Sent
                    } else {
                        PublishStatus::RetriedThenSent
                    };
                    return outcome(status, attempts);
                }
                Err(e) if attempt < task.max_retries => {
                    stats.record_retry();
                    let backoff = self.base_delay * (attempt + 1);
                    debug!(
                        queue = %task.queue,
                        correlation_id = %task.correlation_id,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!(
                        queue = %task.queue,
                        correlation_id = %task.correlation_id,
                        attempts,
                        error = %e,
                        "Publish failed, retries exhausted"
                    );
                }
            }
        }
        stats.record_error();
        outcome(PublishStatus::Failed, attempts)
    }

    async fn attempt(&self, task: &PublishTask, stats: &RunStatistics) -> Result<(), AttemptError> {
        let conn = match self.pool.acquire(self.acquire_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                stats.record_connection_error();
                return Err(e.into());
            }
        };
        let result = async {
            conn.declare_queue(&task.queue, self.durable).await?;
            conn.publish(
                &task.queue,
                task.body.clone(),
                CONTENT_TYPE_JSON,
                self.persistent,
            )
            .await
        }
        .await;
        conn.release().await;
        result.map_err(AttemptError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockBroker, MockTransport};
    use crate::transport::Transport;
    use std::collections::BTreeMap;

    fn fast_load() -> LoadConfig {
        LoadConfig {
            retry_base_delay: Duration::from_millis(1),
            acquire_timeout: Duration::from_millis(10),
            ..LoadConfig::default()
        }
    }

    async fn executor(broker: &MockBroker, capacity: usize) -> PublishExecutor {
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(broker.clone()));
        let pool = ConnectionPool::initialize(transport, capacity).await;
        PublishExecutor::new(pool, &fast_load(), false)
    }

    #[tokio::test]
    async fn first_attempt_success_is_sent() {
        let broker = MockBroker::new();
        let exec = executor(&broker, 1).await;
        let stats = RunStatistics::new();
        let out = exec.publish("q", &serde_json::json!({"a": 1}), 3, &stats).await;
        assert_eq!(out.status, PublishStatus::Sent);
        assert_eq!(out.attempts, 1);
        assert!(out.success());
        assert_eq!(stats.snapshot().sent, 1);
        assert_eq!(broker.depth("q"), Some(1));
        assert_eq!(exec.pool().status().lent_out, 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let broker = MockBroker::new();
        let exec = executor(&broker, 1).await;
        let stats = RunStatistics::new();
        broker.fail_next_publishes(2);
        let out = exec.publish("q", "hello", 3, &stats).await;
        assert_eq!(out.status, PublishStatus::RetriedThenSent);
        assert_eq!(out.attempts, 3);
        let snap = stats.snapshot();
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test]
    async fn retry_budget_bounds_attempts() {
        let broker = MockBroker::new();
        let exec = executor(&broker, 2).await;
        let stats = RunStatistics::new();
        broker.fail_all_publishes(true);
        let out = exec.publish("q", "hello", 3, &stats).await;
        assert_eq!(out.status, PublishStatus::Failed);
        assert_eq!(out.attempts, 4);
        assert!(!out.success());
        assert_eq!(broker.publish_attempts(), 4);
        let snap = stats.snapshot();
        assert_eq!(snap.sent, 0);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.retries, 3);
        assert_eq!(exec.pool().status().lent_out, 0);
    }

    #[tokio::test]
    async fn unavailable_connections_count_as_connection_errors() {
        let broker = MockBroker::new();
        let exec = executor(&broker, 1).await;
        let held = exec.pool().acquire(Duration::ZERO).await.expect("held");
        broker.refuse_connections(true);
        let stats = RunStatistics::new();
        let out = exec.publish("q", "hello", 1, &stats).await;
        assert_eq!(out.status, PublishStatus::Failed);
        assert_eq!(out.attempts, 2);
        let snap = stats.snapshot();
        assert_eq!(snap.connection_errors, 2);
        assert_eq!(snap.errors, 1);
        held.release().await;
    }

    #[tokio::test]
    async fn serialization_failure_makes_no_attempt() {
        let broker = MockBroker::new();
        let exec = executor(&broker, 1).await;
        let stats = RunStatistics::new();
        // JSON object keys must be strings.
        let mut bad = BTreeMap::new();
        bad.insert(vec![1u8], 1u8);
        let out = exec.publish("q", &bad, 3, &stats).await;
        assert_eq!(out.status, PublishStatus::Failed);
        assert_eq!(out.attempts, 0);
        assert_eq!(stats.snapshot().errors, 1);
        assert_eq!(broker.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn admission_ceiling_bounds_in_flight_publishes() {
        let broker = MockBroker::new();
        broker.set_publish_delay(Duration::from_millis(2));
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(broker.clone()));
        let pool = ConnectionPool::initialize(transport, 5).await;
        let load = LoadConfig {
            rate_limit: 1,
            ..fast_load()
        };
        let exec = PublishExecutor::new(pool, &load, false);
        let stats = RunStatistics::new();

        let ids: Vec<i32> = (0..20).collect();
        let publishes = ids.iter().map(|i| exec.publish("q", i, 0, &stats));
        let outcomes = futures::future::join_all(publishes).await;

        assert!(outcomes.iter().all(PublishOutcome::success));
        assert_eq!(broker.published(), 20);
        assert_eq!(broker.peak_in_flight(), 1);
        assert_eq!(stats.snapshot().sent, 20);
    }

    #[tokio::test]
    async fn correlation_id_survives_into_outcome() {
        let broker = MockBroker::new();
        let exec = executor(&broker, 1).await;
        let stats = RunStatistics::new();
        let task = PublishTask::json("q", &1u32, 0).expect("task");
        let id = task.correlation_id;
        let out = exec.execute(task, &stats).await;
        assert_eq!(out.correlation_id, id);
    }
}
