//! End-to-end runs against the in-process mock broker.
//!
//! These cover the scheduler modes, failure accounting, cancellation and the
//! benchmark driver with its report.

#![cfg(feature = "transport-mock")]

use mq_loadgen::config::{
    DriverConfig, LoadConfig, CHECKOUT_QUEUE, PAYMENT_RESULT_QUEUE, PIPELINE_QUEUES,
};
use mq_loadgen::driver::{BenchmarkDriver, DriverState, RunStatus, Scenario, StressLevel};
use mq_loadgen::output::OutputWriter;
use mq_loadgen::pool::ConnectionPool;
use mq_loadgen::publish::PublishExecutor;
use mq_loadgen::scheduler::{LoadScheduler, RunPlan, ScheduleMode};
use mq_loadgen::transport::mock::{MockBroker, MockTransport};
use mq_loadgen::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

fn fast_load() -> LoadConfig {
    LoadConfig {
        inter_batch_delay: Duration::ZERO,
        retry_base_delay: Duration::from_millis(1),
        acquire_timeout: Duration::from_secs(2),
        worker_pause: Duration::from_millis(1),
        ..LoadConfig::default()
    }
}

async fn scheduler_with(
    broker: &MockBroker,
    pool_size: usize,
    load: LoadConfig,
) -> (Arc<LoadScheduler>, Arc<PublishExecutor>) {
    let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(broker.clone()));
    let pool = ConnectionPool::initialize(transport.clone(), pool_size).await;
    let executor = Arc::new(PublishExecutor::new(pool, &load, false));
    let scheduler = LoadScheduler::new(transport, executor.clone(), load, false);
    (Arc::new(scheduler), executor)
}

async fn driver_with(broker: &MockBroker, pool_size: usize) -> BenchmarkDriver {
    let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(broker.clone()));
    let load = fast_load();
    let pool = ConnectionPool::initialize(transport.clone(), pool_size).await;
    let executor = Arc::new(PublishExecutor::new(pool, &load, false));
    let scheduler = LoadScheduler::new(transport, executor, load, false);
    BenchmarkDriver::new(scheduler, DriverConfig::default().without_cooldowns())
}

fn pooled(total: usize) -> RunPlan {
    RunPlan::new(
        CHECKOUT_QUEUE,
        total,
        ScheduleMode::Pooled {
            batch_size: 10,
            inter_batch_delay: Duration::ZERO,
        },
    )
}

// ============================================================================
// Scheduler modes
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_connection_pool_delivers_everything_without_sharing() {
    let broker = MockBroker::new();
    broker.set_publish_delay(Duration::from_micros(200));
    let (scheduler, executor) = scheduler_with(&broker, 1, fast_load()).await;

    let snap = scheduler.run(&pooled(100)).await.expect("run");

    assert_eq!(snap.sent, 100);
    assert_eq!(snap.errors, 0);
    assert_eq!(broker.concurrent_use(), 0, "a connection was used concurrently");
    assert_eq!(broker.depth(CHECKOUT_QUEUE), Some(100));
    assert_eq!(executor.pool().status().lent_out, 0);
    assert!(snap.rate > 0.0);
}

#[tokio::test]
async fn more_workers_than_messages_is_not_an_error() {
    let broker = MockBroker::new();
    let (scheduler, _executor) = scheduler_with(&broker, 2, fast_load()).await;
    let opened_before = broker.connections_opened();

    let plan = RunPlan::new(CHECKOUT_QUEUE, 3, ScheduleMode::Workers { workers: 5 });
    let snap = scheduler.run(&plan).await.expect("run");

    assert_eq!(snap.sent, 3);
    assert_eq!(snap.errors, 0);
    assert_eq!(snap.connection_errors, 0);
    // One setup connection plus one per worker with a non-empty share.
    assert_eq!(broker.connections_opened() - opened_before, 4);
    assert_eq!(broker.connections_closed(), 4);
}

#[tokio::test]
async fn worker_mode_spreads_messages_evenly() {
    let broker = MockBroker::new();
    let (scheduler, _executor) = scheduler_with(&broker, 1, fast_load()).await;

    let plan = RunPlan::new(CHECKOUT_QUEUE, 120, ScheduleMode::Workers { workers: 3 });
    let snap = scheduler.run(&plan).await.expect("run");

    assert_eq!(snap.sent, 120);
    assert_eq!(broker.depth(CHECKOUT_QUEUE), Some(120));
    assert!(snap.duration_secs > 0.0);
}

#[tokio::test]
async fn failing_broker_reports_every_message_as_error() {
    let broker = MockBroker::new();
    let load = LoadConfig {
        max_retries: 1,
        ..fast_load()
    };
    let (scheduler, executor) = scheduler_with(&broker, 2, load).await;
    broker.fail_all_publishes(true);

    let snap = scheduler.run(&pooled(20)).await.expect("pooled run");
    assert_eq!(snap.sent, 0);
    assert_eq!(snap.errors, 20);
    assert_eq!(snap.retries, 20);
    assert_eq!(executor.pool().status().lent_out, 0);

    let plan = RunPlan::new(CHECKOUT_QUEUE, 30, ScheduleMode::Workers { workers: 4 });
    let snap = scheduler.run(&plan).await.expect("worker run");
    assert_eq!(snap.sent, 0);
    assert_eq!(snap.errors, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broker_restart_mid_run_is_absorbed() {
    let broker = MockBroker::new();
    broker.set_publish_delay(Duration::from_micros(200));
    let (scheduler, executor) = scheduler_with(&broker, 2, fast_load()).await;

    let run = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(&pooled(200)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.drop_all_connections();
    let snap = run.await.expect("join").expect("run");

    assert_eq!(snap.sent + snap.errors, 200);
    let status = executor.pool().status();
    assert_eq!(status.lent_out, 0);
    assert!(status.available + status.lent_out <= status.capacity + status.replacements);
    let conn = executor
        .pool()
        .acquire(Duration::from_millis(50))
        .await
        .expect("acquire after restart");
    assert!(conn.is_open());
    conn.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_stops_dispatch_and_reclaims_connections() {
    let broker = MockBroker::new();
    broker.set_publish_delay(Duration::from_millis(5));
    let (scheduler, executor) = scheduler_with(&broker, 2, fast_load()).await;

    let run = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(&pooled(500)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.stop_signal().stop();
    let snap = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run ends promptly after stop")
        .expect("join")
        .expect("run");

    assert!(snap.sent + snap.errors < 500);
    assert!(snap.sent > 0);
    let status = executor.pool().status();
    assert_eq!(status.lent_out, 0);
    assert_eq!(status.available, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pooled_batch_keeps_at_most_five_in_flight() {
    let broker = MockBroker::new();
    broker.set_publish_delay(Duration::from_millis(2));
    let (scheduler, executor) = scheduler_with(&broker, 10, fast_load()).await;

    let plan = RunPlan::new(
        CHECKOUT_QUEUE,
        60,
        ScheduleMode::Pooled {
            batch_size: 20,
            inter_batch_delay: Duration::ZERO,
        },
    );
    let snap = scheduler.run(&plan).await.expect("run");

    assert_eq!(snap.sent, 60);
    assert!(broker.peak_in_flight() >= 1);
    assert!(
        broker.peak_in_flight() <= 5,
        "peak in flight was {}",
        broker.peak_in_flight()
    );
    assert_eq!(broker.in_flight(), 0);
    assert_eq!(executor.pool().status().lent_out, 0);
}

// ============================================================================
// Benchmark driver
// ============================================================================

#[tokio::test]
async fn throughput_scenario_purges_between_runs() {
    let broker = MockBroker::new();
    let mut driver = driver_with(&broker, 2).await;
    driver.prepare().await.expect("prepare");

    let rows = driver.throughput(&[5, 10]).await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == RunStatus::Completed));
    assert_eq!(rows[0].snapshot.sent, 5);
    assert_eq!(rows[1].snapshot.sent, 10);
    assert_eq!(rows[1].batch_size, Some(10));

    assert_eq!(broker.depth(CHECKOUT_QUEUE), Some(10));
    assert_eq!(driver.state(), DriverState::Idle);
}

#[tokio::test]
async fn stress_scenario_records_queue_depth() {
    let broker = MockBroker::new();
    let mut driver = driver_with(&broker, 1).await;

    let levels = vec![StressLevel::new("Small", 6, 2), StressLevel::new("Wide", 4, 3)];
    let rows = driver.stress(&levels).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].queue_depth_after, Some(6));
    assert_eq!(rows[1].queue_depth_after, Some(10));
    assert_eq!(rows[1].workers, Some(3));
    assert_eq!(rows[1].label, "Wide");
}

#[tokio::test]
async fn setup_failure_is_recorded_as_failed_run() {
    let broker = MockBroker::new();
    let mut driver = driver_with(&broker, 2).await;
    broker.refuse_connections(true);

    let rows = driver.concurrency(10, &[2]).await;
    assert_eq!(rows.len(), 1);
    assert!(matches!(rows[0].status, RunStatus::Failed { .. }));
    assert_eq!(rows[0].snapshot.sent, 0);
    assert_eq!(rows[0].snapshot.errors, 10);
    assert_eq!(driver.state(), DriverState::Idle);
}

#[tokio::test]
async fn stopped_driver_skips_remaining_runs() {
    let broker = MockBroker::new();
    let mut driver = driver_with(&broker, 1).await;
    driver.stop_signal().stop();

    let rows = driver.concurrency(10, &[1, 2]).await;
    assert!(rows.is_empty());
    assert_eq!(broker.publish_attempts(), 0);
}

#[tokio::test]
async fn stop_interrupts_cooldown() {
    let broker = MockBroker::new();
    let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(broker.clone()));
    let load = fast_load();
    let pool = ConnectionPool::initialize(transport.clone(), 1).await;
    let executor = Arc::new(PublishExecutor::new(pool, &load, false));
    let scheduler = LoadScheduler::new(transport, executor, load, false);
    let config = DriverConfig {
        throughput_cooldown: Duration::from_secs(60),
        ..DriverConfig::default()
    };
    let mut driver = BenchmarkDriver::new(scheduler, config);
    let stop = driver.stop_signal();

    let run = tokio::spawn(async move {
        driver.throughput(&[5, 5]).await;
        driver
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop.stop();
    let driver = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cooldown interrupted")
        .expect("join");

    assert_eq!(driver.results().len(), 1);
    assert_eq!(driver.results()[0].status, RunStatus::Completed);
}

#[tokio::test]
async fn latency_scenario_feeds_summary_and_report() {
    let broker = MockBroker::new();
    let mut driver = driver_with(&broker, 1).await;

    driver.throughput(&[10]).await;
    let rows = driver.latency(10).await;
    let latency = rows[0].snapshot.latency.clone().expect("latency samples");
    assert_eq!(latency.samples, 10);
    assert!(latency.p95_ms >= latency.min_ms);

    let summary = driver.summary();
    assert_eq!(summary.best_throughput_messages, Some(10));
    assert!(summary.mean_latency_ms.is_some());
    assert!(summary.best_concurrency_rate.is_none());

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("report.json");
    let mut out = OutputWriter::new_json(&path).await.expect("create");
    out.write_report(driver.results()).await.expect("write");
    drop(out);

    let v: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
    assert_eq!(v["throughput"].as_array().map(Vec::len), Some(1));
    assert_eq!(v["latency"][0]["latency"]["samples"], 10);
    assert_eq!(v["latency"][0]["scenario"], Scenario::Latency.name());
    assert!(v["latency"][0]["timestamp"].is_string());
    assert!(v["latency"][0]["started_at"].is_string());
    assert!(v["latency"][0]["finished_at"].is_string());
}

#[tokio::test]
async fn monitor_samples_known_and_unknown_queues() {
    let broker = MockBroker::new();
    let driver = driver_with(&broker, 1).await;
    driver.prepare().await.expect("prepare");

    let queues = vec![CHECKOUT_QUEUE.to_string(), "missing".to_string()];
    let samples = driver
        .monitor(&queues, Duration::ZERO, Duration::from_millis(10))
        .await
        .expect("monitor");
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].depths[0], (CHECKOUT_QUEUE.to_string(), Some(0)));
    assert_eq!(samples[0].depths[1], ("missing".to_string(), None));
}

#[tokio::test]
async fn purge_empties_queues_and_tolerates_missing_ones() {
    let broker = MockBroker::new();
    let mut driver = driver_with(&broker, 1).await;
    driver.prepare().await.expect("prepare");
    driver.load(CHECKOUT_QUEUE, 7, 5, Duration::ZERO).await;
    assert_eq!(broker.depth(CHECKOUT_QUEUE), Some(7));

    let queues = vec![CHECKOUT_QUEUE.to_string(), "missing".to_string()];
    let purged = driver.purge_queues(&queues).await.expect("purge");
    assert_eq!(purged[0], (CHECKOUT_QUEUE.to_string(), Some(7)));
    assert_eq!(purged[1], ("missing".to_string(), None));
    assert_eq!(broker.depth(CHECKOUT_QUEUE), Some(0));
}

#[tokio::test]
async fn status_reads_depths_once() {
    let broker = MockBroker::new();
    let mut driver = driver_with(&broker, 1).await;
    driver.prepare().await.expect("prepare");
    driver.load(PAYMENT_RESULT_QUEUE, 4, 2, Duration::ZERO).await;

    let queues: Vec<String> = PIPELINE_QUEUES.iter().map(|q| q.to_string()).collect();
    let sample = driver.queue_status(&queues).await.expect("status");
    assert_eq!(sample.depths.len(), 3);
    assert_eq!(sample.depths[0], (CHECKOUT_QUEUE.to_string(), Some(0)));
    assert_eq!(sample.depths[2], (PAYMENT_RESULT_QUEUE.to_string(), Some(4)));
}

#[tokio::test]
async fn purge_and_status_need_a_reachable_broker() {
    let broker = MockBroker::new();
    let driver = driver_with(&broker, 1).await;
    broker.refuse_connections(true);
    let queues = vec![CHECKOUT_QUEUE.to_string()];
    assert!(driver.purge_queues(&queues).await.is_err());
    assert!(driver.queue_status(&queues).await.is_err());
}
