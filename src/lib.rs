//! mq-loadgen library crate: pooled publishing, load scheduling and
//! benchmark scenarios for a queue-backed checkout pipeline.

pub mod config;
pub mod driver;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod payload;
pub mod pool;
pub mod publish;
pub mod scheduler;
pub mod transport;

// Re-exports for the binary and integration tests
pub use config::{BrokerConfig, DriverConfig, LoadConfig};
pub use driver::{BenchmarkDriver, BenchmarkResult, RunStatus, Scenario, StressLevel};
pub use metrics::stats::{RunSnapshot, RunStatistics};
pub use pool::{ConnectionPool, PoolError, PoolStatus};
pub use publish::{PublishExecutor, PublishOutcome, PublishStatus};
pub use scheduler::{LoadScheduler, RunPlan, ScheduleMode, SchedulerError, StopSignal};
pub use transport::config::ConnectOptions;
pub use transport::{Engine, Transport, TransportBuilder, TransportError};
