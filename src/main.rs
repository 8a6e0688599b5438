use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use mq_loadgen::config::{BrokerConfig, DriverConfig, LoadConfig, CHECKOUT_QUEUE, PIPELINE_QUEUES};
use mq_loadgen::driver::{
    BenchmarkDriver, StressLevel, DEFAULT_CONCURRENCY_MESSAGES, DEFAULT_CONCURRENCY_WORKERS,
    DEFAULT_LATENCY_COUNT, DEFAULT_THROUGHPUT_COUNTS,
};
use mq_loadgen::output::{default_report_path, render_tables, OutputWriter};
use mq_loadgen::pool::ConnectionPool;
use mq_loadgen::publish::PublishExecutor;
use mq_loadgen::scheduler::LoadScheduler;
use mq_loadgen::transport::config::{parse_connect_kv, parse_engine};
use mq_loadgen::transport::TransportBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mq-loadgen")]
#[command(about = "Load generator and benchmark harness for the checkout message pipeline")]
struct Cli {
    /// Log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Messaging engine (amqp|mock)
    #[arg(long, default_value = "amqp", global = true)]
    engine: String,

    /// Broker connect options as KEY=VALUE (repeatable)
    #[arg(long, global = true, value_parser = clap::builder::NonEmptyStringValueParser::new())]
    connect: Vec<String>,

    /// Target queue
    #[arg(long, default_value = CHECKOUT_QUEUE, global = true)]
    queue: String,

    /// Connections kept by the pool
    #[arg(long, default_value = "5", global = true)]
    pool_size: usize,

    /// Extra attempts per pooled publish
    #[arg(long, default_value = "3", global = true)]
    max_retries: u32,

    /// Messages per pooled batch
    #[arg(long, default_value = "10", global = true)]
    batch_size: usize,

    /// Pause between pooled batches in milliseconds
    #[arg(long, default_value = "50", global = true)]
    batch_delay_ms: u64,

    /// Ceiling on concurrent pooled publishes
    #[arg(long, default_value = "50", global = true)]
    rate_limit: usize,

    /// Report path, or "-" for stdout (default: benchmark_report_<timestamp>.json)
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    /// Do not write a JSON report
    #[arg(long, global = true)]
    no_report: bool,

    /// Skip the pauses between runs
    #[arg(long, global = true)]
    no_cooldown: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pooled runs of increasing size
    Throughput {
        /// Message counts, one run each
        #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_THROUGHPUT_COUNTS)]
        counts: Vec<usize>,
    },
    /// Fixed message count across worker counts
    Concurrency {
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY_MESSAGES)]
        messages: usize,
        /// Worker counts, one run each
        #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_CONCURRENCY_WORKERS)]
        workers: Vec<usize>,
    },
    /// Heavy worker-mode runs
    Stress {
        /// NAME:MESSAGES:WORKERS (repeatable; default Medium/High/Extreme)
        #[arg(long = "level", value_parser = parse_stress_level)]
        levels: Vec<StressLevel>,
    },
    /// Sequential round-trip probe
    Latency {
        #[arg(long, default_value_t = DEFAULT_LATENCY_COUNT)]
        messages: usize,
    },
    /// Throughput, concurrency, latency and reduced stress
    Suite,
    /// Single pooled run with explicit batching
    Load {
        #[arg(long, default_value_t = 1000)]
        messages: usize,
        #[arg(long, default_value_t = 20)]
        batch_size: usize,
        /// Pause between batches in milliseconds
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,
    },
    /// Empty the pipeline queues
    Purge {
        /// Queues to purge (repeatable)
        #[arg(long = "target", default_values = PIPELINE_QUEUES)]
        queues: Vec<String>,
    },
    /// Print current queue depths once
    Status {
        /// Queues to query (repeatable)
        #[arg(long = "watch", default_values = PIPELINE_QUEUES)]
        queues: Vec<String>,
    },
    /// Poll queue depths
    Monitor {
        /// Queues to watch (repeatable)
        #[arg(long = "watch", default_values = PIPELINE_QUEUES)]
        queues: Vec<String>,
        /// Total monitoring time in seconds
        #[arg(long, default_value_t = 60)]
        duration: u64,
        /// Seconds between samples
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
}

fn parse_stress_level(s: &str) -> Result<StressLevel, String> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [name, messages, workers] => {
            let messages = messages
                .parse()
                .map_err(|_| format!("invalid message count '{}'", messages))?;
            let workers = workers
                .parse()
                .map_err(|_| format!("invalid worker count '{}'", workers))?;
            Ok(StressLevel::new(name, messages, workers))
        }
        _ => Err(format!("expected NAME:MESSAGES:WORKERS, got '{}'", s)),
    }
}

fn load_config(cli: &Cli) -> LoadConfig {
    LoadConfig {
        pool_size: cli.pool_size,
        batch_size: cli.batch_size,
        inter_batch_delay: Duration::from_millis(cli.batch_delay_ms),
        max_retries: cli.max_retries,
        rate_limit: cli.rate_limit,
        ..LoadConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    mq_loadgen::logging::init(&cli.log_level)?;

    let engine =
        parse_engine(&cli.engine).ok_or_else(|| anyhow!("unknown engine '{}'", cli.engine))?;
    let mut broker = BrokerConfig::default();
    broker.apply(&parse_connect_kv(&cli.connect))?;
    let load = load_config(&cli);
    let mut driver_config = DriverConfig {
        queue: cli.queue.clone(),
        ..DriverConfig::default()
    };
    if cli.no_cooldown {
        driver_config = driver_config.without_cooldowns();
    }

    let transport = TransportBuilder::build(engine, &broker)?;
    info!(engine = ?engine, endpoint = %transport.endpoint(), "mq-loadgen starting");

    let pool = ConnectionPool::initialize(transport.clone(), load.pool_size).await;
    let executor = Arc::new(PublishExecutor::new(pool, &load, broker.durable_queues));
    let scheduler = LoadScheduler::new(transport, executor, load, broker.durable_queues);
    let mut driver = BenchmarkDriver::new(scheduler, driver_config);

    let stop = driver.stop_signal();
    let ctrl_c = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, finishing in-flight work");
            stop.stop();
        }
    });

    if let Err(e) = driver.prepare().await {
        warn!(error = %e, "Queue setup incomplete");
    }

    let reported = match cli.command {
        Commands::Throughput { counts } => {
            driver.throughput(&counts).await;
            true
        }
        Commands::Concurrency { messages, workers } => {
            driver.concurrency(messages, &workers).await;
            true
        }
        Commands::Stress { levels } => {
            let levels = if levels.is_empty() {
                StressLevel::defaults()
            } else {
                levels
            };
            driver.stress(&levels).await;
            true
        }
        Commands::Latency { messages } => {
            driver.latency(messages).await;
            true
        }
        Commands::Suite => {
            driver.suite().await;
            true
        }
        Commands::Load {
            messages,
            batch_size,
            delay_ms,
        } => {
            driver
                .load(
                    &cli.queue,
                    messages,
                    batch_size,
                    Duration::from_millis(delay_ms),
                )
                .await;
            true
        }
        Commands::Purge { queues } => {
            let purged = driver.purge_queues(&queues).await?;
            let failed = purged.iter().filter(|(_, n)| n.is_none()).count();
            info!(queues = purged.len(), failed, "Purge finished");
            false
        }
        Commands::Status { queues } => {
            let sample = driver.queue_status(&queues).await?;
            for (queue, depth) in &sample.depths {
                match depth {
                    Some(d) => println!("{:<28} {:>8}", queue, d),
                    None => println!("{:<28} {:>8}", queue, "n/a"),
                }
            }
            false
        }
        Commands::Monitor {
            queues,
            duration,
            interval,
        } => {
            let samples = driver
                .monitor(
                    &queues,
                    Duration::from_secs(duration),
                    Duration::from_secs(interval),
                )
                .await?;
            info!(samples = samples.len(), "Monitoring finished");
            false
        }
    };

    if reported && !driver.results().is_empty() {
        print!("{}", render_tables(driver.results(), &driver.summary()));
        if !cli.no_report {
            let mut out = match cli.report.clone() {
                Some(path) if path.as_os_str() == "-" => OutputWriter::new_stdout(),
                Some(path) => OutputWriter::new_json(path).await?,
                None => OutputWriter::new_json(default_report_path()).await?,
            };
            out.write_report(driver.results()).await?;
            match out.path() {
                Some(path) => {
                    info!(path = %path.display(), runs = driver.results().len(), "Report written")
                }
                None => info!(runs = driver.results().len(), "Report written to stdout"),
            }
        }
    }

    driver.shutdown().await;
    ctrl_c.abort();
    Ok(())
}
