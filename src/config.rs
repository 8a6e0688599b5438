//! Configuration surface with documented defaults.
//!
//! Every value has a default so the harness runs against a stock local
//! RabbitMQ without any flags. CLI flags and `--connect KEY=VALUE` pairs
//! override individual fields.

use std::time::Duration;

use crate::transport::config::ConnectOptions;

pub const CHECKOUT_QUEUE: &str = "checkoutqueue";
pub const PAYMENT_PROCESS_QUEUE: &str = "orderpaymentprocessqueue";
pub const PAYMENT_RESULT_QUEUE: &str = "orderpaymentresultqueue";

/// Every queue of the checkout pipeline, in flow order.
pub const PIPELINE_QUEUES: [&str; 3] = [CHECKOUT_QUEUE, PAYMENT_PROCESS_QUEUE, PAYMENT_RESULT_QUEUE];

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("unknown connect key: {0}")]
    UnknownKey(String),
}

/// Broker endpoint and session settings.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Default: `127.0.0.1`
    pub host: String,
    /// Default: 5672
    pub port: u16,
    /// Default: `guest`
    pub username: String,
    /// Default: `guest`
    pub password: String,
    /// Default: `/`
    pub vhost: String,
    /// Full AMQP URI; when set it wins over the individual fields.
    pub url: Option<String>,
    /// Default: 60s
    pub heartbeat: Duration,
    /// Default: 10s
    pub connection_timeout: Duration,
    /// Wait for broker confirms on every publish. Default: off
    pub publisher_confirms: bool,
    /// Declare queues as durable. Default: off
    pub durable_queues: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5672,
            username: "guest".into(),
            password: "guest".into(),
            vhost: "/".into(),
            url: None,
            heartbeat: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(10),
            publisher_confirms: false,
            durable_queues: false,
        }
    }
}

impl BrokerConfig {
    /// Applies `KEY=VALUE` overrides collected from the command line.
    pub fn apply(&mut self, opts: &ConnectOptions) -> Result<(), ConfigError> {
        for (key, value) in &opts.params {
            match key.as_str() {
                "url" => self.url = Some(value.clone()),
                "host" => self.host = value.clone(),
                "port" => self.port = parse_value(key, value)?,
                "user" | "username" => self.username = value.clone(),
                "pass" | "password" => self.password = value.clone(),
                "vhost" => self.vhost = value.clone(),
                "heartbeat" => self.heartbeat = Duration::from_secs(parse_value(key, value)?),
                "timeout" | "connection_timeout" => {
                    self.connection_timeout = Duration::from_millis(parse_value(key, value)?)
                }
                "confirms" => self.publisher_confirms = parse_flag(key, value)?,
                "durable" => self.durable_queues = parse_flag(key, value)?,
                _ => return Err(ConfigError::UnknownKey(key.clone())),
            }
        }
        Ok(())
    }

    /// AMQP URI for this configuration. The vhost is percent-encoded and the
    /// heartbeat/timeout travel as URI query parameters.
    pub fn amqp_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let vhost = self.vhost.replace('%', "%25").replace('/', "%2f");
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            self.username,
            self.password,
            self.host,
            self.port,
            vhost,
            self.heartbeat.as_secs(),
            self.connection_timeout.as_millis()
        )
    }

    /// Endpoint without credentials, for logs.
    pub fn endpoint(&self) -> String {
        match &self.url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, rest)) => format!("amqp://{}", rest),
                None => url.clone(),
            },
            None => format!("{}:{}{}", self.host, self.port, self.vhost),
        }
    }
}

/// Publisher-side load shaping.
#[derive(Clone, Debug)]
pub struct LoadConfig {
    /// Connections kept by the pool. Default: 5
    pub pool_size: usize,
    /// Messages per pooled batch. Default: 10
    pub batch_size: usize,
    /// Pause between pooled batches. Default: 50ms
    pub inter_batch_delay: Duration,
    /// Extra attempts after the first failed publish. Default: 3
    pub max_retries: u32,
    /// Backoff unit; attempt `n` waits `retry_base_delay * (n + 1)`. Default: 100ms
    pub retry_base_delay: Duration,
    /// Ceiling on concurrent in-flight pooled publishes. Default: 50
    pub rate_limit: usize,
    /// Longest wait for an idle pooled connection. Default: 30s
    pub acquire_timeout: Duration,
    /// Dedicated-connection workers pause every this many messages. Default: 50
    pub pause_every: usize,
    /// Length of that pause. Default: 10ms
    pub worker_pause: Duration,
    /// Publish with persistent delivery (delivery mode 2). Default: on
    pub persistent: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            batch_size: 10,
            inter_batch_delay: Duration::from_millis(50),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            rate_limit: 50,
            acquire_timeout: Duration::from_secs(30),
            pause_every: 50,
            worker_pause: Duration::from_millis(10),
            persistent: true,
        }
    }
}

/// Scenario pacing for the benchmark driver.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Target queue for every scenario. Default: `checkoutqueue`
    pub queue: String,
    /// Queues declared before a run. Default: the three pipeline queues
    pub setup_queues: Vec<String>,
    /// Default: 2s
    pub throughput_cooldown: Duration,
    /// Default: 3s
    pub concurrency_cooldown: Duration,
    /// Default: 5s
    pub stress_cooldown: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            queue: CHECKOUT_QUEUE.into(),
            setup_queues: PIPELINE_QUEUES.iter().map(|q| q.to_string()).collect(),
            throughput_cooldown: Duration::from_secs(2),
            concurrency_cooldown: Duration::from_secs(3),
            stress_cooldown: Duration::from_secs(5),
        }
    }
}

impl DriverConfig {
    /// Same queues, no pauses between runs.
    pub fn without_cooldowns(mut self) -> Self {
        self.throughput_cooldown = Duration::ZERO;
        self.concurrency_cooldown = Duration::ZERO;
        self.stress_cooldown = Duration::ZERO;
        self
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
