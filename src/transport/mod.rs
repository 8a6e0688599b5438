//! Transport abstraction: connector and connection traits, error type and builder.

#[cfg(feature = "transport-amqp-0-9")]
pub mod amqp;
pub mod config;
#[cfg(any(test, feature = "transport-mock"))]
pub mod mock;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::config::BrokerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Amqp,
    #[cfg(any(test, feature = "transport-mock"))]
    Mock,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("declare: {0}")]
    Declare(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("query: {0}")]
    Query(String),
    #[error("disconnected")]
    Disconnected,
    #[error("other: {0}")]
    Other(String),
}

/// Opaque per-process connection identity, used for logging and pool bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Factory for broker sessions. One `Transport` is shared by the pool and by
/// every worker that needs a dedicated connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
    /// Human-readable endpoint for logs (never includes credentials).
    fn endpoint(&self) -> String;
}

/// A single broker session. Callers must hold it exclusively while publishing;
/// it may become invalid at any time and reports that through `is_open`.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;
    fn is_open(&self) -> bool;
    /// Declaring an existing queue with matching properties succeeds.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), TransportError>;
    async fn publish(
        &self,
        queue: &str,
        body: Bytes,
        content_type: &str,
        persistent: bool,
    ) -> Result<(), TransportError>;
    async fn queue_depth(&self, name: &str) -> Result<u32, TransportError>;
    /// Drops every ready message in the queue, returning how many were removed.
    async fn purge_queue(&self, name: &str) -> Result<u32, TransportError>;
    /// Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .finish()
    }
}

pub struct TransportBuilder;

impl TransportBuilder {
    pub fn build(
        engine: Engine,
        config: &BrokerConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        match engine {
            Engine::Amqp => {
                #[cfg(feature = "transport-amqp-0-9")]
                {
                    Ok(Arc::new(crate::transport::amqp::AmqpTransport::new(config)))
                }
                #[cfg(not(feature = "transport-amqp-0-9"))]
                {
                    let _ = config;
                    Err(TransportError::Connect("amqp feature disabled".into()))
                }
            }
            #[cfg(any(test, feature = "transport-mock"))]
            Engine::Mock => {
                let _ = config;
                Ok(Arc::new(crate::transport::mock::MockTransport::shared()))
            }
        }
    }
}
