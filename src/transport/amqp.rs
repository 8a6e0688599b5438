//! AMQP 0-9-1 (RabbitMQ) adapter using lapin.
//!
//! Messages go through the default exchange with the queue name as routing
//! key. Each `AmqpConnection` owns one TCP session and one channel.
use crate::config::BrokerConfig;
use crate::transport::{Connection, ConnectionId, Transport, TransportError};
use bytes::Bytes;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions, QueuePurgeOptions},
    types::FieldTable,
    BasicProperties, Channel, ConnectionProperties,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Clone)]
pub struct AmqpTransport {
    url: String,
    endpoint: String,
    confirms: bool,
}

impl AmqpTransport {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            url: config.amqp_url(),
            endpoint: config.endpoint(),
            confirms: config.publisher_confirms,
        }
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let conn = lapin::Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if self.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        }
        let id = ConnectionId::next();
        debug!(%id, endpoint = %self.endpoint, "AMQP connection established");
        Ok(Box::new(AmqpConnection {
            id,
            channel,
            conn,
            confirms: self.confirms,
            closed: AtomicBool::new(false),
        }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

struct AmqpConnection {
    id: ConnectionId,
    channel: Channel,
    conn: lapin::Connection,
    confirms: bool,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Connection for AmqpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.conn.status().connected()
            && self.channel.status().connected()
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Declare(e.to_string()))?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: Bytes,
        content_type: &str,
        persistent: bool,
    ) -> Result<(), TransportError> {
        let properties = BasicProperties::default()
            .with_content_type(content_type.to_string().into())
            .with_delivery_mode(if persistent {
                DELIVERY_MODE_PERSISTENT
            } else {
                DELIVERY_MODE_TRANSIENT
            });
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body.as_ref(),
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        if self.confirms {
            let confirmation = confirm
                .await
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            if confirmation.is_nack() {
                return Err(TransportError::Publish("broker nacked message".into()));
            }
        }
        Ok(())
    }

    async fn queue_depth(&self, name: &str) -> Result<u32, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Query(e.to_string()))?;
        Ok(queue.message_count())
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, TransportError> {
        self.channel
            .queue_purge(name, QueuePurgeOptions::default())
            .await
            .map_err(|e| TransportError::Query(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.conn.status().connected() {
            return Ok(());
        }
        self.conn
            .close(200, "OK")
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}
