// src/rabbitmq/mod.rs
// RabbitMQ clients: connection supervision, producer and consumer roles

use async_trait::async_trait;
use lapin::types::FieldTable;

// RabbitMQ-specific errors
pub mod errors;
pub mod connection;
pub mod memory;

mod amqp_client;
mod backoff;
mod consumer;
mod message;
mod publisher;
mod transport;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::AmqpConnector;
pub use backoff::{Backoff, ReconnectPolicy};
pub use connection::{ConnectionManager, Reconnected};
pub use consumer::{ConsumerConfig, RabbitConsumer};
pub use errors::{MqError, Result, TransportError};
pub use memory::{MemoryBroker, Settlement};
pub use message::{Deliveries, DeliveryId, Message};
pub use publisher::{ProducerConfig, RabbitProducer};
pub use transport::{
    BrokerAddress, Connector, Delivery, DeliveryStream, Link, QueueOptions, Session,
};

/// Connection settings shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl BaseConfig {
    pub fn address(&self) -> BrokerAddress {
        BrokerAddress::new(&self.host, self.port, &self.username, &self.password)
    }
}

/// Operations both roles support.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn connected(&self) -> bool;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        args: FieldTable,
    ) -> Result<()>;

    /// Releases channel and connection. A second call fails with `AlreadyClosed`.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Producer: MessageQueue {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;
}

#[async_trait]
pub trait Consumer: MessageQueue {
    /// Starts delivering messages from `queue` until the consumer is closed.
    async fn consume(&self, queue: &str) -> Result<Deliveries>;

    /// Settles `id` on the channel it arrived on. Ids from before a reconnect
    /// fail with `StaleDelivery` and are never forwarded to the new channel.
    async fn ack(&self, id: DeliveryId, multiple: bool) -> Result<()>;

    async fn nack(&self, id: DeliveryId, multiple: bool, requeue: bool) -> Result<()>;

    async fn reject(&self, id: DeliveryId, requeue: bool) -> Result<()>;
}
