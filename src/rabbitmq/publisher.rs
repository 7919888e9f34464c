// src/rabbitmq/publisher.rs

use std::sync::Arc;

use async_trait::async_trait;
use lapin::types::FieldTable;
use tracing::debug;

use super::amqp_client::AmqpConnector;
use super::backoff::ReconnectPolicy;
use super::connection::ConnectionManager;
use super::errors::{MqError, Result};
use super::transport::QueueOptions;
use super::{BaseConfig, MessageQueue, Producer};

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub base: BaseConfig,
}

/// Publishes payloads to named queues through the default exchange.
///
/// Nothing is buffered: while the connection is down `publish` fails with
/// `NotConnected` and the caller decides whether to retry.
pub struct RabbitProducer {
    connection: Arc<ConnectionManager>,
}

impl RabbitProducer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Opens a dedicated AMQP connection for publishing.
    pub async fn connect(config: &ProducerConfig, policy: ReconnectPolicy) -> Result<Self> {
        let connection = ConnectionManager::connect(
            "producer",
            Arc::new(AmqpConnector),
            config.base.address(),
            policy,
        )
        .await?;
        Ok(Self::new(connection))
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }
}

#[async_trait]
impl MessageQueue for RabbitProducer {
    fn connected(&self) -> bool {
        self.connection.connected()
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.connection.declare_queue(name, options, args).await
    }

    async fn close(&self) -> Result<()> {
        self.connection.close().await
    }
}

#[async_trait]
impl Producer for RabbitProducer {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let session = self.connection.session()?;
        session
            .publish(queue, body)
            .await
            .map_err(|source| MqError::Publish {
                queue: queue.to_string(),
                source,
            })?;

        debug!(
            parent: self.connection.span(),
            queue,
            bytes = body.len(),
            "Published message"
        );
        Ok(())
    }
}
