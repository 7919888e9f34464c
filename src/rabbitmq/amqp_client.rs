// src/rabbitmq/amqp_client.rs

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::TransportError;
use super::transport::{
    BrokerAddress, Connector, Delivery, DeliveryStream, Link, QueueOptions, Session,
};

const PERSISTENT: u8 = 2;

/// Opens real AMQP sessions through lapin.
#[derive(Debug, Default, Clone)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, address: &BrokerAddress) -> Result<Link, TransportError> {
        debug!(address = %address, "Opening AMQP connection");

        let connection = Connection::connect(&address.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(200, "Channel creation failed").await;
                return Err(TransportError::ChannelClosed(format!(
                    "failed to open channel: {}",
                    e
                )));
            }
        };

        // Either the connection or the channel failing counts as a closure; first one wins.
        let (tx, closed) = oneshot::channel();
        let notify = Arc::new(Mutex::new(Some(tx)));

        let on_connection_error = Arc::clone(&notify);
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            fire(&on_connection_error, err.into());
        });

        let on_channel_error = Arc::clone(&notify);
        channel.on_error(move |err| {
            warn!(error = %err, "AMQP channel error");
            fire(&on_channel_error, err.into());
        });

        Ok(Link {
            session: Arc::new(AmqpSession {
                connection,
                channel,
            }),
            closed,
        })
    }
}

fn fire(slot: &Mutex<Option<oneshot::Sender<TransportError>>>, error: TransportError) {
    if let Ok(mut guard) = slot.lock() {
        if let Some(tx) = guard.take() {
            let _ = tx.send(error);
        }
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        args: FieldTable,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("text/plain".into());

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await?
            .await?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, TransportError> {
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(queue, consumer_tag = %consumer_tag, "Subscribed to queue");

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| Delivery {
                        delivery_tag: d.delivery_tag,
                        body: d.data,
                    })
                    .map_err(TransportError::from)
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "Closing channel")
                .await
                .map_err(|e| TransportError::ChannelClosed(format!("failed to close channel: {}", e)))?;
        }
        self.connection
            .close(200, "Closing connection")
            .await
            .map_err(|e| TransportError::Protocol(format!("failed to close connection: {}", e)))?;
        Ok(())
    }
}
