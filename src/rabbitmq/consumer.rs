// src/rabbitmq/consumer.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::types::FieldTable;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn, Instrument};

use super::amqp_client::AmqpConnector;
use super::backoff::{Backoff, ReconnectPolicy};
use super::connection::{stopped, ConnectionManager, Reconnected};
use super::errors::{MqError, Result, TransportError};
use super::message::{Deliveries, DeliveryId, Message};
use super::transport::{Delivery, DeliveryStream, QueueOptions, Session};
use super::{BaseConfig, Consumer, MessageQueue};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub base: BaseConfig,
    /// Unacknowledged deliveries the broker pushes before pausing (0 = unlimited).
    pub prefetch_count: u16,
}

pub struct RabbitConsumer {
    connection: Arc<ConnectionManager>,
    prefetch_count: u16,
    resubscribe_policy: ReconnectPolicy,
    halt: watch::Sender<bool>,
}

impl RabbitConsumer {
    pub fn new(connection: Arc<ConnectionManager>, prefetch_count: u16) -> Self {
        Self {
            connection,
            prefetch_count,
            resubscribe_policy: ReconnectPolicy {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                ..ReconnectPolicy::default()
            },
            halt: watch::channel(false).0,
        }
    }

    /// Pacing for re-subscription attempts after a reconnect.
    pub fn with_resubscribe_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.resubscribe_policy = policy;
        self
    }

    /// Opens a dedicated AMQP connection for consuming.
    pub async fn connect(config: &ConsumerConfig, policy: ReconnectPolicy) -> Result<Self> {
        let connection = ConnectionManager::connect(
            "consumer",
            Arc::new(AmqpConnector),
            config.base.address(),
            policy,
        )
        .await?;
        Ok(Self::new(connection, config.prefetch_count))
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Ends every delivery stream this consumer exported while keeping the
    /// channel open, so messages already handed out can still be settled.
    /// Deliveries not yet handed out are requeued when the channel closes.
    pub fn stop_consuming(&self) {
        self.halt.send_replace(true);
    }

    /// The live session, provided `id` was delivered on it.
    fn session_for(&self, id: DeliveryId) -> Result<Arc<dyn Session>> {
        let (epoch, session) = self.connection.current()?;
        if id.epoch() != epoch {
            warn!(parent: self.connection.span(), id = %id, epoch, "Refusing to settle a delivery from an earlier channel");
            return Err(MqError::StaleDelivery { id });
        }
        Ok(session)
    }
}

/// An open subscription and the epoch of the channel it lives on.
struct Subscription {
    epoch: u64,
    stream: DeliveryStream,
}

async fn subscribe(
    connection: &ConnectionManager,
    queue: &str,
    prefetch_count: u16,
) -> Result<Subscription> {
    let consume_error = |source: TransportError| MqError::Consume {
        queue: queue.to_string(),
        source,
    };

    let (epoch, session) = connection.current()?;
    session
        .set_prefetch(prefetch_count)
        .await
        .map_err(consume_error)?;
    let stream = session.subscribe(queue).await.map_err(consume_error)?;
    Ok(Subscription { epoch, stream })
}

/// Either the connection closing or `stop_consuming`.
struct Stop {
    shutdown: watch::Receiver<bool>,
    halt: watch::Receiver<bool>,
}

impl Stop {
    async fn requested(&mut self) {
        tokio::select! {
            _ = stopped(&mut self.shutdown) => {}
            _ = stopped(&mut self.halt) => {}
        }
    }
}

enum Event {
    Shutdown,
    Reconnected(Reconnected),
    Delivery(u64, Option<std::result::Result<Delivery, TransportError>>),
}

/// Moves deliveries from the broker subscription onto the exported channel.
struct Translation {
    connection: Arc<ConnectionManager>,
    queue: String,
    prefetch_count: u16,
    backoff: Backoff,
    output: mpsc::Sender<Message>,
}

impl Translation {
    async fn run(
        mut self,
        subscription: Subscription,
        mut reconnects: mpsc::Receiver<Reconnected>,
        mut stop: Stop,
    ) {
        let mut live = Some(subscription);

        loop {
            let event = tokio::select! {
                biased;
                _ = stop.requested() => Event::Shutdown,
                note = reconnects.recv() => match note {
                    Some(note) => Event::Reconnected(note),
                    None => Event::Shutdown,
                },
                (epoch, delivery) = next_delivery(&mut live) => Event::Delivery(epoch, delivery),
            };

            match event {
                Event::Shutdown => break,
                Event::Reconnected(note) => {
                    let subscribed_on = live.as_ref().map(|subscription| subscription.epoch);
                    if let (Some(current), Ok((epoch, _))) = (subscribed_on, self.connection.current()) {
                        if current == epoch {
                            debug!("Already subscribed on the restored channel");
                            continue;
                        }
                    }

                    info!(queue = %self.queue, attempts = note.attempts, "Start to reconsume messages");
                    match self.resubscribe(&mut stop).await {
                        Some(subscription) => live = Some(subscription),
                        None => break,
                    }
                }
                Event::Delivery(epoch, Some(Ok(delivery))) => {
                    let message = Message {
                        id: DeliveryId::new(delivery.delivery_tag, epoch),
                        body: delivery.body,
                    };
                    let forwarded = tokio::select! {
                        biased;
                        _ = stop.requested() => false,
                        sent = self.output.send(message) => sent.is_ok(),
                    };
                    if !forwarded {
                        break;
                    }
                }
                Event::Delivery(_, Some(Err(e))) => {
                    warn!(queue = %self.queue, error = %e, "Subscription failed, waiting for reconnect");
                    live = None;
                }
                Event::Delivery(_, None) => {
                    debug!(queue = %self.queue, "Subscription ended, waiting for reconnect");
                    live = None;
                }
            }
        }

        debug!(queue = %self.queue, "Stopped consuming");
    }

    /// Subscribes again, pacing failed attempts. `None` means stop.
    async fn resubscribe(
        &mut self,
        stop: &mut Stop,
    ) -> Option<Subscription> {
        loop {
            match subscribe(&self.connection, &self.queue, self.prefetch_count).await {
                Ok(subscription) => {
                    self.backoff.reset();
                    return Some(subscription);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        queue = %self.queue,
                        error = %e,
                        "Failed to reconsume messages. Retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = stop.requested() => return None,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// The next delivery with the epoch it arrived on. Pends while unsubscribed.
async fn next_delivery(
    live: &mut Option<Subscription>,
) -> (u64, Option<std::result::Result<Delivery, TransportError>>) {
    match live {
        Some(subscription) => (subscription.epoch, subscription.stream.next().await),
        None => std::future::pending().await,
    }
}

#[async_trait]
impl MessageQueue for RabbitConsumer {
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
impl Consumer for RabbitConsumer {
    async fn consume(&self, queue: &str) -> Result<Deliveries> {
        if !self.connection.connected() {
            return Err(MqError::NotConnected);
        }

        // Registered first so a reconnect racing the subscription is not missed.
        let (reconnect_tx, reconnects) = mpsc::channel(1);
        self.connection.register_reconnect_observer(reconnect_tx);

        let subscription = subscribe(&self.connection, queue, self.prefetch_count).await?;
        info!(parent: self.connection.span(), queue, prefetch = self.prefetch_count, "Started consuming");

        let (output, rx) = mpsc::channel(1);
        let translation = Translation {
            connection: Arc::clone(&self.connection),
            queue: queue.to_string(),
            prefetch_count: self.prefetch_count,
            backoff: self.resubscribe_policy.backoff(),
            output,
        };
        let stop = Stop {
            shutdown: self.connection.shutdown_signal(),
            halt: self.halt.subscribe(),
        };
        tokio::spawn(
            translation
                .run(subscription, reconnects, stop)
                .instrument(self.connection.span().clone()),
        );

        Ok(Deliveries::new(rx))
    }

    async fn ack(&self, id: DeliveryId, multiple: bool) -> Result<()> {
        let session = self.session_for(id)?;
        session
            .ack(id.tag(), multiple)
            .await
            .map_err(|source| MqError::Ack { id, source })
    }

    async fn nack(&self, id: DeliveryId, multiple: bool, requeue: bool) -> Result<()> {
        let session = self.session_for(id)?;
        session
            .nack(id.tag(), multiple, requeue)
            .await
            .map_err(|source| MqError::Nack { id, source })
    }

    async fn reject(&self, id: DeliveryId, requeue: bool) -> Result<()> {
        let session = self.session_for(id)?;
        session
            .reject(id.tag(), requeue)
            .await
            .map_err(|source| MqError::Reject { id, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::MemoryBroker;
    use crate::rabbitmq::transport::{BrokerAddress, Connector};
    use tokio::time::timeout;

    async fn consumer(broker: &MemoryBroker, prefetch: u16) -> RabbitConsumer {
        let connection = ConnectionManager::connect(
            "consumer",
            Arc::new(broker.clone()),
            BrokerAddress::new("memory", 5672, "guest", "guest"),
            ReconnectPolicy::fixed(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        RabbitConsumer::new(connection, prefetch)
            .with_resubscribe_policy(ReconnectPolicy::fixed(Duration::from_millis(10)))
    }

    async fn publish(broker: &MemoryBroker, queue: &str, body: &[u8]) {
        let link = broker
            .connect(&BrokerAddress::new("memory", 5672, "guest", "guest"))
            .await
            .unwrap();
        link.session.publish(queue, body).await.unwrap();
        link.session.close().await.unwrap();
    }

    #[tokio::test]
    async fn resubscribes_after_reconnect() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, 10).await;
        consumer
            .declare_queue("tracks", QueueOptions::durable(), FieldTable::default())
            .await
            .unwrap();
        let deliveries = consumer.consume("tracks").await.unwrap();

        publish(&broker, "tracks", b"before").await;
        let first = deliveries.recv().await.unwrap();
        assert_eq!(first.body, b"before".to_vec());

        broker.sever_connections();

        // The unacknowledged delivery comes back on the new channel.
        let redelivered = timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.body, b"before".to_vec());
        assert_eq!(redelivered.id.tag(), 1);
        assert_ne!(redelivered.id, first.id);

        consumer.ack(redelivered.id, false).await.unwrap();
        publish(&broker, "tracks", b"after").await;
        let next = timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.body, b"after".to_vec());
    }

    #[tokio::test]
    async fn ids_from_before_a_reconnect_are_not_settled_on_the_new_channel() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, 10).await;
        consumer
            .declare_queue("tracks", QueueOptions::durable(), FieldTable::default())
            .await
            .unwrap();
        let deliveries = consumer.consume("tracks").await.unwrap();

        publish(&broker, "tracks", b"x").await;
        publish(&broker, "tracks", b"y").await;
        let x = deliveries.recv().await.unwrap();
        let old_y = deliveries.recv().await.unwrap();
        consumer.ack(x.id, false).await.unwrap();

        broker.sever_connections();
        let new_y = timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(new_y.body, b"y".to_vec());
        publish(&broker, "tracks", b"z").await;
        let z = timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        // Same tag as the stale delivery, different channel.
        assert_eq!(z.id.tag(), old_y.id.tag());

        for stale in [
            consumer.ack(old_y.id, false).await,
            consumer.nack(old_y.id, false, true).await,
            consumer.reject(old_y.id, false).await,
        ] {
            assert!(matches!(stale, Err(MqError::StaleDelivery { id }) if id == old_y.id));
        }
        assert_eq!(broker.settlements().len(), 1);

        consumer.ack(new_y.id, false).await.unwrap();
        consumer.ack(z.id, false).await.unwrap();
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn failed_resubscriptions_are_retried() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, 10).await;
        consumer
            .declare_queue("tracks", QueueOptions::default(), FieldTable::default())
            .await
            .unwrap();
        let deliveries = consumer.consume("tracks").await.unwrap();

        broker.fail_next_subscribes(3);
        broker.sever_connections();
        publish(&broker, "tracks", b"eventually").await;

        let message = timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.body, b"eventually".to_vec());
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer
            .declare_queue("tracks", QueueOptions::default(), FieldTable::default())
            .await
            .unwrap();
        let deliveries = consumer.consume("tracks").await.unwrap();

        consumer.close().await.unwrap();
        let end = timeout(Duration::from_secs(5), deliveries.recv()).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn stop_consuming_ends_the_stream_but_keeps_settlement_open() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, 1).await;
        consumer
            .declare_queue("tracks", QueueOptions::default(), FieldTable::default())
            .await
            .unwrap();
        let deliveries = consumer.consume("tracks").await.unwrap();

        publish(&broker, "tracks", b"in flight").await;
        let held = deliveries.recv().await.unwrap();

        consumer.stop_consuming();
        let end = timeout(Duration::from_secs(5), deliveries.recv()).await.unwrap();
        assert_eq!(end, None);

        assert!(consumer.connected());
        consumer.ack(held.id, false).await.unwrap();
        assert_eq!(broker.unacked(), 0);
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn consuming_a_missing_queue_fails() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, 1).await;
        let err = consumer.consume("nowhere").await.unwrap_err();
        assert!(matches!(err, MqError::Consume { ref queue, .. } if queue == "nowhere"));
    }
}
