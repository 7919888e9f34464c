// Integration tests run against the in-memory broker unless marked #[ignore]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use lapin::types::{AMQPValue, FieldTable, ShortString};
use tokio::time::{sleep, timeout};

use track_relay::rabbitmq::{
    BaseConfig, BrokerAddress, ConnectionManager, Consumer, DeliveryId, MemoryBroker,
    MessageQueue, MqError, Producer, QueueOptions, RabbitConsumer, RabbitProducer,
    ReconnectPolicy, Settlement,
};

fn address() -> BrokerAddress {
    BrokerAddress::new("memory", 5672, "guest", "guest")
}

async fn manager(broker: &MemoryBroker, role: &'static str) -> Arc<ConnectionManager> {
    ConnectionManager::connect(
        role,
        Arc::new(broker.clone()),
        address(),
        ReconnectPolicy::fixed(Duration::from_millis(20)),
    )
    .await
    .expect("connect to memory broker")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn declare_is_idempotent_and_detects_conflicts() {
    let broker = MemoryBroker::new();
    let producer = RabbitProducer::new(manager(&broker, "producer").await);

    for _ in 0..2 {
        producer
            .declare_queue("requests", QueueOptions::durable(), FieldTable::default())
            .await
            .unwrap();
    }
    assert!(broker.queue_exists("requests"));

    let err = producer
        .declare_queue("requests", QueueOptions::default(), FieldTable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::QueueConflict { ref queue, .. } if queue == "requests"));

    let mut args = FieldTable::default();
    args.insert(ShortString::from("x-max-length"), AMQPValue::LongUInt(10));
    let err = producer
        .declare_queue("requests", QueueOptions::durable(), args)
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::QueueConflict { .. }));
}

#[tokio::test]
async fn published_messages_arrive_with_unique_ids() {
    let broker = MemoryBroker::new();
    let producer = RabbitProducer::new(manager(&broker, "producer").await);
    let consumer = RabbitConsumer::new(manager(&broker, "consumer").await, 100);

    consumer
        .declare_queue("responses", QueueOptions::durable(), FieldTable::default())
        .await
        .unwrap();
    let deliveries = consumer.consume("responses").await.unwrap();

    for n in 0..5 {
        producer
            .publish("responses", format!("payload-{}", n).as_bytes())
            .await
            .unwrap();
    }

    let mut ids = HashSet::new();
    for n in 0..5 {
        let message = timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.body, format!("payload-{}", n).into_bytes());
        assert!(ids.insert(message.id), "duplicate delivery id {}", message.id);
        consumer.ack(message.id, false).await.unwrap();
    }

    assert_eq!(broker.unacked(), 0);
    assert_eq!(
        broker.settlements()[0],
        Settlement::Ack {
            tag: 1,
            multiple: false
        }
    );
}

#[tokio::test]
async fn operations_fail_while_disconnected_without_side_effects() {
    let broker = MemoryBroker::new();
    let connection = manager(&broker, "producer").await;
    let producer = RabbitProducer::new(connection.clone());
    let consumer = RabbitConsumer::new(manager(&broker, "consumer").await, 10);
    producer
        .declare_queue("requests", QueueOptions::durable(), FieldTable::default())
        .await
        .unwrap();

    broker.set_reachable(false);
    broker.sever_connections();
    wait_until(|| !connection.connected()).await;

    let err = producer.publish("requests", b"lost").await.unwrap_err();
    assert!(err.is_not_connected());
    let err = producer
        .declare_queue("other", QueueOptions::durable(), FieldTable::default())
        .await
        .unwrap_err();
    assert!(err.is_not_connected());
    wait_until(|| !consumer.connected()).await;
    let id = DeliveryId::new(1, 1);
    assert!(consumer.ack(id, false).await.unwrap_err().is_not_connected());
    assert!(consumer.nack(id, false, true).await.unwrap_err().is_not_connected());
    assert!(consumer.reject(id, false).await.unwrap_err().is_not_connected());
    assert!(consumer.consume("requests").await.unwrap_err().is_not_connected());

    assert_eq!(broker.queue_depth("requests"), 0);
    assert!(!broker.queue_exists("other"));
    assert!(broker.settlements().is_empty());

    broker.set_reachable(true);
    wait_until(|| connection.connected()).await;
    producer.publish("requests", b"kept").await.unwrap();
    assert_eq!(broker.queue_depth("requests"), 1);
}

#[tokio::test]
async fn observers_hear_about_each_reconnect() {
    let broker = MemoryBroker::new();
    let connection = manager(&broker, "consumer").await;
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    connection.register_reconnect_observer(tx);

    for round in 1..=2 {
        broker.sever_connections();
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.attempts >= 1, "round {}", round);
        assert!(connection.connected());
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn close_twice_reports_already_closed() {
    let broker = MemoryBroker::new();
    let producer = RabbitProducer::new(manager(&broker, "producer").await);

    producer.close().await.unwrap();
    assert!(!producer.connected());
    assert!(matches!(producer.close().await, Err(MqError::AlreadyClosed)));
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_live_broker_round_trip() {
    let base = BaseConfig {
        host: std::env::var("RABBITMQ_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: 5672,
        username: "guest".to_string(),
        password: "guest".to_string(),
    };
    let policy = ReconnectPolicy::default();
    let producer = RabbitProducer::connect(
        &track_relay::rabbitmq::ProducerConfig { base: base.clone() },
        policy.clone(),
    )
    .await
    .unwrap();
    let consumer = RabbitConsumer::connect(
        &track_relay::rabbitmq::ConsumerConfig {
            base,
            prefetch_count: 1,
        },
        policy,
    )
    .await
    .unwrap();

    let queue = format!("track_relay_test_{}", uuid::Uuid::new_v4());
    let options = QueueOptions {
        durable: false,
        auto_delete: true,
        exclusive: false,
    };
    producer
        .declare_queue(&queue, options, FieldTable::default())
        .await
        .unwrap();
    let deliveries = consumer.consume(&queue).await.unwrap();

    producer.publish(&queue, b"ping").await.unwrap();
    let message = timeout(Duration::from_secs(10), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.body, b"ping".to_vec());
    consumer.ack(message.id, false).await.unwrap();

    consumer.close().await.unwrap();
    producer.close().await.unwrap();
}
