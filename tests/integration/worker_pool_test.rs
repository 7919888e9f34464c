// Worker pool end to end over the in-memory broker

use std::sync::Arc;
use std::time::Duration;

use lapin::types::FieldTable;
use tokio::time::{sleep, timeout};

use track_relay::events::{Destination, MemorySink, WorkerPool, WorkerSettings};
use track_relay::rabbitmq::{
    BrokerAddress, ConnectionManager, Consumer, MemoryBroker, MessageQueue, Producer,
    QueueOptions, RabbitConsumer, RabbitProducer, ReconnectPolicy, Settlement,
};

const RESPONSES: &str = "search_track_responses";

struct Harness {
    broker: MemoryBroker,
    producer: Arc<RabbitProducer>,
    consumer: Arc<RabbitConsumer>,
    sink: Arc<MemorySink>,
    pool: WorkerPool,
}

async fn manager(broker: &MemoryBroker, role: &'static str) -> Arc<ConnectionManager> {
    ConnectionManager::connect(
        role,
        Arc::new(broker.clone()),
        BrokerAddress::new("memory", 5672, "guest", "guest"),
        ReconnectPolicy::fixed(Duration::from_millis(20)),
    )
    .await
    .expect("connect to memory broker")
}

async fn start(workers: usize, settings: WorkerSettings) -> Harness {
    start_with_sink(workers, settings, Arc::new(MemorySink::with_chats([42]))).await
}

async fn start_with_sink(
    workers: usize,
    settings: WorkerSettings,
    sink: Arc<MemorySink>,
) -> Harness {
    let broker = MemoryBroker::new();
    let producer = Arc::new(RabbitProducer::new(manager(&broker, "producer").await));
    let consumer = Arc::new(RabbitConsumer::new(manager(&broker, "consumer").await, 100));

    for queue in [RESPONSES, "dead_letters"] {
        producer
            .declare_queue(queue, QueueOptions::durable(), FieldTable::default())
            .await
            .unwrap();
    }
    let deliveries = consumer.consume(RESPONSES).await.unwrap();

    let pool = WorkerPool::start(
        workers,
        consumer.clone(),
        producer.clone(),
        deliveries,
        sink.clone(),
        settings,
    );

    Harness {
        broker,
        producer,
        consumer,
        sink,
        pool,
    }
}

impl Harness {
    async fn publish(&self, body: &str) {
        self.producer.publish(RESPONSES, body.as_bytes()).await.unwrap();
    }

    async fn wait_for_settlements(&self, count: usize) -> Vec<Settlement> {
        timeout(Duration::from_secs(5), async {
            loop {
                let settled = self.broker.settlements();
                if settled.len() >= count {
                    return settled;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("settlements not reached in time")
    }

    async fn stop(self) -> (MemoryBroker, Arc<MemorySink>) {
        self.consumer.stop_consuming();
        timeout(Duration::from_secs(5), self.pool.join())
            .await
            .expect("workers did not stop");
        self.consumer.close().await.unwrap();
        self.producer.close().await.unwrap();
        (self.broker, self.sink)
    }
}

#[tokio::test]
async fn successful_search_is_replied_with_the_track_name() {
    let harness = start(3, WorkerSettings::default()).await;
    harness
        .publish(r#"{"request_id":"42","name":"song","success":"true"}"#)
        .await;

    let settled = harness.wait_for_settlements(1).await;
    assert_eq!(
        settled,
        vec![Settlement::Ack {
            tag: 1,
            multiple: false
        }]
    );

    let (_, sink) = harness.stop().await;
    assert_eq!(
        sink.sent(),
        vec![(Destination { chat_id: 42 }, "song".to_string())]
    );
}

#[tokio::test]
async fn failed_search_is_replied_with_the_failure_text() {
    let settings = WorkerSettings {
        failure_reply: "Track not found".to_string(),
        ..WorkerSettings::default()
    };
    let harness = start(1, settings).await;
    harness
        .publish(r#"{"request_id":"42","name":"song","success":"false","err":"quota"}"#)
        .await;

    harness.wait_for_settlements(1).await;
    let (_, sink) = harness.stop().await;
    assert_eq!(sink.sent()[0].1, "Track not found");
}

#[tokio::test]
async fn malformed_body_is_rejected_exactly_once() {
    let settings = WorkerSettings {
        dead_letter_queue: Some("dead_letters".to_string()),
        ..WorkerSettings::default()
    };
    let harness = start(3, settings).await;
    harness.publish("definitely not json").await;

    let settled = harness.wait_for_settlements(1).await;
    assert_eq!(
        settled,
        vec![Settlement::Reject {
            tag: 1,
            requeue: false
        }]
    );
    assert_eq!(harness.broker.queue_depth("dead_letters"), 1);

    let (broker, sink) = harness.stop().await;
    assert_eq!(broker.settlements().len(), 1);
    assert!(sink.sent().is_empty());
}

#[tokio::test]
async fn redelivered_event_produces_the_same_reply() {
    let harness = start(2, WorkerSettings::default()).await;
    let body = r#"{"request_id":"42","name":"song","success":true}"#;
    harness.publish(body).await;
    harness.publish(body).await;

    let settled = harness.wait_for_settlements(2).await;
    assert!(settled
        .iter()
        .all(|s| matches!(s, Settlement::Ack { multiple: false, .. })));

    let (_, sink) = harness.stop().await;
    let sent = sink.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
}

#[tokio::test]
async fn unknown_chat_is_rejected_by_default() {
    let harness = start(1, WorkerSettings::default()).await;
    harness
        .publish(r#"{"request_id":"7","name":"song","success":"true"}"#)
        .await;

    let settled = harness.wait_for_settlements(1).await;
    assert_eq!(
        settled,
        vec![Settlement::Reject {
            tag: 1,
            requeue: false
        }]
    );
    let (_, sink) = harness.stop().await;
    assert!(sink.sent().is_empty());
}

#[tokio::test]
async fn in_flight_event_is_settled_during_shutdown() {
    let sink = Arc::new(MemorySink::with_chats([42]).with_send_delay(Duration::from_millis(200)));
    let harness = start_with_sink(1, WorkerSettings::default(), sink).await;
    harness
        .publish(r#"{"request_id":"42","name":"song","success":"true"}"#)
        .await;
    timeout(Duration::from_secs(5), async {
        while harness.broker.unacked() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("event not picked up");

    let (broker, sink) = harness.stop().await;
    assert_eq!(
        broker.settlements(),
        vec![Settlement::Ack {
            tag: 1,
            multiple: false
        }]
    );
    assert_eq!(sink.sent().len(), 1);
}
