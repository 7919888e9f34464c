// src/events/worker.rs

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::model::SearchTrackResponse;
use super::sink::{ChatSink, SinkError};
use crate::rabbitmq::{Consumer, Deliveries, Message, Producer};

pub const DEFAULT_FAILURE_REPLY: &str = "Request was not processed, an error occurred";

/// What a worker does with a delivery whose chat could not be looked up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupFailurePolicy {
    /// Reject without requeue; the reply is lost.
    #[default]
    Reject,
    /// Nack with requeue so another attempt happens later.
    Requeue,
    /// Leave the delivery unsettled until the channel closes.
    Leave,
}

impl FromStr for LookupFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "requeue" => Ok(Self::Requeue),
            "leave" => Ok(Self::Leave),
            other => Err(format!(
                "unknown lookup failure policy '{}' (expected reject, requeue or leave)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub failure_reply: String,
    pub on_lookup_failure: LookupFailurePolicy,
    /// Malformed bodies are copied here before being rejected.
    pub dead_letter_queue: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            failure_reply: DEFAULT_FAILURE_REPLY.to_string(),
            on_lookup_failure: LookupFailurePolicy::default(),
            dead_letter_queue: None,
        }
    }
}

/// How a worker settled one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A reply was attempted and the delivery acknowledged.
    Replied,
    /// Undecodable body or unusable request id; rejected without requeue.
    Malformed,
    /// The chat lookup failed; settled according to `LookupFailurePolicy`.
    LookupFailed,
}

pub struct Worker {
    id: usize,
    consumer: Arc<dyn Consumer>,
    producer: Arc<dyn Producer>,
    sink: Arc<dyn ChatSink>,
    settings: Arc<WorkerSettings>,
}

impl Worker {
    pub fn new(
        id: usize,
        consumer: Arc<dyn Consumer>,
        producer: Arc<dyn Producer>,
        sink: Arc<dyn ChatSink>,
        settings: Arc<WorkerSettings>,
    ) -> Self {
        Self {
            id,
            consumer,
            producer,
            sink,
            settings,
        }
    }

    /// Handles messages until the channel closes.
    pub async fn process(self, messages: Deliveries) {
        while let Some(message) = messages.recv().await {
            self.handle(message).await;
        }
        info!(worker = self.id, "Event worker stopped");
    }

    pub async fn handle(&self, message: Message) -> Outcome {
        let response = match SearchTrackResponse::decode(&message.body) {
            Ok(response) => response,
            Err(e) => {
                error!(worker = self.id, id = %message.id, error = %e, "Failed to unmarshal event");
                debug!(worker = self.id, body = %String::from_utf8_lossy(&message.body));
                return self.discard(&message).await;
            }
        };

        let identifier = response.request_id.as_deref().unwrap_or_default();
        let destination = match self.sink.resolve_destination(identifier).await {
            Ok(destination) => destination,
            Err(e @ SinkError::InvalidIdentifier(_)) => {
                error!(worker = self.id, id = %message.id, error = %e, "Event has no usable request id");
                return self.discard(&message).await;
            }
            Err(e) => {
                error!(worker = self.id, id = %message.id, error = %e, "Failed to get chat by id");
                self.settle_lookup_failure(&message).await;
                return Outcome::LookupFailed;
            }
        };

        let text = response.reply_text(&self.settings.failure_reply);
        if let Err(e) = self.sink.send(&destination, text).await {
            error!(worker = self.id, destination = %destination, error = %e, "Failed to send reply");
        }

        if let Err(e) = self.consumer.ack(message.id, false).await {
            error!(worker = self.id, error = %e, "Failed to ack");
        }
        Outcome::Replied
    }

    async fn discard(&self, message: &Message) -> Outcome {
        if let Some(queue) = &self.settings.dead_letter_queue {
            if let Err(e) = self.producer.publish(queue, &message.body).await {
                warn!(worker = self.id, queue = %queue, error = %e, "Failed to dead-letter message");
            }
        }

        if let Err(e) = self.consumer.reject(message.id, false).await {
            error!(worker = self.id, error = %e, "Failed to reject");
        }
        Outcome::Malformed
    }

    async fn settle_lookup_failure(&self, message: &Message) {
        let settled = match self.settings.on_lookup_failure {
            LookupFailurePolicy::Reject => self.consumer.reject(message.id, false).await,
            LookupFailurePolicy::Requeue => self.consumer.nack(message.id, false, true).await,
            LookupFailurePolicy::Leave => {
                warn!(worker = self.id, id = %message.id, "Leaving delivery unsettled");
                Ok(())
            }
        };
        if let Err(e) = settled {
            error!(worker = self.id, error = %e, "Failed to settle message after lookup failure");
        }
    }
}

/// A fixed set of workers draining one consumer's messages.
///
/// Workers share nothing but the consumer, producer and sink handles, so
/// replies can go out in a different order than the messages arrived.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        size: usize,
        consumer: Arc<dyn Consumer>,
        producer: Arc<dyn Producer>,
        messages: Deliveries,
        sink: Arc<dyn ChatSink>,
        settings: WorkerSettings,
    ) -> Self {
        let settings = Arc::new(settings);
        let workers = (0..size)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    Arc::clone(&consumer),
                    Arc::clone(&producer),
                    Arc::clone(&sink),
                    Arc::clone(&settings),
                );
                let handle =
                    tokio::spawn(worker.process(messages.clone()).instrument(info_span!("worker", id)));
                info!("Event Worker #{} started", id);
                handle
            })
            .collect();

        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker; they stop once the consumer's channel closes.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Event worker task failed");
            }
        }
    }
}
