// src/rabbitmq/message.rs

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Names one delivery: the broker tag plus the epoch of the channel it arrived on.
///
/// Tags restart on every channel, so a tag alone cannot tell a delivery from
/// before a reconnect apart from a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryId {
    tag: u64,
    epoch: u64,
}

impl DeliveryId {
    pub fn new(tag: u64, epoch: u64) -> Self {
        Self { tag, epoch }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tag, self.epoch)
    }
}

/// A delivery normalized by the consumer; `id` is the key for `ack`, `nack` and `reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: DeliveryId,
    pub body: Vec<u8>,
}

/// Receiving half of a consumer's exported channel, shareable between workers.
///
/// Every message is handed to exactly one `recv` caller. Once the consumer
/// shuts down, `recv` returns `None` on every handle.
#[derive(Debug, Clone)]
pub struct Deliveries {
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl Deliveries {
    pub(crate) fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }
}
