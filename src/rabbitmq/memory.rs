// src/rabbitmq/memory.rs
//! An in-process broker implementing the transport traits.
//!
//! It follows the broker behaviour the clients rely on: per-channel delivery
//! tags starting at 1, prefetch accounting, requeue of unacknowledged
//! deliveries when a channel goes away, and PRECONDITION_FAILED on
//! conflicting queue declarations. Fault injection hooks (`set_reachable`,
//! `sever_connections`, `fail_next_subscribes`) make outages reproducible
//! without a running RabbitMQ.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::types::FieldTable;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::errors::TransportError;
use super::transport::{
    BrokerAddress, Connector, Delivery, DeliveryStream, Link, QueueOptions, Session,
};

/// A settlement the broker accepted, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack { tag: u64, multiple: bool },
    Nack { tag: u64, multiple: bool, requeue: bool },
    Reject { tag: u64, requeue: bool },
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    reachable: bool,
    connect_attempts: u32,
    failing_subscribes: u32,
    next_session: u64,
    sessions: HashMap<u64, SessionState>,
    queues: HashMap<String, QueueState>,
    settlements: Vec<Settlement>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            connect_attempts: 0,
            failing_subscribes: 0,
            next_session: 0,
            sessions: HashMap::new(),
            queues: HashMap::new(),
            settlements: Vec::new(),
        }
    }
}

struct SessionState {
    closed: Option<oneshot::Sender<TransportError>>,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Vec<u8>)>,
}

impl SessionState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }
}

struct QueueState {
    options: QueueOptions,
    args: FieldTable,
    ready: VecDeque<Vec<u8>>,
    subscribers: Vec<Subscriber>,
    cursor: usize,
}

struct Subscriber {
    session: u64,
    tx: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While unreachable every connection attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Drops every open session as a network failure would.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            state.drop_session(
                id,
                Some(TransportError::ChannelClosed(
                    "connection reset by broker".to_string(),
                )),
            );
        }
        debug!("Severed all in-memory broker sessions");
    }

    /// The next `count` subscription attempts fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.lock().failing_subscribes = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting in the queue, not counting unacknowledged ones.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.ready.len())
    }

    pub fn unacked(&self) -> usize {
        self.lock().sessions.values().map(|s| s.unacked.len()).sum()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }
}

impl BrokerState {
    fn session_mut(&mut self, id: u64) -> Result<&mut SessionState, TransportError> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| TransportError::ChannelClosed(format!("channel {} is closed", id)))
    }

    fn drop_session(&mut self, id: u64, error: Option<TransportError>) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };

        if let (Some(tx), Some(error)) = (session.closed.take(), error) {
            let _ = tx.send(error);
        }

        // Unacknowledged deliveries go back to the head of their queues.
        for (_, (queue, body)) in session.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_front(body);
            }
        }

        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|s| s.session != id);
        }
        self.dispatch_all();
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            sessions, queues, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.subscribers.is_empty() {
            queue.subscribers.retain(|s| !s.tx.is_closed());
            let count = queue.subscribers.len();

            let picked = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&idx| {
                    sessions
                        .get(&queue.subscribers[idx].session)
                        .is_some_and(SessionState::has_capacity)
                });
            let Some(idx) = picked else {
                return;
            };
            queue.cursor = idx + 1;

            let Some(body) = queue.ready.pop_front() else {
                return;
            };
            let subscriber = &queue.subscribers[idx];
            let Some(session) = sessions.get_mut(&subscriber.session) else {
                queue.ready.push_front(body);
                return;
            };

            session.next_tag += 1;
            let tag = session.next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                body: body.clone(),
            };
            if subscriber.tx.send(Ok(delivery)).is_ok() {
                session.unacked.insert(tag, (queue_name.to_string(), body));
            } else {
                queue.ready.push_front(body);
            }
        }
    }

    fn take_unacked(
        &mut self,
        session: u64,
        tag: u64,
        multiple: bool,
    ) -> Result<Vec<(String, Vec<u8>)>, TransportError> {
        let state = self.session_mut(session)?;
        if !state.unacked.contains_key(&tag) {
            return Err(TransportError::PreconditionFailed(format!(
                "unknown delivery tag {}",
                tag
            )));
        }

        let tags: Vec<u64> = if multiple {
            state.unacked.range(..=tag).map(|(t, _)| *t).collect()
        } else {
            vec![tag]
        };
        Ok(tags
            .into_iter()
            .filter_map(|t| state.unacked.remove(&t))
            .collect())
    }

    fn requeue(&mut self, messages: Vec<(String, Vec<u8>)>) {
        for (queue, body) in messages.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_front(body);
            }
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, address: &BrokerAddress) -> Result<Link, TransportError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if !state.reachable {
            return Err(TransportError::Unreachable(format!(
                "connection refused by {}:{}",
                address.host(),
                address.port()
            )));
        }

        state.next_session += 1;
        let id = state.next_session;
        let (tx, closed) = oneshot::channel();
        state.sessions.insert(
            id,
            SessionState {
                closed: Some(tx),
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Link {
            session: Arc::new(MemorySession {
                broker: self.clone(),
                id,
            }),
            closed,
        })
    }
}

pub struct MemorySession {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        args: FieldTable,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.session_mut(self.id)?;

        match state.queues.get(name) {
            Some(existing) if existing.options != options || existing.args != args => {
                Err(TransportError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        args,
                        ready: VecDeque::new(),
                        subscribers: Vec::new(),
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.session_mut(self.id)?.prefetch = count;
        state.dispatch_all();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.session_mut(self.id)?;

        // The default exchange drops messages for queues that do not exist.
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back(body.to_vec());
            state.dispatch(queue);
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, TransportError> {
        let mut state = self.broker.lock();
        state.session_mut(self.id)?;

        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(TransportError::ChannelClosed(
                "subscription refused".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::NotFound(format!("no queue '{}'", queue)))?;
        q.subscribers.push(Subscriber {
            session: self.id,
            tx,
        });
        state.dispatch(queue);

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.take_unacked(self.id, delivery_tag, multiple)?;
        state.settlements.push(Settlement::Ack {
            tag: delivery_tag,
            multiple,
        });
        state.dispatch_all();
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        let taken = state.take_unacked(self.id, delivery_tag, multiple)?;
        if requeue {
            state.requeue(taken);
        }
        state.settlements.push(Settlement::Nack {
            tag: delivery_tag,
            multiple,
            requeue,
        });
        state.dispatch_all();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        let taken = state.take_unacked(self.id, delivery_tag, false)?;
        if requeue {
            state.requeue(taken);
        }
        state.settlements.push(Settlement::Reject {
            tag: delivery_tag,
            requeue,
        });
        state.dispatch_all();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.session_mut(self.id)?;
        state.drop_session(self.id, None);
        Ok(())
    }
}
