// src/rabbitmq/connection.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lapin::types::FieldTable;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::backoff::ReconnectPolicy;
use super::errors::{MqError, Result, TransportError};
use super::transport::{BrokerAddress, Connector, Link, QueueOptions, Session};

/// How long a single reconnect observer may hold up the notification of the rest.
const OBSERVER_TIMEOUT: Duration = Duration::from_secs(1);

/// Sent to every registered observer after the connection has been restored.
#[derive(Debug, Clone)]
pub struct Reconnected {
    /// Connection attempts it took to get back.
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// Owns one connection + channel to the broker and keeps it alive.
///
/// After a successful `connect` a supervisor task watches the channel. When
/// the broker closes it the manager flips to disconnected, retries with the
/// configured backoff until the broker is back, then tells every reconnect
/// observer. Only `close` stops it.
///
/// The connected flag is a hint: check it right before using the session and
/// expect a broker error if the connection drops in between.
pub struct ConnectionManager {
    address: BrokerAddress,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    connected: Mutex<bool>,
    session: RwLock<Option<(u64, Arc<dyn Session>)>>,
    /// Bumped for every session opened; delivery ids carry it.
    epoch: AtomicU64,
    observers: Mutex<Vec<mpsc::Sender<Reconnected>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    span: Span,
}

impl ConnectionManager {
    /// Connects and starts supervising the connection.
    ///
    /// Fails with `MqError::Connection` when the broker cannot be reached;
    /// the initial connect is not retried.
    pub async fn connect(
        role: &'static str,
        connector: Arc<dyn Connector>,
        address: BrokerAddress,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>> {
        let span = info_span!("rabbitmq", role, address = %address);
        let (shutdown, _) = watch::channel(false);

        let manager = Arc::new(Self {
            address,
            connector,
            policy,
            connected: Mutex::new(false),
            session: RwLock::new(None),
            epoch: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
            shutdown,
            closed: AtomicBool::new(false),
            span,
        });

        let closed = manager
            .establish()
            .instrument(manager.span.clone())
            .await
            .map_err(MqError::Connection)?;
        info!(parent: &manager.span, "Successfully connected to RabbitMQ");

        let supervisor = Arc::clone(&manager);
        let span = manager.span.clone();
        tokio::spawn(supervisor.handle_disconnect(closed).instrument(span));

        Ok(manager)
    }

    pub fn connected(&self) -> bool {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connected(&self, flag: bool) {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner) = flag;
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// Registers a sink that receives one `Reconnected` per restored connection.
    ///
    /// Observers are notified in registration order. A full sink delays the
    /// others by at most one second before its notification is dropped.
    pub fn register_reconnect_observer(&self, sink: mpsc::Sender<Reconnected>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Fires once `close` has been called.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// The live session, or `NotConnected`.
    pub(crate) fn session(&self) -> Result<Arc<dyn Session>> {
        self.current().map(|(_, session)| session)
    }

    /// The live session with its epoch. Each reconnect opens a new epoch.
    pub(crate) fn current(&self) -> Result<(u64, Arc<dyn Session>)> {
        if !self.connected() {
            return Err(MqError::NotConnected);
        }
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(MqError::NotConnected)
    }

    /// Asserts a queue exists with the given properties.
    ///
    /// Declaring an existing queue with identical properties is a no-op;
    /// different properties fail with `QueueConflict`.
    pub async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        args: FieldTable,
    ) -> Result<()> {
        let session = self.session()?;
        session
            .declare_queue(name, options, args)
            .await
            .map_err(|e| MqError::declare(name, e))?;
        debug!(parent: &self.span, queue = name, ?options, "Declared queue");
        Ok(())
    }

    /// Closes channel and connection and stops the reconnect supervisor.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(MqError::AlreadyClosed);
        }

        self.shutdown.send_replace(true);
        self.set_connected(false);

        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((_, session)) = session {
            session.close().await.map_err(MqError::Close)?;
        }

        info!(parent: &self.span, "Closed RabbitMQ connection");
        Ok(())
    }

    async fn establish(&self) -> std::result::Result<oneshot::Receiver<TransportError>, TransportError> {
        let Link { session, closed } = self.connector.connect(&self.address).await?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some((epoch, session));
        self.set_connected(true);
        Ok(closed)
    }

    async fn handle_disconnect(self: Arc<Self>, mut closed: oneshot::Receiver<TransportError>) {
        let mut shutdown = self.shutdown_signal();

        loop {
            let reason = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => return,
                reason = &mut closed => reason,
            };

            self.set_connected(false);
            self.session
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            let Ok(reason) = reason else {
                debug!("Connection closed without error, supervisor exiting");
                return;
            };
            warn!(error = %reason, "Connection to RabbitMQ lost. Trying to reconnect...");

            let mut backoff = self.policy.backoff();
            let mut attempts = 0u32;
            closed = loop {
                attempts += 1;
                match self.establish().await {
                    Ok(closed) => break closed,
                    Err(e) => {
                        let delay = backoff.next_delay();
                        error!(
                            attempt = attempts,
                            error = %e,
                            "Failed to connect to RabbitMQ. Retrying in {:?}",
                            delay
                        );
                        tokio::select! {
                            biased;
                            _ = stopped(&mut shutdown) => return,
                            _ = sleep(delay) => {}
                        }
                    }
                }
            };

            // close() may have run while the last attempt was in flight.
            if self.closed.load(Ordering::SeqCst) {
                self.set_connected(false);
                let session = self
                    .session
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some((_, session)) = session {
                    let _ = session.close().await;
                }
                return;
            }

            info!(attempts, "Reconnected to RabbitMQ");
            self.notify_reconnected(Reconnected {
                attempts,
                at: Utc::now(),
            })
            .await;
        }
    }

    async fn notify_reconnected(&self, event: Reconnected) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for observer in &observers {
            match observer.send_timeout(event.clone(), OBSERVER_TIMEOUT).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!("Reconnect observer did not keep up, notification dropped")
                }
                Err(SendTimeoutError::Closed(_)) => debug!("Reconnect observer gone"),
            }
        }

        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|observer| !observer.is_closed());
    }
}

/// Resolves once shutdown has been requested or the manager is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
