// src/rabbitmq/errors.rs

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;

use super::message::DeliveryId;
use thiserror::Error;

/// Failures reported by a broker transport (lapin or the in-memory broker).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

// Converting from lapin errors
impl From<LapinError> for TransportError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match error {
            LapinError::ProtocolError(ref amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    TransportError::PreconditionFailed(error_text)
                }
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                    TransportError::NotFound(error_text)
                }
                _ => TransportError::Protocol(error_text),
            },
            LapinError::IOError(_) => TransportError::Unreachable(error_text),
            LapinError::InvalidChannelState(_) | LapinError::InvalidConnectionState(_) => {
                TransportError::ChannelClosed(error_text)
            }
            _ => TransportError::Protocol(error_text),
        }
    }
}

#[derive(Debug, Error)]
pub enum MqError {
    #[error("no connection to RabbitMQ")]
    NotConnected,

    #[error("connection to RabbitMQ already closed")]
    AlreadyClosed,

    #[error("queue {queue} already exists with different properties: {source}")]
    QueueConflict {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to connect to RabbitMQ: {0}")]
    Connection(#[source] TransportError),

    #[error("failed to declare queue {queue}: {source}")]
    Declare {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to publish message to {queue}: {source}")]
    Publish {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to consume messages from {queue}: {source}")]
    Consume {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to ack message with id {id}: {source}")]
    Ack {
        id: DeliveryId,
        #[source]
        source: TransportError,
    },

    #[error("failed to nack message with id {id}: {source}")]
    Nack {
        id: DeliveryId,
        #[source]
        source: TransportError,
    },

    #[error("failed to reject message with id {id}: {source}")]
    Reject {
        id: DeliveryId,
        #[source]
        source: TransportError,
    },

    #[error("message {id} came from an earlier channel; the broker has already requeued it")]
    StaleDelivery { id: DeliveryId },

    #[error("failed to close RabbitMQ connection: {0}")]
    Close(#[source] TransportError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, MqError>;

impl MqError {
    /// Maps a failed queue declaration, separating property conflicts from other failures.
    pub(crate) fn declare(queue: &str, source: TransportError) -> Self {
        match source {
            TransportError::PreconditionFailed(_) => MqError::QueueConflict {
                queue: queue.to_string(),
                source,
            },
            other => MqError::Declare {
                queue: queue.to_string(),
                source: other,
            },
        }
    }

    /// `true` when the caller should back off and retry once the connection is back.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, MqError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_failure_on_declare_is_a_conflict() {
        let err = MqError::declare(
            "tracks",
            TransportError::PreconditionFailed("inequivalent arg 'durable'".into()),
        );
        assert!(matches!(err, MqError::QueueConflict { ref queue, .. } if queue == "tracks"));
    }

    #[test]
    fn other_declare_failures_stay_generic() {
        let err = MqError::declare("tracks", TransportError::ChannelClosed("gone".into()));
        assert!(matches!(err, MqError::Declare { .. }));
    }

    #[test]
    fn settlement_errors_carry_the_delivery_id() {
        let err = MqError::Reject {
            id: DeliveryId::new(17, 3),
            source: TransportError::Protocol("unknown delivery tag".into()),
        };
        assert_eq!(
            err.to_string(),
            "failed to reject message with id 17@3: protocol error: unknown delivery tag"
        );
    }
}
