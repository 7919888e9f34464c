// src/events/sink.rs
// Where worker replies go. The core only needs "resolve an id" and "send text".

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("{0:?} is not a valid chat identifier")]
    InvalidIdentifier(String),

    #[error("chat {0} not found")]
    NotFound(String),

    #[error("failed to deliver reply: {0}")]
    Delivery(String),
}

/// A resolved chat to reply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub chat_id: i64,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat:{}", self.chat_id)
    }
}

/// Parses a request identifier into a chat id.
pub fn parse_chat_id(identifier: &str) -> Result<i64, SinkError> {
    identifier
        .trim()
        .parse::<i64>()
        .map_err(|_| SinkError::InvalidIdentifier(identifier.to_string()))
}

#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn resolve_destination(&self, identifier: &str) -> Result<Destination, SinkError>;

    async fn send(&self, destination: &Destination, text: &str) -> Result<(), SinkError>;
}

/// Writes replies to the log instead of a chat platform.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ChatSink for LogSink {
    async fn resolve_destination(&self, identifier: &str) -> Result<Destination, SinkError> {
        Ok(Destination {
            chat_id: parse_chat_id(identifier)?,
        })
    }

    async fn send(&self, destination: &Destination, text: &str) -> Result<(), SinkError> {
        info!(destination = %destination, reply = text, "Reply");
        Ok(())
    }
}

/// Records replies in memory; chats must be registered before they resolve.
#[derive(Debug, Default)]
pub struct MemorySink {
    chats: Mutex<Vec<i64>>,
    sent: Mutex<Vec<(Destination, String)>>,
    failing_sends: Mutex<u32>,
    send_delay: Duration,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chats(chats: impl IntoIterator<Item = i64>) -> Self {
        let sink = Self::default();
        sink.chats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(chats);
        sink
    }

    /// Every send takes `delay` before it is recorded.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// The next `count` sends fail.
    pub fn fail_next_sends(&self, count: u32) {
        *self.failing_sends.lock().unwrap_or_else(PoisonError::into_inner) = count;
    }

    pub fn sent(&self) -> Vec<(Destination, String)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ChatSink for MemorySink {
    async fn resolve_destination(&self, identifier: &str) -> Result<Destination, SinkError> {
        let chat_id = parse_chat_id(identifier)?;
        let known = self
            .chats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&chat_id);
        if !known {
            return Err(SinkError::NotFound(identifier.to_string()));
        }
        Ok(Destination { chat_id })
    }

    async fn send(&self, destination: &Destination, text: &str) -> Result<(), SinkError> {
        {
            let mut failing = self
                .failing_sends
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *failing > 0 {
                *failing -= 1;
                return Err(SinkError::Delivery("chat platform unavailable".to_string()));
            }
        }
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((*destination, text.to_string()));
        Ok(())
    }
}
