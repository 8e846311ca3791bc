//! Dead letter handling for messages that keep failing
//!
//! Under the dead-letter failure policy a pipeline requeues a failing
//! message until it has been delivered `max_attempts` times, then hands
//! it to a `DlqHandler` and finishes it so the topic keeps moving.

use crate::error::{BridgeError, Result};
use crate::provider::BusProvider;
use crate::types::{now_millis, BusMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A failed message with context about why it was dead-lettered
#[derive(Debug, Clone)]
pub struct DeadLetterMessage {
    /// The message as last delivered
    pub message: BusMessage,

    /// Reason the message was dead-lettered
    pub reason: String,

    /// Unix timestamp in milliseconds when the message was dead-lettered
    pub dead_lettered_at: u64,
}

impl DeadLetterMessage {
    pub fn new(message: BusMessage, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
            dead_lettered_at: now_millis(),
        }
    }
}

/// Trait for dead letter handlers
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Take ownership of a message that exhausted its attempts
    async fn handle(&self, dead: DeadLetterMessage) -> Result<()>;

    /// Number of messages dead-lettered so far
    async fn count(&self) -> Result<usize>;
}

/// In-memory DLQ handler for development and testing
///
/// Keeps at most `max_messages`; the oldest are dropped first.
pub struct MemoryDlqHandler {
    messages: Arc<RwLock<Vec<DeadLetterMessage>>>,
    max_messages: usize,
}

impl MemoryDlqHandler {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Arc::new(RwLock::new(Vec::new())),
            max_messages,
        }
    }

    /// Most recent dead letters first
    pub async fn list(&self, limit: usize) -> Vec<DeadLetterMessage> {
        let messages = self.messages.read().await;
        messages.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, dead: DeadLetterMessage) -> Result<()> {
        tracing::warn!(
            message_id = %dead.message.id,
            topic = %dead.message.topic,
            attempts = dead.message.attempts,
            reason = %dead.reason,
            "Message dead-lettered"
        );

        let mut messages = self.messages.write().await;
        messages.push(dead);

        if self.max_messages > 0 && messages.len() > self.max_messages {
            let drain_count = messages.len() - self.max_messages;
            messages.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.messages.read().await.len())
    }
}

/// JSON record published by [`BusDlqHandler`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub message_id: String,
    pub topic: String,
    pub attempts: u64,
    pub reason: String,
    pub dead_lettered_at: u64,
    /// Original payload, lossily decoded
    pub payload: String,
}

impl From<&DeadLetterMessage> for DeadLetterRecord {
    fn from(dead: &DeadLetterMessage) -> Self {
        Self {
            message_id: dead.message.id.clone(),
            topic: dead.message.topic.clone(),
            attempts: dead.message.attempts,
            reason: dead.reason.clone(),
            dead_lettered_at: dead.dead_lettered_at,
            payload: dead.message.text(),
        }
    }
}

/// Forwards dead letters to a topic on the bus
pub struct BusDlqHandler {
    bus: Arc<dyn BusProvider>,
    topic: String,
    count: RwLock<usize>,
}

impl BusDlqHandler {
    pub fn new(bus: Arc<dyn BusProvider>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            count: RwLock::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl DlqHandler for BusDlqHandler {
    async fn handle(&self, dead: DeadLetterMessage) -> Result<()> {
        let record = DeadLetterRecord::from(&dead);
        let payload = serde_json::to_vec(&record)?;

        self.bus
            .publish(&self.topic, payload.into())
            .await
            .map_err(|e| BridgeError::Publish {
                topic: self.topic.clone(),
                reason: format!("dead letter for '{}': {}", record.message_id, e),
            })?;

        *self.count.write().await += 1;

        tracing::warn!(
            message_id = %record.message_id,
            topic = %record.topic,
            dlq_topic = %self.topic,
            attempts = record.attempts,
            reason = %record.reason,
            "Message dead-lettered"
        );
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(*self.count.read().await)
    }
}

/// Whether a message has used up its delivery attempts
///
/// `max_attempts == 0` means unlimited.
pub fn should_dead_letter(message: &BusMessage, max_attempts: u64) -> bool {
    max_attempts > 0 && message.attempts >= max_attempts
}
