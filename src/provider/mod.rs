//! Bus provider traits the bridge consumes topics through
//!
//! Every bus backend (NATS JetStream, in-memory, ...) implements
//! `BusProvider`. The bridge only needs four things from a bus:
//! subscribe, acknowledge, requeue and publish.

use crate::config::BusAddresses;
use crate::error::Result;
use crate::types::BusMessage;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub mod memory;
pub mod nats;

/// Core trait for bus backends
#[async_trait]
pub trait BusProvider: Send + Sync {
    /// Subscribe to a topic with manual acknowledgement
    ///
    /// `channel` names the consumer group; subscribers sharing a channel
    /// split the topic's messages between them.
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<Box<dyn Subscription>>;

    /// Publish a raw payload to a topic
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Topics currently known to the bus
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check: returns true if the bus answers a topic listing
    async fn health(&self) -> Result<bool> {
        self.list_topics().await.map(|_| true)
    }
}

/// Opens bus connections for a set of addresses
///
/// The bus addresses live in the watched configuration, so the
/// connection is established after the configuration is read.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, addresses: &BusAddresses) -> Result<Arc<dyn BusProvider>>;
}

/// Async subscription handle for one topic
///
/// Dropping the subscription stops delivery.
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next message, or `None` once the bus has stopped
    /// delivering for this subscription
    async fn next(&mut self) -> Result<Option<PendingMessage>>;
}

type AckFn = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<()>> + Send>;

/// A message pending acknowledgement
pub struct PendingMessage {
    /// The delivered message
    pub message: BusMessage,

    /// Finish callback: confirms processing
    ack_fn: AckFn,

    /// Requeue callback: asks for immediate redelivery
    requeue_fn: AckFn,
}

impl PendingMessage {
    /// Create a new pending message with finish/requeue callbacks
    pub fn new(
        message: BusMessage,
        ack_fn: impl FnOnce() -> futures::future::BoxFuture<'static, Result<()>> + Send + 'static,
        requeue_fn: impl FnOnce() -> futures::future::BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            message,
            ack_fn: Box::new(ack_fn),
            requeue_fn: Box::new(requeue_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge for immediate redelivery
    pub async fn requeue(self) -> Result<()> {
        (self.requeue_fn)().await
    }
}

impl std::fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
