//! In-memory bus provider
//!
//! Single-process bus for tests and local runs. Each topic is one FIFO
//! queue shared by all of its subscribers; requeued messages go back to
//! the front with their attempt count incremented. Every finish and
//! requeue is recorded so tests can assert on delivery outcomes.

use super::{BusConnector, BusProvider, PendingMessage, Subscription};
use crate::config::BusAddresses;
use crate::error::{BridgeError, Result};
use crate::types::BusMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// What happened to a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The message was finished
    Acked { topic: String, id: String },
    /// The message was put back for redelivery
    Requeued {
        topic: String,
        id: String,
        attempts: u64,
    },
}

struct TopicQueue {
    pending: Mutex<VecDeque<BusMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl TopicQueue {
    fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }
}

#[derive(Default)]
struct MemoryBusInner {
    topics: Mutex<BTreeMap<String, Arc<TopicQueue>>>,
    outcomes: Mutex<Vec<DeliveryOutcome>>,
    subscriptions: Mutex<BTreeMap<String, usize>>,
    connections: Mutex<Vec<BusAddresses>>,
}

/// In-memory bus provider
///
/// Cheap to clone; clones share the same topics.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    async fn queue(&self, topic: &str) -> Arc<TopicQueue> {
        let mut topics = self.inner.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicQueue::new()))
            .clone()
    }

    /// Create a topic without publishing to it
    pub async fn create_topic(&self, topic: &str) {
        self.queue(topic).await;
    }

    /// Stop delivering on a topic; its subscriptions end once drained
    pub async fn close_topic(&self, topic: &str) {
        let queue = self.queue(topic).await;
        queue.closed.store(true, Ordering::SeqCst);
        queue.notify.notify_waiters();
        queue.notify.notify_one();
    }

    /// Accept subscriptions on a closed topic again
    pub async fn reopen_topic(&self, topic: &str) {
        self.queue(topic).await.closed.store(false, Ordering::SeqCst);
    }

    /// Messages waiting for delivery on a topic
    pub async fn pending(&self, topic: &str) -> usize {
        self.queue(topic).await.pending.lock().await.len()
    }

    /// Delivery outcomes in the order they happened
    pub async fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.inner.outcomes.lock().await.clone()
    }

    /// Number of messages finished on a topic
    pub async fn acked(&self, topic: &str) -> usize {
        self.outcomes()
            .await
            .iter()
            .filter(|o| matches!(o, DeliveryOutcome::Acked { topic: t, .. } if t == topic))
            .count()
    }

    /// Number of requeues on a topic
    pub async fn requeued(&self, topic: &str) -> usize {
        self.outcomes()
            .await
            .iter()
            .filter(|o| matches!(o, DeliveryOutcome::Requeued { topic: t, .. } if t == topic))
            .count()
    }

    /// Number of subscriptions ever opened on a topic
    pub async fn subscriptions(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .await
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Address sets this bus was connected with through `BusConnector`
    pub async fn connections(&self) -> Vec<BusAddresses> {
        self.inner.connections.lock().await.clone()
    }
}

#[async_trait]
impl BusProvider for MemoryBus {
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<Box<dyn Subscription>> {
        let queue = self.queue(topic).await;
        if queue.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: "topic is closed".to_string(),
            });
        }

        *self
            .inner
            .subscriptions
            .lock()
            .await
            .entry(topic.to_string())
            .or_insert(0) += 1;

        tracing::debug!(topic, channel, "Memory subscription created");

        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            queue,
            bus: self.inner.clone(),
        }))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let queue = self.queue(topic).await;
        if queue.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Publish {
                topic: topic.to_string(),
                reason: "topic is closed".to_string(),
            });
        }

        queue
            .pending
            .lock()
            .await
            .push_back(BusMessage::new(topic, payload));
        queue.notify.notify_one();
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        Ok(self.inner.topics.lock().await.keys().cloned().collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self, addresses: &BusAddresses) -> Result<Arc<dyn BusProvider>> {
        self.inner.connections.lock().await.push(addresses.clone());
        Ok(Arc::new(self.clone()))
    }
}

/// Subscription handle returned by [`MemoryBus::subscribe`]
pub struct MemorySubscription {
    topic: String,
    queue: Arc<TopicQueue>,
    bus: Arc<MemoryBusInner>,
}

impl MemorySubscription {
    fn pending(&self, message: BusMessage) -> PendingMessage {
        let ack_bus = self.bus.clone();
        let ack_topic = self.topic.clone();
        let ack_id = message.id.clone();

        let requeue_bus = self.bus.clone();
        let requeue_queue = self.queue.clone();
        let mut redelivery = message.clone();

        PendingMessage::new(
            message,
            move || {
                async move {
                    ack_bus.outcomes.lock().await.push(DeliveryOutcome::Acked {
                        topic: ack_topic,
                        id: ack_id,
                    });
                    Ok(())
                }
                .boxed()
            },
            move || {
                async move {
                    redelivery.attempts += 1;
                    requeue_bus
                        .outcomes
                        .lock()
                        .await
                        .push(DeliveryOutcome::Requeued {
                            topic: redelivery.topic.clone(),
                            id: redelivery.id.clone(),
                            attempts: redelivery.attempts,
                        });
                    requeue_queue.pending.lock().await.push_front(redelivery);
                    requeue_queue.notify.notify_one();
                    Ok(())
                }
                .boxed()
            },
        )
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<PendingMessage>> {
        loop {
            if let Some(message) = self.queue.pending.lock().await.pop_front() {
                return Ok(Some(self.pending(message)));
            }

            if self.queue.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            self.queue.notify.notified().await;
        }
    }
}
