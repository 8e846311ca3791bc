//! NATS JetStream subscription

use crate::error::{BridgeError, Result};
use crate::provider::{PendingMessage, Subscription};
use crate::types::{now_millis, BusMessage};
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};

/// Pull subscription for one topic
pub struct NatsSubscription {
    messages: jetstream::consumer::pull::Stream,
    topic: String,
    stream_name: String,
}

impl NatsSubscription {
    pub(crate) fn new(
        messages: jetstream::consumer::pull::Stream,
        topic: String,
        stream_name: String,
    ) -> Self {
        Self {
            messages,
            topic,
            stream_name,
        }
    }

    fn pending(&self, msg: jetstream::Message) -> PendingMessage {
        let (id, attempts) = match msg.info() {
            Ok(info) => (
                format!("{}-{}", self.stream_name, info.stream_sequence),
                info.delivered.max(1) as u64,
            ),
            Err(_) => (format!("msg-{}", uuid::Uuid::new_v4()), 1),
        };

        let message = BusMessage {
            id,
            topic: self.topic.clone(),
            payload: msg.payload.clone(),
            attempts,
            timestamp: now_millis(),
        };

        let ack_msg = msg.clone();
        let requeue_msg = msg;

        PendingMessage::new(
            message,
            move || {
                async move {
                    ack_msg
                        .ack()
                        .await
                        .map_err(|e| BridgeError::Ack(e.to_string()))
                }
                .boxed()
            },
            move || {
                async move {
                    requeue_msg
                        .ack_with(AckKind::Nak(None))
                        .await
                        .map_err(|e| BridgeError::Ack(e.to_string()))
                }
                .boxed()
            },
        )
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<PendingMessage>> {
        loop {
            match self.messages.next().await {
                Some(Ok(msg)) => return Ok(Some(self.pending(msg))),
                Some(Err(e)) => {
                    // Transient pull errors (heartbeats, leadership changes)
                    tracing::warn!(
                        topic = %self.topic,
                        error = %e,
                        "Error receiving message, retrying"
                    );
                }
                None => return Ok(None),
            }
        }
    }
}
