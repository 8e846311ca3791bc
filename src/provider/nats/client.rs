//! NATS JetStream client: connect, publish, subscribe, list topics

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::error::{BridgeError, Result};
use async_nats::jetstream;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// Owns the connection and the stream every topic is carried on.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// JetStream stream handle (Mutex for methods requiring &mut self)
    stream: Mutex<jetstream::stream::Stream>,

    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = connect_client(&config).await?;
        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: Mutex::new(stream),
            config: Arc::new(config),
        })
    }

    /// Publish a raw payload to a topic, returning the stream sequence
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64> {
        let subject = self.config.subject(topic);

        let ack = self
            .jetstream
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                reason: format!("ack failed: {}", e),
            })?;

        tracing::debug!(
            topic,
            subject = %subject,
            sequence = ack.sequence,
            "Message published"
        );

        Ok(ack.sequence)
    }

    /// Create (or attach to) the durable pull consumer for a topic
    ///
    /// Subscribers sharing a channel share the consumer and split the
    /// topic's messages.
    pub async fn subscribe(&self, topic: &str, channel: &str) -> Result<NatsSubscription> {
        let consumer_name = self.config.consumer_name(topic, channel);
        let filter_subject = self.config.subject(topic);

        let consumer = self
            .stream
            .lock()
            .await
            .get_or_create_consumer(
                &consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    filter_subject: filter_subject.clone(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    max_ack_pending: self.config.max_ack_pending,
                    ack_wait: Duration::from_secs(self.config.ack_wait_secs),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: format!("consumer '{}': {}", consumer_name, e),
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            topic,
            channel,
            consumer = %consumer_name,
            filter = %filter_subject,
            max_ack_pending = self.config.max_ack_pending,
            "Durable subscription created"
        );

        Ok(NatsSubscription::new(
            messages,
            topic.to_string(),
            self.config.stream_name.clone(),
        ))
    }

    /// Topics that currently hold messages in the stream
    pub async fn list_topics(&self) -> Result<Vec<String>> {
        let filter = format!("{}.>", self.config.subject_prefix);
        let stream = self.stream.lock().await;

        let mut subjects = stream
            .info_with_subjects(filter)
            .await
            .map_err(|e| BridgeError::Connection(format!("Failed to list subjects: {}", e)))?;

        let mut topics = BTreeSet::new();
        while let Some(entry) = subjects.next().await {
            let (subject, _count) = entry
                .map_err(|e| BridgeError::Connection(format!("Failed to list subjects: {}", e)))?;
            if let Some(topic) = self.config.topic_of(&subject) {
                topics.insert(topic.to_string());
            }
        }

        Ok(topics.into_iter().collect())
    }

    /// Flush pending writes to the server
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BridgeError::Connection(format!("Failed to flush: {}", e)))
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the JetStream context
    pub fn jetstream_context(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Open a NATS connection using the configured servers and credentials
pub(crate) async fn connect_client(config: &NatsConfig) -> Result<async_nats::Client> {
    if config.servers.is_empty() {
        return Err(BridgeError::Connection(
            "no NATS servers configured".to_string(),
        ));
    }

    let servers = config.server_list();
    let client = build_connect_options(config)
        .connect(servers.as_str())
        .await
        .map_err(|e| BridgeError::Connection(format!("{}: {}", servers, e)))?;

    tracing::info!(
        servers = %servers,
        discover = config.discover_servers,
        "Connected to NATS"
    );

    Ok(client)
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if !config.discover_servers {
        opts = opts.ignore_discovered_servers();
    }

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream exists with the correct configuration
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_age: Duration::from_secs(config.max_age_secs),
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| {
            BridgeError::Connection(format!(
                "Failed to create/get stream '{}': {}",
                config.stream_name, e
            ))
        })?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream stream ready"
    );

    Ok(stream)
}
