//! NATS JetStream bus provider
//!
//! Every topic is a subject under one JetStream stream; each pipeline
//! reads through a durable pull consumer named after its channel, so
//! delivery is at-least-once with explicit acknowledgement.

mod client;
mod config;
mod subscriber;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsSubscription;

pub(crate) use client::connect_client;

use crate::config::BusAddresses;
use crate::error::Result;
use crate::provider::{BusConnector, BusProvider, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// NATS JetStream bus provider
///
/// Wraps `NatsClient` and implements the `BusProvider` trait.
pub struct NatsProvider {
    client: NatsClient,
}

impl NatsProvider {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl BusProvider for NatsProvider {
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<Box<dyn Subscription>> {
        let sub = self.client.subscribe(topic, channel).await?;
        Ok(Box::new(sub))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client.publish(topic, payload).await.map(|_| ())
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        self.client.list_topics().await
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// Connects `NatsProvider`s for the addresses found in the bridge config
///
/// Stream, credential and timeout settings come from the base config;
/// only the servers and the discovery mode change per connection.
pub struct NatsConnector {
    base: NatsConfig,
}

impl NatsConnector {
    pub fn new(base: NatsConfig) -> Self {
        Self { base }
    }

    /// Effective config for one address set
    pub fn config_for(&self, addresses: &BusAddresses) -> NatsConfig {
        NatsConfig {
            servers: addresses.addresses().to_vec(),
            discover_servers: matches!(addresses, BusAddresses::Lookup(_)),
            ..self.base.clone()
        }
    }
}

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(&self, addresses: &BusAddresses) -> Result<Arc<dyn BusProvider>> {
        let provider = NatsProvider::connect(self.config_for(addresses)).await?;
        Ok(Arc::new(provider))
    }
}
