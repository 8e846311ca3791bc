//! NATS JetStream key-value config store

use super::{ConfigStore, ConfigWatch, StoreEntry, StoreEvent, StoreEventKind};
use crate::error::{BridgeError, Result};
use crate::provider::nats::{connect_client, NatsConfig};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

/// Revisions kept per key in a bucket created by the bridge
const BUCKET_HISTORY: i64 = 5;

/// Config store backed by a JetStream KV bucket
pub struct NatsKvStore {
    client: async_nats::Client,
    kv: kv::Store,
    bucket: String,
}

impl NatsKvStore {
    /// Connect and open the bucket, creating it if missing
    pub async fn connect(config: &NatsConfig, bucket: &str) -> Result<Self> {
        let client = connect_client(config).await?;
        let js = jetstream::new(client.clone());

        let kv = match js.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(_) => js
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: BUCKET_HISTORY,
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    BridgeError::Store(format!("Failed to open bucket '{}': {}", bucket, e))
                })?,
        };

        tracing::info!(bucket, "Config store ready");

        Ok(Self {
            client,
            kv,
            bucket: bucket.to_string(),
        })
    }

    /// Write a value, returning its revision
    pub async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        self.kv
            .put(key, value)
            .await
            .map_err(|e| BridgeError::Store(format!("Failed to put '{}': {}", key, e)))
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn event_from_entry(entry: kv::Entry) -> StoreEvent {
    let kind = match entry.operation {
        kv::Operation::Put => StoreEventKind::Put,
        kv::Operation::Delete | kv::Operation::Purge => StoreEventKind::Delete,
    };

    StoreEvent {
        kind,
        key: entry.key,
        value: entry.value,
        revision: entry.revision,
    }
}

#[async_trait]
impl ConfigStore for NatsKvStore {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>> {
        let entry = self
            .kv
            .entry(key)
            .await
            .map_err(|e| BridgeError::Store(format!("Failed to get '{}': {}", key, e)))?;

        Ok(entry
            .filter(|e| e.operation == kv::Operation::Put)
            .map(|e| StoreEntry {
                key: e.key,
                value: e.value,
                revision: e.revision,
            }))
    }

    async fn watch(&self, key: &str, from_revision: u64) -> Result<ConfigWatch> {
        let watch = self
            .kv
            .watch_from_revision(key, from_revision.max(1))
            .await
            .map_err(|e| BridgeError::Store(format!("Failed to watch '{}': {}", key, e)))?;

        tracing::debug!(bucket = %self.bucket, key, from_revision, "Watching config key");

        Ok(watch
            .map(|entry| {
                entry
                    .map(event_from_entry)
                    .map_err(|e| BridgeError::Store(format!("Watch failed: {}", e)))
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BridgeError::Store(format!("Failed to close store: {}", e)))?;
        tracing::debug!(bucket = %self.bucket, "Config store closed");
        Ok(())
    }

    fn name(&self) -> &str {
        "nats-kv"
    }
}
