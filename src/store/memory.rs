//! In-memory config store for testing

use super::{ConfigStore, ConfigWatch, StoreEntry, StoreEvent, StoreEventKind};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

struct StoreState {
    revision: u64,
    entries: HashMap<String, StoreEntry>,
    /// Every change, kept so watches can start from an older revision
    log: Vec<StoreEvent>,
    /// `None` once the store is closed
    sender: Option<broadcast::Sender<StoreEvent>>,
    closes: usize,
}

/// Versioned in-memory key-value store
///
/// Revisions are global and strictly increasing, as in NATS KV.
pub struct MemoryConfigStore {
    state: Mutex<StoreState>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(StoreState {
                revision: 0,
                entries: HashMap::new(),
                log: Vec::new(),
                sender: Some(sender),
                closes: 0,
            }),
        }
    }
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a value, returning its revision
    pub async fn put(&self, key: &str, value: impl Into<Bytes>) -> Result<u64> {
        let value = value.into();
        let mut state = self.state.lock().await;
        let sender = state.sender.clone().ok_or_else(closed)?;

        state.revision += 1;
        let revision = state.revision;
        state.entries.insert(
            key.to_string(),
            StoreEntry {
                key: key.to_string(),
                value: value.clone(),
                revision,
            },
        );

        let event = StoreEvent {
            kind: StoreEventKind::Put,
            key: key.to_string(),
            value,
            revision,
        };
        state.log.push(event.clone());
        // No receivers is fine
        let _ = sender.send(event);
        Ok(revision)
    }

    /// Remove a key, returning the revision of the delete
    pub async fn delete(&self, key: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let sender = state.sender.clone().ok_or_else(closed)?;

        state.revision += 1;
        let revision = state.revision;
        state.entries.remove(key);

        let event = StoreEvent {
            kind: StoreEventKind::Delete,
            key: key.to_string(),
            value: Bytes::new(),
            revision,
        };
        state.log.push(event.clone());
        let _ = sender.send(event);
        Ok(revision)
    }

    /// Whether `close` has been called
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.sender.is_none()
    }

    /// Number of `close` calls, including ones on an already closed store
    pub async fn close_count(&self) -> usize {
        self.state.lock().await.closes
    }
}

fn closed() -> BridgeError {
    BridgeError::Store("store is closed".to_string())
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>> {
        let state = self.state.lock().await;
        if state.sender.is_none() {
            return Err(closed());
        }
        Ok(state.entries.get(key).cloned())
    }

    async fn watch(&self, key: &str, from_revision: u64) -> Result<ConfigWatch> {
        let state = self.state.lock().await;
        let sender = state.sender.as_ref().ok_or_else(closed)?;

        // Subscribe and snapshot under the same lock so no change is
        // missed or seen twice.
        let receiver = sender.subscribe();
        let replay: Vec<Result<StoreEvent>> = state
            .log
            .iter()
            .filter(|e| e.key == key && e.revision >= from_revision)
            .cloned()
            .map(Ok)
            .collect();

        let watched = key.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let item = match item {
                Ok(event) if event.key == watched => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(BridgeError::Store(
                    format!("watch fell behind by {} changes", n),
                ))),
            };
            futures::future::ready(item)
        });

        Ok(futures::stream::iter(replay).chain(live).boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.sender = None;
        state.closes += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_get_revisions() {
        let store = MemoryConfigStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        let r1 = store.put("k", "v1").await.unwrap();
        let r2 = store.put("other", "x").await.unwrap();
        let r3 = store.put("k", "v2").await.unwrap();
        assert!(r1 < r2 && r2 < r3);

        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.value, Bytes::from("v2"));
        assert_eq!(entry.revision, r3);

        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision_then_follows() {
        let store = MemoryConfigStore::new();
        let r1 = store.put("k", "v1").await.unwrap();
        store.put("k", "v2").await.unwrap();

        let mut watch = store.watch("k", r1 + 1).await.unwrap();
        let first = watch.next().await.unwrap().unwrap();
        assert_eq!(first.value, Bytes::from("v2"));

        store.put("unrelated", "x").await.unwrap();
        store.delete("k").await.unwrap();

        let second = tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.kind, StoreEventKind::Delete);
        assert_eq!(second.key, "k");
    }

    #[tokio::test]
    async fn test_close_ends_watch_and_rejects_calls() {
        let store = MemoryConfigStore::new();
        store.put("k", "v1").await.unwrap();
        let mut watch = store.watch("k", 2).await.unwrap();

        store.close().await.unwrap();
        assert!(store.is_closed().await);

        let end = tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .unwrap();
        assert!(end.is_none());

        assert!(store.get("k").await.is_err());
        assert!(store.watch("k", 1).await.is_err());
        assert!(store.put("k", "v2").await.is_err());

        store.close().await.unwrap();
        assert_eq!(store.close_count().await, 2);
    }
}
