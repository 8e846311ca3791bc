//! Watched configuration store
//!
//! The bridge reads its configuration from a key in a versioned
//! key-value store and follows later revisions of that key. Backends
//! implement `ConfigStore`; `NatsKvStore` is the production backend and
//! `MemoryConfigStore` is used in tests.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub mod memory;
pub mod nats;

pub use memory::MemoryConfigStore;
pub use nats::NatsKvStore;

/// Current value of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: String,
    pub value: Bytes,
    /// Store revision of the write that produced this value
    pub revision: u64,
}

/// Kind of change observed on a watched key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Put,
    Delete,
}

/// One change observed on a watched key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: String,
    /// New value; empty for deletes
    pub value: Bytes,
    pub revision: u64,
}

/// Stream of changes for one key
///
/// Ends when the store is closed.
pub type ConfigWatch = BoxStream<'static, Result<StoreEvent>>;

/// Versioned key-value store the configuration is read from
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the current value of a key, `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>>;

    /// Watch a key for changes at or after `from_revision`
    async fn watch(&self, key: &str, from_revision: u64) -> Result<ConfigWatch>;

    /// Release the store connection; open watches end
    async fn close(&self) -> Result<()>;

    /// Backend name (e.g., "nats-kv", "memory")
    fn name(&self) -> &str;
}
