//! # a3s-alert
//!
//! Hot-reloadable bridge from message-bus topics to chat-webhook alerts.
//!
//! ## Overview
//!
//! `a3s-alert` subscribes to bus topics, filters each message against a
//! routing policy and posts matching ones to a chat webhook (the DingTalk
//! robot API by default). The topic list and the routing policy live in a
//! watched config store, so both change without a restart.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_alert::{
//!     AlertDispatcher, AlertPublisher, DiscovererOptions, DispatcherOptions, MemoryBus,
//!     MemoryConfigStore, MemorySink, RoutingPolicy, TopicDiscoverer,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> a3s_alert::Result<()> {
//! let store = Arc::new(MemoryConfigStore::new());
//! store
//!     .put(
//!         "config.alert-bridge.default",
//!         r#"{"nsqd-tcp-addresses": ["nats://127.0.0.1:4222"], "topics": ["game-log"]}"#,
//!     )
//!     .await?;
//!
//! let dispatcher = AlertDispatcher::new(Arc::new(MemorySink::new()), DispatcherOptions::default());
//! let publisher = Arc::new(AlertPublisher::new(RoutingPolicy::default(), dispatcher));
//! let discoverer = TopicDiscoverer::new(
//!     store,
//!     Arc::new(MemoryBus::new()),
//!     publisher,
//!     DiscovererOptions::default(),
//! );
//!
//! let shutdown = CancellationToken::new();
//! let (_reload_tx, reload_rx) = tokio::sync::mpsc::channel(1);
//! discoverer.run(shutdown, reload_rx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **nats**: NATS JetStream pull consumers for the bus, a JetStream KV
//!   bucket for the config store
//! - **memory**: in-process bus, config store and webhook sink for tests
//!
//! ## Architecture
//!
//! - **TopicDiscoverer**: reads and watches the config, runs one pipeline
//!   per topic, handles terminate and reload
//! - **ConsumptionPipeline**: one topic's subscription and control loop
//! - **AlertPublisher**: filter, credential rotation, rendering
//! - **AlertDispatcher**: bounded, concurrency-limited webhook delivery

pub mod config;
pub mod discoverer;
pub mod dlq;
pub mod error;
pub mod pipeline;
pub mod provider;
pub mod publisher;
pub mod store;
pub mod types;

// Re-export core types
pub use config::{BridgeConfig, BusAddresses, RoutingPolicy};
pub use discoverer::{DiscovererOptions, ReloadPolicy, TopicDiscoverer, DEFAULT_CONFIG_KEY};
pub use dlq::{BusDlqHandler, DeadLetterMessage, DlqHandler, MemoryDlqHandler};
pub use error::{BridgeError, Result};
pub use pipeline::{
    ConsumptionPipeline, FailurePolicy, MessageHandler, PipelineHandle, PipelineOptions,
};
pub use provider::{BusConnector, BusProvider, PendingMessage, Subscription};
pub use publisher::{
    AlertDispatcher, AlertPublisher, DispatcherOptions, HttpWebhook, LogAlert, MemorySink,
    WebhookReply, WebhookSink,
};
pub use store::{ConfigStore, MemoryConfigStore, NatsKvStore, StoreEntry, StoreEvent};
pub use types::{AlertEnvelope, AtInfo, BodySchema, BusMessage, OutboundAlert};

// Re-export backends for convenience
pub use provider::memory::{DeliveryOutcome, MemoryBus};
pub use provider::nats::{NatsClient, NatsConfig, NatsConnector, NatsProvider, StorageType};
