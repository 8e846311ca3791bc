//! Topic discovery and pipeline lifecycle
//!
//! `TopicDiscoverer` reads the bridge config from the store, keeps
//! following it, and makes sure every discovered topic has a running
//! `ConsumptionPipeline`. It owns the refresh timer and turns process
//! signals (terminate, reload) into pipeline signals.

use crate::config::{BridgeConfig, BusAddresses, MAX_TOPIC_REFRESH_SECS};
use crate::dlq::DlqHandler;
use crate::error::{BridgeError, Result};
use crate::pipeline::{ConsumptionPipeline, MessageHandler, PipelineHandle, PipelineOptions};
use crate::provider::{BusConnector, BusProvider};
use crate::publisher::AlertPublisher;
use crate::store::{ConfigStore, ConfigWatch, StoreEventKind};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default config key
pub const DEFAULT_CONFIG_KEY: &str = "config.alert-bridge.default";

/// What a reload signal does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReloadPolicy {
    /// Re-read the config, signal every pipeline and keep discovering
    #[default]
    Refresh,
    /// Stop watching, close the store, signal every pipeline and stop
    /// discovering; running pipelines keep consuming until terminated
    Detach,
}

#[derive(Debug, Clone)]
pub struct DiscovererOptions {
    /// Key the config is stored under
    pub config_key: String,
    pub pipeline: PipelineOptions,
    pub reload_policy: ReloadPolicy,
}

impl Default for DiscovererOptions {
    fn default() -> Self {
        Self {
            config_key: DEFAULT_CONFIG_KEY.to_string(),
            pipeline: PipelineOptions::default(),
            reload_policy: ReloadPolicy::default(),
        }
    }
}

type SharedConfig = Arc<RwLock<Option<Arc<BridgeConfig>>>>;

struct WatchTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Discovers topics and runs one pipeline per topic
pub struct TopicDiscoverer {
    store: Arc<dyn ConfigStore>,
    connector: Arc<dyn BusConnector>,
    publisher: Arc<AlertPublisher>,
    handler: Arc<dyn MessageHandler>,
    dlq: Option<Arc<dyn DlqHandler>>,
    options: DiscovererOptions,

    config: SharedConfig,
    bus: Option<(BusAddresses, Arc<dyn BusProvider>)>,
    pipelines: HashMap<String, PipelineHandle>,
    tasks: JoinSet<(String, Result<()>)>,
    /// Parent of every pipeline's terminate token
    pipeline_root: CancellationToken,
    watch: Option<WatchTask>,
    store_closed: bool,
}

impl TopicDiscoverer {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        connector: Arc<dyn BusConnector>,
        publisher: Arc<AlertPublisher>,
        options: DiscovererOptions,
    ) -> Self {
        let handler: Arc<dyn MessageHandler> = publisher.clone();
        Self {
            store,
            connector,
            publisher,
            handler,
            dlq: None,
            options,
            config: Arc::new(RwLock::new(None)),
            bus: None,
            pipelines: HashMap::new(),
            tasks: JoinSet::new(),
            pipeline_root: CancellationToken::new(),
            watch: None,
            store_closed: false,
        }
    }

    /// Handle messages with something other than the publisher
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Dead letter handler used under `FailurePolicy::DeadLetter`
    pub fn with_dlq(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Active config, if one has been read
    pub async fn config(&self) -> Option<Arc<BridgeConfig>> {
        self.config.read().await.clone()
    }

    /// Topics that have a pipeline, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.pipelines.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Read the config, apply it and start following the key
    ///
    /// Fails if the key is missing or its value is not a valid config.
    pub async fn init_and_watch(&mut self) -> Result<()> {
        let key = self.options.config_key.clone();
        let entry = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| BridgeError::ConfigNotFound(key.clone()))?;

        let config = BridgeConfig::parse(&entry.value)?;
        tracing::info!(
            key = %key,
            revision = entry.revision,
            topics = ?config.topics,
            patterns = ?config.topic_patterns,
            "Config loaded"
        );
        apply_config(&self.config, &self.publisher, config).await;

        let watch = self.store.watch(&key, entry.revision + 1).await?;
        let stop = CancellationToken::new();
        let task = tokio::spawn(watch_config(
            watch,
            key,
            self.config.clone(),
            self.publisher.clone(),
            stop.clone(),
        ));
        self.watch = Some(WatchTask { stop, task });
        Ok(())
    }

    /// Start a pipeline for every topic that does not have one
    ///
    /// Returns how many pipelines were started. Subscribe failures are
    /// logged and retried on the next refresh. A topic whose pipeline
    /// ended because its subscription closed has no pipeline any more,
    /// so it is subscribed again here.
    pub async fn update_topics(&mut self, topics: &[String]) -> usize {
        let missing: Vec<&String> = topics
            .iter()
            .filter(|t| !self.pipelines.contains_key(t.as_str()))
            .collect();
        if missing.is_empty() {
            return 0;
        }

        let bus = match self.bus().await {
            Ok(bus) => bus,
            Err(e) => {
                tracing::warn!(error = %e, "Bus unavailable, topics deferred");
                return 0;
            }
        };

        let mut started = 0;
        for topic in missing {
            if self.pipelines.contains_key(topic.as_str()) {
                continue;
            }

            let subscribed = ConsumptionPipeline::subscribe(
                bus.as_ref(),
                topic,
                &self.options.pipeline,
                self.handler.clone(),
                self.dlq.clone(),
                self.pipeline_root.child_token(),
            )
            .await;

            let (pipeline, handle) = match subscribed {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "Subscribe failed, will retry");
                    continue;
                }
            };

            let name = topic.clone();
            self.tasks.spawn(async move {
                let result = pipeline.run().await;
                (name, result)
            });
            self.pipelines.insert(topic.clone(), handle);
            started += 1;
        }

        if started > 0 {
            tracing::info!(started, total = self.pipelines.len(), "Topics updated");
        }
        started
    }

    /// Configured topics plus bus topics matching a configured pattern
    ///
    /// Configured names come first; duplicates are dropped.
    pub async fn resolve_topics(&mut self) -> Vec<String> {
        let Some(config) = self.config().await else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut topics: Vec<String> = config
            .topics
            .iter()
            .filter(|t| seen.insert(t.to_string()))
            .cloned()
            .collect();

        if config.topic_patterns.is_empty() {
            return topics;
        }

        let patterns = match config.compiled_patterns() {
            Ok(patterns) => patterns,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid topic pattern");
                return topics;
            }
        };

        let listed = match self.bus().await {
            Ok(bus) => bus.list_topics().await,
            Err(e) => Err(e),
        };

        match listed {
            Ok(available) => {
                for topic in available {
                    if patterns.iter().any(|p| p.is_match(&topic)) && seen.insert(topic.clone()) {
                        topics.push(topic);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list bus topics"),
        }

        topics
    }

    /// Resolve topics and start what is missing
    pub async fn refresh(&mut self) -> usize {
        let topics = self.resolve_topics().await;
        self.update_topics(&topics).await
    }

    /// Run until terminate, a detaching reload, or a fatal pipeline error
    ///
    /// A pipeline that ends cleanly is forgotten and its topic is picked
    /// up again by the next refresh. Returns only after every pipeline
    /// task has finished.
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
        mut reload: mpsc::Receiver<()>,
    ) -> Result<()> {
        self.init_and_watch().await?;
        self.refresh().await;

        let mut period = self.refresh_interval().await;
        let mut ticker = refresh_ticker(period);

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Terminate requested");
                    self.shutdown_all().await;
                    break Ok(());
                }
                Some(()) = reload.recv() => match self.options.reload_policy {
                    ReloadPolicy::Refresh => {
                        tracing::info!("Reload requested, refreshing config");
                        if let Err(e) = self.reload_config().await {
                            tracing::warn!(error = %e, "Reload failed, keeping current config");
                        }
                        self.signal_reload();
                        self.refresh().await;
                    }
                    ReloadPolicy::Detach => {
                        tracing::info!("Reload requested, detaching from config store");
                        self.stop_watch().await;
                        self.close_store().await;
                        self.signal_reload();
                        break Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.refresh().await;
                    let configured = self.refresh_interval().await;
                    if configured != period {
                        tracing::info!(?configured, "Topic refresh interval changed");
                        period = configured;
                        ticker = refresh_ticker(period);
                    }
                }
                Some(joined) = self.tasks.join_next() => {
                    if let Err(e) = self.on_pipeline_exit(joined) {
                        self.shutdown_all().await;
                        break Err(e);
                    }
                }
            }
        };

        self.wait_pipelines(&shutdown).await;
        tracing::info!("Discoverer stopped");
        outcome
    }

    async fn refresh_interval(&self) -> Duration {
        self.config()
            .await
            .map(|c| c.refresh_interval())
            .unwrap_or(Duration::from_secs(crate::config::DEFAULT_TOPIC_REFRESH_SECS))
    }

    /// Bus for the current config, reconnecting if its addresses changed
    async fn bus(&mut self) -> Result<Arc<dyn BusProvider>> {
        let config = self
            .config()
            .await
            .ok_or_else(|| BridgeError::Config("no config loaded".to_string()))?;
        let addresses = config.bus_addresses();

        if let Some((cached, bus)) = &self.bus {
            if *cached == addresses {
                return Ok(bus.clone());
            }
            tracing::info!(addresses = ?addresses, "Bus addresses changed, reconnecting");
        }

        let bus = self.connector.connect(&addresses).await?;
        tracing::info!(bus = bus.name(), addresses = ?addresses, "Bus connected");
        self.bus = Some((addresses, bus.clone()));
        Ok(bus)
    }

    async fn reload_config(&mut self) -> Result<()> {
        let key = &self.options.config_key;
        let entry = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| BridgeError::ConfigNotFound(key.clone()))?;
        let config = BridgeConfig::parse(&entry.value)?;
        apply_config(&self.config, &self.publisher, config).await;
        Ok(())
    }

    fn signal_reload(&self) {
        for handle in self.pipelines.values() {
            if !handle.reload() {
                tracing::debug!(topic = handle.topic(), "Reload already pending");
            }
        }
    }

    /// Forget a finished pipeline; a failed one is fatal
    fn on_pipeline_exit(
        &mut self,
        joined: std::result::Result<(String, Result<()>), JoinError>,
    ) -> Result<()> {
        match joined {
            Ok((topic, Ok(()))) => {
                self.pipelines.remove(&topic);
                tracing::info!(topic = %topic, "Pipeline exited");
                Ok(())
            }
            Ok((topic, Err(e))) => {
                self.pipelines.remove(&topic);
                tracing::error!(topic = %topic, error = %e, "Pipeline failed");
                Err(e)
            }
            Err(e) => {
                tracing::error!(error = %e, "Pipeline task panicked");
                Err(BridgeError::Handler {
                    topic: "unknown".to_string(),
                    reason: format!("pipeline task failed: {}", e),
                })
            }
        }
    }

    async fn stop_watch(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.stop.cancel();
            if let Err(e) = watch.task.await {
                tracing::warn!(error = %e, "Config watch task failed");
            }
        }
    }

    async fn close_store(&mut self) {
        if self.store_closed {
            return;
        }
        self.store_closed = true;
        if let Err(e) = self.store.close().await {
            tracing::warn!(store = self.store.name(), error = %e, "Failed to close config store");
        }
    }

    async fn shutdown_all(&mut self) {
        self.stop_watch().await;
        self.close_store().await;
        self.pipeline_root.cancel();
    }

    /// Wait for every pipeline task; terminate still cancels them
    async fn wait_pipelines(&mut self, shutdown: &CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled(), if !self.pipeline_root.is_cancelled() => {
                    tracing::info!("Terminate requested");
                    self.pipeline_root.cancel();
                }
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => {
                        // Already shutting down; errors are only logged
                        let _ = self.on_pipeline_exit(joined);
                    }
                    None => break,
                },
            }
        }
    }
}

fn refresh_ticker(period: Duration) -> Interval {
    let period = period.min(Duration::from_secs(MAX_TOPIC_REFRESH_SECS));
    let now = Instant::now();
    let mut ticker = interval_at(now.checked_add(period).unwrap_or(now), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn apply_config(shared: &SharedConfig, publisher: &AlertPublisher, config: BridgeConfig) {
    publisher.update_routing_policy(config.filter.clone()).await;
    *shared.write().await = Some(Arc::new(config));
}

/// Follow the config key, applying every valid update
async fn watch_config(
    mut watch: ConfigWatch,
    key: String,
    shared: SharedConfig,
    publisher: Arc<AlertPublisher>,
    stop: CancellationToken,
) {
    tracing::debug!(key = %key, "Config watch started");

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = watch.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Config watch error");
                continue;
            }
            None => {
                tracing::info!(key = %key, "Config watch closed");
                break;
            }
        };

        match event.kind {
            StoreEventKind::Put => match BridgeConfig::parse(&event.value) {
                Ok(config) => {
                    tracing::info!(
                        key = %key,
                        revision = event.revision,
                        topics = ?config.topics,
                        "Config updated"
                    );
                    apply_config(&shared, &publisher, config).await;
                }
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        revision = event.revision,
                        error = %e,
                        "Ignoring invalid config update"
                    );
                }
            },
            StoreEventKind::Delete => {
                tracing::warn!(
                    key = %key,
                    revision = event.revision,
                    "Config key deleted, keeping last config"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingPolicy;
    use crate::provider::memory::MemoryBus;
    use crate::publisher::{AlertDispatcher, DispatcherOptions, MemorySink};
    use crate::store::MemoryConfigStore;

    fn config_json(topics: &[&str], patterns: &[&str], tokens: &[&str]) -> String {
        serde_json::json!({
            "nsqd-tcp-addresses": ["nats://127.0.0.1:4222"],
            "topics": topics,
            "topic-patterns": patterns,
            "topic-refresh-interval": 1,
            "filter": {
                "http-access-tokens": tokens,
                "filterKeys": ["ERROR"]
            }
        })
        .to_string()
    }

    async fn discoverer(store: Arc<MemoryConfigStore>, bus: &MemoryBus) -> TopicDiscoverer {
        let dispatcher = AlertDispatcher::new(Arc::new(MemorySink::new()), DispatcherOptions::default());
        let publisher = Arc::new(AlertPublisher::new(RoutingPolicy::default(), dispatcher));
        TopicDiscoverer::new(
            store,
            Arc::new(bus.clone()),
            publisher,
            DiscovererOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_init_requires_config_key() {
        let store = Arc::new(MemoryConfigStore::new());
        let mut d = discoverer(store, &MemoryBus::new()).await;
        let err = d.init_and_watch().await.unwrap_err();
        assert!(matches!(err, BridgeError::ConfigNotFound(ref k) if k == DEFAULT_CONFIG_KEY));
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let store = Arc::new(MemoryConfigStore::new());
        store.put(DEFAULT_CONFIG_KEY, "{not json").await.unwrap();
        let mut d = discoverer(store, &MemoryBus::new()).await;
        assert!(d.init_and_watch().await.is_err());
    }

    #[tokio::test]
    async fn test_init_applies_policy() {
        let store = Arc::new(MemoryConfigStore::new());
        store
            .put(DEFAULT_CONFIG_KEY, config_json(&["a"], &[], &["t1", "t2"]))
            .await
            .unwrap();
        let mut d = discoverer(store, &MemoryBus::new()).await;
        d.init_and_watch().await.unwrap();

        assert_eq!(d.config().await.unwrap().topics, vec!["a"]);
        assert_eq!(d.publisher.policy().await.access_tokens, vec!["t1", "t2"]);
        d.stop_watch().await;
    }

    #[tokio::test]
    async fn test_update_topics_is_idempotent() {
        let store = Arc::new(MemoryConfigStore::new());
        store
            .put(DEFAULT_CONFIG_KEY, config_json(&["a"], &[], &[]))
            .await
            .unwrap();
        let bus = MemoryBus::new();
        let mut d = discoverer(store, &bus).await;
        d.init_and_watch().await.unwrap();

        let topics = vec!["a".to_string()];
        assert_eq!(d.update_topics(&topics).await, 1);
        assert_eq!(d.update_topics(&topics).await, 0);
        assert_eq!(d.topics(), vec!["a"]);
        assert_eq!(bus.subscriptions("a").await, 1);
        assert_eq!(bus.connections().await.len(), 1);

        d.shutdown_all().await;
        d.wait_pipelines(&CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_ended_pipeline_is_resubscribed() {
        let store = Arc::new(MemoryConfigStore::new());
        store
            .put(DEFAULT_CONFIG_KEY, config_json(&["a"], &[], &[]))
            .await
            .unwrap();
        let bus = MemoryBus::new();
        let mut d = discoverer(store, &bus).await;
        d.init_and_watch().await.unwrap();

        let topics = vec!["a".to_string()];
        assert_eq!(d.update_topics(&topics).await, 1);

        bus.close_topic("a").await;
        let joined = tokio::time::timeout(Duration::from_secs(2), d.tasks.join_next())
            .await
            .unwrap()
            .unwrap();
        d.on_pipeline_exit(joined).unwrap();
        assert!(d.topics().is_empty());

        bus.reopen_topic("a").await;
        assert_eq!(d.refresh().await, 1);
        assert_eq!(d.topics(), vec!["a"]);
        assert_eq!(bus.subscriptions("a").await, 2);

        d.shutdown_all().await;
        d.wait_pipelines(&CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_refresh_ticker_caps_period() {
        let ticker = refresh_ticker(Duration::from_secs(u64::MAX));
        assert_eq!(ticker.period(), Duration::from_secs(MAX_TOPIC_REFRESH_SECS));
    }

    #[tokio::test]
    async fn test_resolve_topics_with_patterns() {
        let store = Arc::new(MemoryConfigStore::new());
        store
            .put(DEFAULT_CONFIG_KEY, config_json(&["b", "a"], &["^game-"], &[]))
            .await
            .unwrap();
        let bus = MemoryBus::new();
        for topic in ["game-2", "other", "game-1", "a"] {
            bus.create_topic(topic).await;
        }
        let mut d = discoverer(store, &bus).await;
        d.init_and_watch().await.unwrap();

        assert_eq!(d.resolve_topics().await, vec!["b", "a", "game-1", "game-2"]);
        d.stop_watch().await;
    }
}
