//! Bridge integration tests
//!
//! End-to-end runs of `TopicDiscoverer` on the in-memory bus, config
//! store and webhook sink: filtering, routing, config updates, reload
//! policies, failure policies and shutdown.

use a3s_alert::{
    AlertDispatcher, AlertPublisher, BridgeError, BusMessage, BusProvider, DiscovererOptions,
    DispatcherOptions, DlqHandler, FailurePolicy, MemoryBus, MemoryConfigStore, MemoryDlqHandler,
    MemorySink, MessageHandler, PipelineOptions, ReloadPolicy, RoutingPolicy,
    TopicDiscoverer, DEFAULT_CONFIG_KEY,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn config(topics: &[&str], tokens: &[&str]) -> String {
    config_every(topics, tokens, 1)
}

fn config_every(topics: &[&str], tokens: &[&str], refresh_secs: u64) -> String {
    serde_json::json!({
        "nsqd-tcp-addresses": ["nats://127.0.0.1:4222"],
        "topics": topics,
        "topic-refresh-interval": refresh_secs,
        "filter": {
            "url": "hooks.example.com/send",
            "protocol": "http",
            "http-access-tokens": tokens,
            "filterKeys": ["ERROR"],
            "ignoreKeys": ["ignore-me"],
            "schema": "text"
        }
    })
    .to_string()
}

struct Bridge {
    store: Arc<MemoryConfigStore>,
    bus: MemoryBus,
    sink: Arc<MemorySink>,
    publisher: Arc<AlertPublisher>,
    shutdown: CancellationToken,
    reload: mpsc::Sender<()>,
    run: JoinHandle<a3s_alert::Result<()>>,
}

struct BridgeBuilder {
    store: Arc<MemoryConfigStore>,
    bus: MemoryBus,
    options: DiscovererOptions,
    handler: Option<Arc<dyn MessageHandler>>,
    dlq: Option<Arc<dyn DlqHandler>>,
}

impl BridgeBuilder {
    async fn new(raw_config: String) -> Self {
        let store = Arc::new(MemoryConfigStore::new());
        store.put(DEFAULT_CONFIG_KEY, raw_config).await.unwrap();
        Self {
            store,
            bus: MemoryBus::new(),
            options: DiscovererOptions::default(),
            handler: None,
            dlq: None,
        }
    }

    fn reload_policy(mut self, policy: ReloadPolicy) -> Self {
        self.options.reload_policy = policy;
        self
    }

    fn failure(mut self, failure: FailurePolicy) -> Self {
        self.options.pipeline = PipelineOptions {
            failure,
            ..PipelineOptions::default()
        };
        self
    }

    fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn dlq(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    fn start(self) -> Bridge {
        let sink = Arc::new(MemorySink::new());
        let dispatcher = AlertDispatcher::new(sink.clone(), DispatcherOptions::default());
        let publisher = Arc::new(AlertPublisher::new(RoutingPolicy::default(), dispatcher));

        let mut discoverer = TopicDiscoverer::new(
            self.store.clone(),
            Arc::new(self.bus.clone()),
            publisher.clone(),
            self.options,
        );
        if let Some(handler) = self.handler {
            discoverer = discoverer.with_handler(handler);
        }
        if let Some(dlq) = self.dlq {
            discoverer = discoverer.with_dlq(dlq);
        }

        let shutdown = CancellationToken::new();
        let (reload, reload_rx) = mpsc::channel(1);
        let run = tokio::spawn(discoverer.run(shutdown.clone(), reload_rx));

        Bridge {
            store: self.store,
            bus: self.bus,
            sink,
            publisher,
            shutdown,
            reload,
            run,
        }
    }
}

impl Bridge {
    async fn publish(&self, topic: &str, payload: &str) {
        self.bus
            .publish(topic, payload.to_string().into())
            .await
            .unwrap();
    }

    async fn stop(self) -> a3s_alert::Result<()> {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.run)
            .await
            .expect("discoverer did not stop")
            .unwrap()
    }
}

/// Poll a condition until it holds or `WAIT` passes
macro_rules! eventually {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if $cond {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }};
}

/// Fails every message whose payload contains "bad"
#[derive(Default)]
struct PickyHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for PickyHandler {
    async fn handle(&self, message: &BusMessage) -> a3s_alert::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if message.text().contains("bad") {
            return Err(BridgeError::Handler {
                topic: message.topic.clone(),
                reason: "bad payload".to_string(),
            });
        }
        Ok(())
    }
}

/// Takes a while per message and records when it finished
#[derive(Default)]
struct SlowHandler {
    started: AtomicBool,
    finished: AtomicBool,
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, _message: &BusMessage) -> a3s_alert::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Filtering & Routing ─────────────────────────────────────────

#[tokio::test]
async fn test_matching_message_is_alerted_and_finished() {
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1"]))
        .await
        .start();

    bridge.publish("game-log", "ERROR: disk full").await;

    let requests = bridge.sink.wait_for(1, WAIT).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "http://hooks.example.com/send?access_token=t1");
    assert_eq!(requests[0].1.content(), "ERROR: disk full");
    assert!(requests[0].1.at().is_at_all);

    let bus = bridge.bus.clone();
    assert!(eventually!(bus.acked("game-log").await == 1));

    tokio_test::assert_ok!(bridge.stop().await);
}

#[tokio::test]
async fn test_ignored_and_unmatched_messages_are_finished_silently() {
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1"]))
        .await
        .start();

    bridge.publish("game-log", "ERROR ignore-me disk full").await;
    bridge.publish("game-log", "not json").await;
    bridge.publish("game-log", "ERROR: last one").await;

    // Messages are handled in order, so the third alert proves the
    // first two produced none
    let requests = bridge.sink.wait_for(1, WAIT).await;
    let bus = bridge.bus.clone();
    assert!(eventually!(bus.acked("game-log").await == 3));

    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.content(), "ERROR: last one");
    assert_eq!(bridge.sink.requests().await.len(), 1);
    assert_eq!(bridge.bus.requeued("game-log").await, 0);

    tokio_test::assert_ok!(bridge.stop().await);
}

#[tokio::test]
async fn test_structured_alert_rotates_tokens() {
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1", "t2"]))
        .await
        .start();

    let envelope = serde_json::json!({
        "machineName": "host-7",
        "gamePlatform": "ios",
        "nodeName": "battle-3",
        "message": "ERROR nil index",
        "log": {"file": {"path": "/var/log/battle.log"}}
    })
    .to_string();
    bridge.publish("game-log", &envelope).await;
    bridge.publish("game-log", &envelope).await;

    let requests = bridge.sink.wait_for(2, WAIT).await;
    assert_eq!(requests.len(), 2);

    let mut urls: Vec<&str> = requests.iter().map(|(url, _)| url.as_str()).collect();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "http://hooks.example.com/send?access_token=t1",
            "http://hooks.example.com/send?access_token=t2",
        ]
    );

    let text = requests[0].1.content();
    assert!(text.starts_with("ios platform battle-3 node error report"));
    assert!(text.contains("machine: host-7"));
    assert!(text.contains("file: /var/log/battle.log"));
    assert!(text.ends_with("ERROR nil index"));

    tokio_test::assert_ok!(bridge.stop().await);
}

// ─── Config Updates ──────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_update_is_ignored_and_valid_one_applied() {
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1"]))
        .await
        .start();

    let publisher = bridge.publisher.clone();
    assert!(
        eventually!(publisher.policy().await.access_tokens == vec!["t1"])
    );

    bridge
        .store
        .put(DEFAULT_CONFIG_KEY, "{definitely not json")
        .await
        .unwrap();
    bridge
        .store
        .put(DEFAULT_CONFIG_KEY, config(&["game-log"], &["t9"]))
        .await
        .unwrap();

    assert!(
        eventually!(publisher.policy().await.access_tokens == vec!["t9"])
    );

    bridge.publish("game-log", "ERROR after update").await;
    let requests = bridge.sink.wait_for(1, WAIT).await;
    assert_eq!(requests[0].0, "http://hooks.example.com/send?access_token=t9");

    tokio_test::assert_ok!(bridge.stop().await);
}

#[tokio::test]
async fn test_new_topic_is_picked_up_on_refresh() {
    let bridge = BridgeBuilder::new(config(&["a"], &["t1"])).await.start();

    let bus = bridge.bus.clone();
    assert!(eventually!(bus.subscriptions("a").await == 1));

    bridge
        .store
        .put(DEFAULT_CONFIG_KEY, config(&["a", "b"], &["t1"]))
        .await
        .unwrap();

    assert!(eventually!(bus.subscriptions("b").await == 1));
    assert_eq!(bus.subscriptions("a").await, 1);

    tokio_test::assert_ok!(bridge.stop().await);
}

#[tokio::test]
async fn test_deleted_config_key_keeps_last_config() {
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1"]))
        .await
        .start();

    let bus = bridge.bus.clone();
    assert!(eventually!(bus.subscriptions("game-log").await == 1));

    bridge.store.delete(DEFAULT_CONFIG_KEY).await.unwrap();
    // Long enough for the delete event and one refresh tick
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(!bridge.run.is_finished());
    assert_eq!(bridge.publisher.policy().await.access_tokens, vec!["t1"]);
    assert_eq!(bus.subscriptions("game-log").await, 1);

    bridge.publish("game-log", "ERROR after delete").await;
    let requests = bridge.sink.wait_for(1, WAIT).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "http://hooks.example.com/send?access_token=t1");

    // The watch survives the delete
    bridge
        .store
        .put(DEFAULT_CONFIG_KEY, config(&["game-log"], &["t2"]))
        .await
        .unwrap();
    let publisher = bridge.publisher.clone();
    assert!(eventually!(publisher.policy().await.access_tokens == vec!["t2"]));

    tokio_test::assert_ok!(bridge.stop().await);
}

#[tokio::test]
async fn test_changed_refresh_interval_keeps_discovering() {
    let bridge = BridgeBuilder::new(config(&["a"], &["t1"])).await.start();

    let bus = bridge.bus.clone();
    assert!(eventually!(bus.subscriptions("a").await == 1));

    bridge
        .store
        .put(DEFAULT_CONFIG_KEY, config_every(&["a", "b"], &["t1"], 2))
        .await
        .unwrap();
    assert!(eventually!(bus.subscriptions("b").await == 1));

    bridge
        .store
        .put(DEFAULT_CONFIG_KEY, config_every(&["a", "b", "c"], &["t1"], 1))
        .await
        .unwrap();
    assert!(eventually!(bus.subscriptions("c").await == 1));

    assert_eq!(bus.subscriptions("a").await, 1);
    assert_eq!(bus.subscriptions("b").await, 1);
    assert!(!bridge.run.is_finished());

    tokio_test::assert_ok!(bridge.stop().await);
}

#[tokio::test]
async fn test_oversized_refresh_interval_update_is_ignored() {
    let bridge = BridgeBuilder::new(config(&["a"], &["t1"])).await.start();

    let bus = bridge.bus.clone();
    assert!(eventually!(bus.subscriptions("a").await == 1));

    bridge
        .store
        .put(DEFAULT_CONFIG_KEY, config_every(&["a", "b"], &["t9"], u64::MAX))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(!bridge.run.is_finished());
    assert_eq!(bridge.publisher.policy().await.access_tokens, vec!["t1"]);
    assert_eq!(bus.subscriptions("b").await, 0);

    tokio_test::assert_ok!(bridge.stop().await);
}

// ─── Reload & Terminate ──────────────────────────────────────────

#[tokio::test]
async fn test_refresh_reload_keeps_running() {
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1"]))
        .await
        .reload_policy(ReloadPolicy::Refresh)
        .start();

    let bus = bridge.bus.clone();
    assert!(eventually!(bus.subscriptions("game-log").await == 1));

    bridge.reload.send(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!bridge.run.is_finished());
    assert!(!bridge.store.is_closed().await);

    bridge.publish("game-log", "ERROR after reload").await;
    let requests = bridge.sink.wait_for(1, WAIT).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(bus.subscriptions("game-log").await, 1);

    tokio_test::assert_ok!(bridge.stop().await);
}

#[tokio::test]
async fn test_detach_reload_closes_store_and_keeps_consuming() {
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1"]))
        .await
        .reload_policy(ReloadPolicy::Detach)
        .start();

    let bus = bridge.bus.clone();
    assert!(eventually!(bus.subscriptions("game-log").await == 1));

    bridge.reload.send(()).await.unwrap();
    let store = bridge.store.clone();
    assert!(eventually!(store.is_closed().await));
    assert_eq!(store.close_count().await, 1);

    // Pipelines outlive the detach until terminate
    bridge.publish("game-log", "ERROR after detach").await;
    let requests = bridge.sink.wait_for(1, WAIT).await;
    assert_eq!(requests.len(), 1);
    assert!(!bridge.run.is_finished());

    tokio_test::assert_ok!(bridge.stop().await);
    assert_eq!(store.close_count().await, 1);
}

#[tokio::test]
async fn test_terminate_waits_for_in_flight_message() {
    let handler = Arc::new(SlowHandler::default());
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1"]))
        .await
        .handler(handler.clone())
        .start();

    bridge.publish("game-log", "ERROR slow").await;
    let started = handler.clone();
    assert!(eventually!(started.started.load(Ordering::SeqCst)));

    let store = bridge.store.clone();
    let bus = bridge.bus.clone();
    tokio_test::assert_ok!(bridge.stop().await);

    assert!(handler.finished.load(Ordering::SeqCst));
    assert_eq!(bus.acked("game-log").await, 1);
    assert!(store.is_closed().await);
}

#[tokio::test]
async fn test_missing_config_key_fails_run() {
    let store = Arc::new(MemoryConfigStore::new());
    let dispatcher = AlertDispatcher::new(Arc::new(MemorySink::new()), DispatcherOptions::default());
    let publisher = Arc::new(AlertPublisher::new(RoutingPolicy::default(), dispatcher));
    let discoverer = TopicDiscoverer::new(
        store,
        Arc::new(MemoryBus::new()),
        publisher,
        DiscovererOptions::default(),
    );

    let (_reload, reload_rx) = mpsc::channel(1);
    let err = discoverer
        .run(CancellationToken::new(), reload_rx)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ConfigNotFound(_)));
}

// ─── Failure Policies ────────────────────────────────────────────

#[tokio::test]
async fn test_fail_fast_requeues_then_stops() {
    let handler = Arc::new(PickyHandler::default());
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1"]))
        .await
        .failure(FailurePolicy::FailFast)
        .handler(handler.clone())
        .start();

    bridge.publish("game-log", "bad").await;

    let result = tokio::time::timeout(WAIT, bridge.run)
        .await
        .expect("discoverer did not stop")
        .unwrap();
    assert!(matches!(result, Err(BridgeError::Handler { ref topic, .. }) if topic == "game-log"));

    assert!(bridge.bus.requeued("game-log").await >= 1);
    assert_eq!(bridge.bus.acked("game-log").await, 0);
    assert_eq!(bridge.bus.pending("game-log").await, 1);
    assert!(bridge.store.is_closed().await);
}

#[tokio::test]
async fn test_dead_letter_after_max_attempts() {
    let handler = Arc::new(PickyHandler::default());
    let dlq = Arc::new(MemoryDlqHandler::default());
    let bridge = BridgeBuilder::new(config(&["game-log"], &["t1"]))
        .await
        .failure(FailurePolicy::DeadLetter { max_attempts: 3 })
        .handler(handler.clone())
        .dlq(dlq.clone())
        .start();

    bridge.publish("game-log", "bad").await;
    bridge.publish("game-log", "good").await;

    let bus = bridge.bus.clone();
    assert!(eventually!(bus.acked("game-log").await == 2));

    assert_eq!(dlq.count().await.unwrap(), 1);
    let dead = dlq.list(10).await;
    assert_eq!(dead[0].message.text(), "bad");
    assert_eq!(dead[0].message.attempts, 3);
    assert_eq!(bus.requeued("game-log").await, 2);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 4);

    tokio_test::assert_ok!(bridge.stop().await);
}
