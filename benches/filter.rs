//! Performance benchmarks for a3s-alert
//!
//! Run with: cargo bench

use a3s_alert::publisher::{is_at_all, render_log_alert, should_alert, LogAlert};
use a3s_alert::{
    AlertDispatcher, AlertPublisher, AtInfo, BodySchema, BridgeConfig, DispatcherOptions,
    MemorySink, RoutingPolicy,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;

fn policy() -> RoutingPolicy {
    RoutingPolicy {
        access_tokens: vec!["t1".to_string(), "t2".to_string(), "t3".to_string()],
        filter_keys: vec!["ERROR".to_string(), "FATAL".to_string(), "panic".to_string()],
        ignore_keys: vec!["heartbeat".to_string(), "ignore-me".to_string()],
        not_at_keys: vec!["timeout".to_string()],
        ..Default::default()
    }
}

fn bench_filter(c: &mut Criterion) {
    let policy = policy();
    let hit = "2024-05-01 12:00:00 [battle-3] ERROR attempt to index a nil value (field 'hp')";
    let miss = "2024-05-01 12:00:00 [battle-3] INFO player 1042 joined room 77";

    c.bench_function("should_alert hit", |b| {
        b.iter(|| should_alert(black_box(&policy), black_box(hit)))
    });

    c.bench_function("should_alert miss", |b| {
        b.iter(|| should_alert(black_box(&policy), black_box(miss)))
    });

    c.bench_function("is_at_all", |b| {
        b.iter(|| is_at_all(black_box(&policy), black_box(hit)))
    });
}

fn bench_render(c: &mut Criterion) {
    let alert = LogAlert {
        machine_name: Some("gs-01"),
        game_platform: "ios",
        node_name: "battle-3",
        file_path: "/var/log/game/battle.log",
        message: "ERROR attempt to index a nil value (field 'hp')",
    };

    c.bench_function("render markdown", |b| {
        b.iter(|| render_log_alert(black_box(&alert), BodySchema::Markdown, AtInfo::default()))
    });

    let rendered = render_log_alert(&alert, BodySchema::Text, AtInfo::default());
    c.bench_function("alert serialize", |b| {
        b.iter(|| serde_json::to_vec(black_box(&rendered)).unwrap())
    });
}

fn bench_config_parse(c: &mut Criterion) {
    let raw = serde_json::json!({
        "nsqd-tcp-addresses": ["nats://127.0.0.1:4222"],
        "topics": ["game-log", "battle-log"],
        "topic-patterns": ["^game-", "-log$"],
        "filter": policy(),
    })
    .to_string();

    c.bench_function("BridgeConfig::parse", |b| {
        b.iter(|| BridgeConfig::parse(black_box(raw.as_bytes())).unwrap())
    });
}

fn bench_handle_message(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let publisher = rt.block_on(async {
        let dispatcher = AlertDispatcher::new(Arc::new(MemorySink::new()), DispatcherOptions::default());
        Arc::new(AlertPublisher::new(policy(), dispatcher))
    });

    // Filtered out before reaching the queue, so the sink stays empty
    let payload = serde_json::json!({
        "gamePlatform": "ios",
        "nodeName": "battle-3",
        "message": "INFO player joined",
        "log": {"file": {"path": "/var/log/game/battle.log"}}
    })
    .to_string();

    c.bench_function("AlertPublisher::handle_message filtered", |b| {
        b.to_async(&rt).iter(|| {
            let publisher = publisher.clone();
            let payload = payload.clone();
            async move { publisher.handle_message(payload.as_bytes()).await.unwrap() }
        });
    });
}

criterion_group!(
    benches,
    bench_filter,
    bench_render,
    bench_config_parse,
    bench_handle_message
);
criterion_main!(benches);
