use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use a3s_alert::{
    AlertDispatcher, AlertPublisher, BusDlqHandler, BusProvider, DiscovererOptions,
    DispatcherOptions, DlqHandler, FailurePolicy, HttpWebhook, MemoryDlqHandler, NatsConfig,
    NatsConnector, NatsKvStore, NatsProvider, PipelineOptions, ReloadPolicy, RoutingPolicy,
    TopicDiscoverer,
};

#[derive(Parser)]
#[command(
    name = "a3s-alert",
    version,
    about = "Forward matching bus messages to a chat webhook"
)]
struct Cli {
    /// NATS server hosting the config bucket (comma-separated for a cluster)
    #[arg(long, env = "A3S_ALERT_NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    /// NATS authentication token
    #[arg(long, env = "A3S_ALERT_NATS_TOKEN", hide_env_values = true)]
    nats_token: Option<String>,

    /// Key-value bucket holding the config
    #[arg(long, env = "A3S_ALERT_KV_BUCKET", default_value = "alert-bridge")]
    kv_bucket: String,

    /// Config key inside the bucket
    #[arg(long, env = "A3S_ALERT_CONFIG_KEY", default_value = a3s_alert::DEFAULT_CONFIG_KEY)]
    config_key: String,

    /// JetStream stream carrying the topics
    #[arg(long, env = "A3S_ALERT_STREAM", default_value = "ALERT_BRIDGE")]
    stream: String,

    /// Subject prefix; topic `t` is read from `{prefix}.t`
    #[arg(long, env = "A3S_ALERT_SUBJECT_PREFIX", default_value = "alerts")]
    subject_prefix: String,

    /// Durable consumer name shared by every bridge instance
    #[arg(long, env = "A3S_ALERT_CHANNEL", default_value = a3s_alert::pipeline::DEFAULT_CHANNEL)]
    channel: String,

    /// Maximum unacknowledged messages per topic
    #[arg(long, env = "A3S_ALERT_MAX_IN_FLIGHT", default_value_t = 200)]
    max_in_flight: i64,

    /// What to do when a message cannot be handled
    #[arg(long, env = "A3S_ALERT_FAILURE_POLICY", value_enum, default_value_t = FailureMode::FailFast)]
    failure_policy: FailureMode,

    /// Delivery attempts before a message is dead-lettered
    #[arg(long, env = "A3S_ALERT_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u64,

    /// Topic dead letters are published to (kept in memory if unset)
    #[arg(long, env = "A3S_ALERT_DEAD_LETTER_TOPIC")]
    dead_letter_topic: Option<String>,

    /// What SIGHUP does
    #[arg(long, env = "A3S_ALERT_RELOAD_POLICY", value_enum, default_value_t = ReloadMode::Refresh)]
    reload_policy: ReloadMode,

    /// Outbound alert queue capacity
    #[arg(long, env = "A3S_ALERT_DISPATCH_QUEUE", default_value_t = a3s_alert::publisher::DEFAULT_QUEUE_CAPACITY)]
    dispatch_queue: usize,

    /// Concurrent webhook requests
    #[arg(long, env = "A3S_ALERT_DISPATCH_CONCURRENCY", default_value_t = a3s_alert::publisher::DEFAULT_CONCURRENCY)]
    dispatch_concurrency: usize,

    /// Webhook connect timeout in seconds
    #[arg(long, env = "A3S_ALERT_HTTP_CONNECT_TIMEOUT", default_value_t = 2)]
    http_connect_timeout: u64,

    /// Webhook request timeout in seconds
    #[arg(long, env = "A3S_ALERT_HTTP_REQUEST_TIMEOUT", default_value_t = 5)]
    http_request_timeout: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "A3S_ALERT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "A3S_ALERT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum FailureMode {
    FailFast,
    DeadLetter,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReloadMode {
    Refresh,
    Detach,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn nats_config(&self) -> NatsConfig {
        NatsConfig {
            servers: self
                .nats_url
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            token: self.nats_token.clone(),
            stream_name: self.stream.clone(),
            subject_prefix: self.subject_prefix.clone(),
            max_ack_pending: self.max_in_flight,
            ..Default::default()
        }
    }

    fn failure(&self) -> FailurePolicy {
        match self.failure_policy {
            FailureMode::FailFast => FailurePolicy::FailFast,
            FailureMode::DeadLetter => FailurePolicy::DeadLetter {
                max_attempts: self.max_attempts,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli).await {
        tracing::error!(error = %format!("{e:#}"), "a3s-alert exited with error");
        std::process::exit(1);
    }
}

fn init_tracing(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let nats = cli.nats_config();

    let store = NatsKvStore::connect(&nats, &cli.kv_bucket)
        .await
        .with_context(|| format!("opening config bucket '{}'", cli.kv_bucket))?;

    let webhook = HttpWebhook::new(
        Duration::from_secs(cli.http_connect_timeout),
        Duration::from_secs(cli.http_request_timeout),
    )?;
    let dispatcher = AlertDispatcher::new(
        Arc::new(webhook),
        DispatcherOptions {
            queue_capacity: cli.dispatch_queue,
            concurrency: cli.dispatch_concurrency,
        },
    );
    let publisher = Arc::new(AlertPublisher::new(RoutingPolicy::default(), dispatcher));

    let options = DiscovererOptions {
        config_key: cli.config_key.clone(),
        pipeline: PipelineOptions {
            channel: cli.channel.clone(),
            failure: cli.failure(),
        },
        reload_policy: match cli.reload_policy {
            ReloadMode::Refresh => ReloadPolicy::Refresh,
            ReloadMode::Detach => ReloadPolicy::Detach,
        },
    };

    let mut discoverer = TopicDiscoverer::new(
        Arc::new(store),
        Arc::new(NatsConnector::new(nats.clone())),
        publisher.clone(),
        options,
    );

    if let FailurePolicy::DeadLetter { max_attempts } = cli.failure() {
        let dlq: Arc<dyn DlqHandler> = match &cli.dead_letter_topic {
            Some(topic) => {
                let bus: Arc<dyn BusProvider> = Arc::new(
                    NatsProvider::connect(nats.clone())
                        .await
                        .context("connecting dead letter bus")?,
                );
                Arc::new(BusDlqHandler::new(bus, topic.clone()))
            }
            None => Arc::new(MemoryDlqHandler::default()),
        };
        tracing::info!(max_attempts, topic = ?cli.dead_letter_topic, "Dead letter handling enabled");
        discoverer = discoverer.with_dlq(dlq);
    }

    let shutdown = CancellationToken::new();
    let (reload_tx, reload_rx) = mpsc::channel(1);
    tokio::spawn(forward_signals(shutdown.clone(), reload_tx));

    tracing::info!(
        bucket = %cli.kv_bucket,
        key = %cli.config_key,
        channel = %cli.channel,
        "a3s-alert starting"
    );

    let result = discoverer.run(shutdown, reload_rx).await;
    publisher.dispatcher().close().await;
    result.context("discoverer failed")?;

    tracing::info!("a3s-alert stopped");
    Ok(())
}

/// SIGTERM/SIGINT cancel `shutdown`; SIGHUP requests a reload
#[cfg(unix)]
async fn forward_signals(shutdown: CancellationToken, reload: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(term), Ok(hup)) => (term, hup),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = term.recv() => break,
            _ = hup.recv() => {
                tracing::info!("SIGHUP received");
                let _ = reload.try_send(());
            }
        }
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn forward_signals(shutdown: CancellationToken, _reload: mpsc::Sender<()>) {
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
