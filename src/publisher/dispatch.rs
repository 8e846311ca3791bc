//! Bounded outbound alert dispatch
//!
//! Rendered alerts go into a bounded queue drained by one dispatcher
//! task, which runs at most `concurrency` webhook sends at a time.
//! Delivery is best-effort: failures are logged and dropped.

use crate::error::{BridgeError, Result};
use crate::types::OutboundAlert;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default outbound queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of concurrent webhook sends
pub const DEFAULT_CONCURRENCY: usize = 10;

/// DingTalk robot reply body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookReply {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
}

/// Destination for rendered alerts
#[async_trait]
pub trait WebhookSink: Send + Sync {
    /// POST one alert to `url`, returning the decoded reply
    async fn send_alert(&self, url: &str, alert: &OutboundAlert) -> Result<WebhookReply>;
}

/// Webhook sink over HTTP
pub struct HttpWebhook {
    client: reqwest::Client,
}

impl HttpWebhook {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| BridgeError::Webhook(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSink for HttpWebhook {
    async fn send_alert(&self, url: &str, alert: &OutboundAlert) -> Result<WebhookReply> {
        let body = serde_json::to_vec(alert)?;

        // Errors carry the URL, which holds the access token
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| BridgeError::Webhook(e.without_url().to_string()))?;

        let status = response.status();
        response.json::<WebhookReply>().await.map_err(|e| {
            BridgeError::Webhook(format!(
                "undecodable reply (HTTP {}): {}",
                status,
                e.without_url()
            ))
        })
    }
}

/// One queued send
#[derive(Debug, Clone)]
struct DispatchJob {
    url: String,
    /// Endpoint without credentials, for logs
    target: String,
    alert: OutboundAlert,
}

/// Dispatcher sizing
#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    pub queue_capacity: usize,
    pub concurrency: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Bounded queue in front of a `WebhookSink`
///
/// Must be created inside a tokio runtime.
pub struct AlertDispatcher {
    tx: mpsc::Sender<DispatchJob>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn WebhookSink>, options: DispatcherOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));

        let task = tokio::spawn(run_dispatcher(rx, sink, semaphore, shutdown.clone()));

        Self {
            tx,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue an alert without waiting for delivery
    ///
    /// Returns `Ok(false)` when the queue is full and the alert was
    /// dropped, and an error once the dispatcher is closed.
    pub fn dispatch(&self, url: String, target: &str, alert: OutboundAlert) -> Result<bool> {
        let job = DispatchJob {
            url,
            target: target.to_string(),
            alert,
        };

        match self.tx.try_send(job) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(
                    endpoint = %job.target,
                    capacity = self.tx.max_capacity(),
                    "Alert queue full, dropping alert"
                );
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BridgeError::Dispatch(
                "alert queue is closed".to_string(),
            )),
        }
    }

    /// Alerts waiting in the queue
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Stop taking alerts; queued ones are dropped, in-flight sends finish
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Alert dispatcher task failed");
            }
        }
    }
}

async fn run_dispatcher(
    mut rx: mpsc::Receiver<DispatchJob>,
    sink: Arc<dyn WebhookSink>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let sink = sink.clone();
        tokio::spawn(async move {
            let _permit = permit;
            deliver(sink.as_ref(), job).await;
        });
    }

    tracing::debug!("Alert dispatcher stopped");
}

async fn deliver(sink: &dyn WebhookSink, job: DispatchJob) {
    match sink.send_alert(&job.url, &job.alert).await {
        Ok(reply) if reply.errcode != 0 => {
            tracing::warn!(
                endpoint = %job.target,
                errcode = reply.errcode,
                errmsg = %reply.errmsg,
                "Webhook rejected alert"
            );
        }
        Ok(_) => {
            tracing::debug!(endpoint = %job.target, msgtype = ?job.alert.schema(), "Alert delivered");
        }
        Err(e) => {
            tracing::warn!(endpoint = %job.target, error = %e, "Failed to deliver alert");
        }
    }
}

/// In-memory webhook sink for testing
///
/// Records every request; can be switched to fail every send.
#[derive(Default)]
pub struct MemorySink {
    requests: Mutex<Vec<(String, OutboundAlert)>>,
    notify: Notify,
    failing: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose sends all fail with a transport error
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    /// Requests received so far, as `(url, alert)`
    pub async fn requests(&self) -> Vec<(String, OutboundAlert)> {
        self.requests.lock().await.clone()
    }

    /// Wait until at least `count` requests arrived or `timeout` passed
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<(String, OutboundAlert)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let requests = self.requests().await;
            if requests.len() >= count {
                return requests;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.requests().await;
            }
        }
    }
}

#[async_trait]
impl WebhookSink for MemorySink {
    async fn send_alert(&self, url: &str, alert: &OutboundAlert) -> Result<WebhookReply> {
        self.requests
            .lock()
            .await
            .push((url.to_string(), alert.clone()));
        self.notify.notify_waiters();

        if self.failing {
            return Err(BridgeError::Webhook("connection refused".to_string()));
        }
        Ok(WebhookReply {
            errcode: 0,
            errmsg: "ok".to_string(),
        })
    }
}
