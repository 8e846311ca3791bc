//! Per-topic consumption pipeline
//!
//! A pipeline owns one topic's subscription. An intake task pulls
//! messages into a capacity-1 channel, so the bus is only read as fast
//! as messages are handled. The control loop multiplexes that channel
//! with the terminate token and the reload channel, runs the handler
//! and finishes or requeues each message.

use crate::dlq::{should_dead_letter, DeadLetterMessage, DlqHandler};
use crate::error::{BridgeError, Result};
use crate::provider::{BusProvider, PendingMessage, Subscription};
use crate::types::BusMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default durable channel name
pub const DEFAULT_CHANNEL: &str = "alert-bridge";

/// Pause after a subscription error before pulling again
const INTAKE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Handles messages delivered to a pipeline
///
/// `Ok` finishes the message. An error is handled according to the
/// pipeline's `FailurePolicy`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> Result<()>;
}

/// What a pipeline does when the handler fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Requeue the message and end the pipeline with an error
    #[default]
    FailFast,
    /// Requeue until the message was delivered `max_attempts` times,
    /// then dead-letter and finish it
    DeadLetter { max_attempts: u64 },
}

/// Pipeline settings shared by every topic
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Durable consumer group on the bus
    pub channel: String,
    pub failure: FailurePolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            failure: FailurePolicy::default(),
        }
    }
}

/// Control side of a running pipeline
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    topic: String,
    terminate: CancellationToken,
    reload_tx: mpsc::Sender<()>,
    reloads: Arc<AtomicUsize>,
}

impl PipelineHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Ask the pipeline to stop its subscription and exit
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Signal a reload; returns false if one is already pending or the
    /// pipeline has exited
    pub fn reload(&self) -> bool {
        self.reload_tx.try_send(()).is_ok()
    }

    /// Reload signals the pipeline has handled
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

/// One topic's subscription and control loop
pub struct ConsumptionPipeline {
    topic: String,
    subscription: Box<dyn Subscription>,
    handler: Arc<dyn MessageHandler>,
    dlq: Option<Arc<dyn DlqHandler>>,
    failure: FailurePolicy,
    terminate: CancellationToken,
    reload_rx: mpsc::Receiver<()>,
    reloads: Arc<AtomicUsize>,
}

impl ConsumptionPipeline {
    /// Wrap an existing subscription
    ///
    /// `terminate` is usually a child of a process-wide token so a single
    /// cancel stops every pipeline.
    pub fn new(
        topic: impl Into<String>,
        subscription: Box<dyn Subscription>,
        handler: Arc<dyn MessageHandler>,
        dlq: Option<Arc<dyn DlqHandler>>,
        failure: FailurePolicy,
        terminate: CancellationToken,
    ) -> (Self, PipelineHandle) {
        let topic = topic.into();
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let reloads = Arc::new(AtomicUsize::new(0));

        let handle = PipelineHandle {
            topic: topic.clone(),
            terminate: terminate.clone(),
            reload_tx,
            reloads: reloads.clone(),
        };

        let pipeline = Self {
            topic,
            subscription,
            handler,
            dlq,
            failure,
            terminate,
            reload_rx,
            reloads,
        };

        (pipeline, handle)
    }

    /// Subscribe to `topic` and build its pipeline
    pub async fn subscribe(
        bus: &dyn BusProvider,
        topic: &str,
        options: &PipelineOptions,
        handler: Arc<dyn MessageHandler>,
        dlq: Option<Arc<dyn DlqHandler>>,
        terminate: CancellationToken,
    ) -> Result<(Self, PipelineHandle)> {
        let subscription = bus.subscribe(topic, &options.channel).await?;
        Ok(Self::new(
            topic,
            subscription,
            handler,
            dlq,
            options.failure,
            terminate,
        ))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Run until the bus stops delivering, terminate completes, or the
    /// handler fails under `FailurePolicy::FailFast`
    pub async fn run(self) -> Result<()> {
        let ConsumptionPipeline {
            topic,
            subscription,
            handler,
            dlq,
            failure,
            terminate,
            mut reload_rx,
            reloads,
        } = self;

        let stop = CancellationToken::new();
        let (msg_tx, mut msg_rx) = mpsc::channel::<PendingMessage>(1);
        let intake = tokio::spawn(intake(topic.clone(), subscription, msg_tx, stop.clone()));

        let worker = Worker {
            topic: &topic,
            handler: handler.as_ref(),
            dlq: dlq.as_deref(),
            failure,
        };

        tracing::info!(topic = %topic, policy = ?failure, "Pipeline started");

        let result = loop {
            tokio::select! {
                received = msg_rx.recv() => match received {
                    Some(pending) => {
                        if let Err(e) = worker.process(pending).await {
                            break Err(e);
                        }
                    }
                    // Intake dropped the sender: the bus stopped
                    None => break Ok(()),
                },
                _ = terminate.cancelled(), if !stop.is_cancelled() => {
                    tracing::info!(topic = %topic, "Stopping subscription");
                    stop.cancel();
                }
                Some(()) = reload_rx.recv() => {
                    reloads.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(topic = %topic, "Pipeline reloaded");
                }
            }
        };

        stop.cancel();
        if let Err(e) = intake.await {
            tracing::warn!(topic = %topic, error = %e, "Intake task failed");
        }

        // Anything still buffered goes back to the bus
        while let Some(pending) = msg_rx.recv().await {
            requeue(&topic, pending).await;
        }

        match &result {
            Ok(()) => tracing::info!(topic = %topic, "Pipeline stopped"),
            Err(e) => tracing::error!(topic = %topic, error = %e, "Pipeline failed"),
        }

        result
    }
}

struct Worker<'a> {
    topic: &'a str,
    handler: &'a dyn MessageHandler,
    dlq: Option<&'a dyn DlqHandler>,
    failure: FailurePolicy,
}

impl Worker<'_> {
    async fn process(&self, pending: PendingMessage) -> Result<()> {
        let error = match self.handler.handle(&pending.message).await {
            Ok(()) => {
                if let Err(e) = pending.ack().await {
                    tracing::warn!(topic = self.topic, error = %e, "Failed to finish message");
                }
                return Ok(());
            }
            Err(e) => e,
        };

        match self.failure {
            FailurePolicy::FailFast => {
                tracing::error!(
                    topic = self.topic,
                    message_id = %pending.message.id,
                    error = %error,
                    "Message handling failed, requeueing"
                );
                requeue(self.topic, pending).await;

                Err(match error {
                    BridgeError::Handler { .. } => error,
                    other => BridgeError::Handler {
                        topic: self.topic.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
            FailurePolicy::DeadLetter { max_attempts } => {
                if !should_dead_letter(&pending.message, max_attempts) {
                    tracing::warn!(
                        topic = self.topic,
                        message_id = %pending.message.id,
                        attempts = pending.message.attempts,
                        max_attempts,
                        error = %error,
                        "Message handling failed, requeueing"
                    );
                    requeue(self.topic, pending).await;
                    return Ok(());
                }

                self.dead_letter(pending, error).await;
                Ok(())
            }
        }
    }

    async fn dead_letter(&self, pending: PendingMessage, error: BridgeError) {
        let Some(dlq) = self.dlq else {
            tracing::warn!(
                topic = self.topic,
                message_id = %pending.message.id,
                error = %error,
                "No dead letter handler, dropping message"
            );
            if let Err(e) = pending.ack().await {
                tracing::warn!(topic = self.topic, error = %e, "Failed to finish message");
            }
            return;
        };

        let dead = DeadLetterMessage::new(pending.message.clone(), error.to_string());
        match dlq.handle(dead).await {
            Ok(()) => {
                if let Err(e) = pending.ack().await {
                    tracing::warn!(topic = self.topic, error = %e, "Failed to finish message");
                }
            }
            Err(e) => {
                tracing::warn!(
                    topic = self.topic,
                    message_id = %pending.message.id,
                    error = %e,
                    "Dead letter failed, requeueing"
                );
                requeue(self.topic, pending).await;
            }
        }
    }
}

async fn requeue(topic: &str, pending: PendingMessage) {
    let id = pending.message.id.clone();
    match pending.requeue().await {
        Ok(()) => tracing::debug!(topic, message_id = %id, "Message requeued"),
        Err(e) => tracing::warn!(topic, message_id = %id, error = %e, "Failed to requeue message"),
    }
}

/// Pull from the subscription into the pipeline's inbound channel
///
/// Dropping `tx` on return tells the control loop the bus stopped.
async fn intake(
    topic: String,
    mut subscription: Box<dyn Subscription>,
    tx: mpsc::Sender<PendingMessage>,
    stop: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = subscription.next() => next,
        };

        let pending = match next {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                tracing::info!(topic = %topic, "Subscription ended");
                break;
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Subscription error");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(INTAKE_RETRY_DELAY) => continue,
                }
            }
        };

        let permit = tokio::select! {
            _ = stop.cancelled() => {
                requeue(&topic, pending).await;
                break;
            }
            permit = tx.reserve() => permit,
        };

        match permit {
            Ok(permit) => permit.send(pending),
            Err(_) => {
                requeue(&topic, pending).await;
                break;
            }
        }
    }
}
