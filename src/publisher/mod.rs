//! Filter & publisher: decides which messages alert and sends them
//!
//! One `AlertPublisher` is shared by every pipeline. It holds the
//! current routing policy as an immutable snapshot together with the
//! credential cursor; a config update swaps both at once.

mod dispatch;
mod filter;
mod render;

pub use dispatch::{
    AlertDispatcher, DispatcherOptions, HttpWebhook, MemorySink, WebhookReply, WebhookSink,
    DEFAULT_CONCURRENCY, DEFAULT_QUEUE_CAPACITY,
};
pub use filter::{is_at_all, should_alert};
pub use render::{render_log_alert, render_raw_alarm, LogAlert, MARKDOWN_TITLE};

use crate::config::RoutingPolicy;
use crate::error::{BridgeError, Result};
use crate::pipeline::MessageHandler;
use crate::types::{AlertEnvelope, AtInfo, BusMessage, OutboundAlert};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

struct PolicyState {
    policy: Arc<RoutingPolicy>,
    /// Index of the next credential to hand out
    cursor: usize,
}

impl PolicyState {
    fn new(policy: RoutingPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            cursor: 0,
        }
    }

    fn advance(&mut self) -> Option<String> {
        let tokens = &self.policy.access_tokens;
        if tokens.is_empty() {
            return None;
        }
        let token = tokens[self.cursor % tokens.len()].clone();
        self.cursor = (self.cursor + 1) % tokens.len();
        Some(token)
    }
}

/// Shared alert filter and publisher
pub struct AlertPublisher {
    state: RwLock<PolicyState>,
    dispatcher: AlertDispatcher,
}

impl AlertPublisher {
    pub fn new(policy: RoutingPolicy, dispatcher: AlertDispatcher) -> Self {
        Self {
            state: RwLock::new(PolicyState::new(policy)),
            dispatcher,
        }
    }

    /// Current policy snapshot
    pub async fn policy(&self) -> Arc<RoutingPolicy> {
        self.state.read().await.policy.clone()
    }

    /// Replace the policy and reset the credential cursor
    pub async fn update_routing_policy(&self, policy: RoutingPolicy) {
        let mut state = self.state.write().await;
        *state = PolicyState::new(policy);
        tracing::info!(
            tokens = state.policy.access_tokens.len(),
            filter_keys = state.policy.filter_keys.len(),
            ignore_keys = state.policy.ignore_keys.len(),
            schema = ?state.policy.schema,
            "Routing policy updated"
        );
    }

    /// Next credential in round-robin order, `None` if the pool is empty
    pub async fn next_token(&self) -> Option<String> {
        self.state.write().await.advance()
    }

    pub fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    /// Decide on `text` and take a credential if it alerts
    ///
    /// The decision is re-checked if the policy was swapped between the
    /// read and the credential checkout, so policy and credential always
    /// come from the same snapshot.
    async fn checkout(&self, text: &str) -> Option<(Arc<RoutingPolicy>, String)> {
        let snapshot = self.policy().await;
        if !should_alert(&snapshot, text) {
            return None;
        }

        let mut state = self.state.write().await;
        if !Arc::ptr_eq(&state.policy, &snapshot) && !should_alert(&state.policy, text) {
            return None;
        }

        match state.advance() {
            Some(token) => Some((state.policy.clone(), token)),
            None => {
                tracing::debug!("No access token configured, alert skipped");
                None
            }
        }
    }

    /// Decode a payload and route it to the structured or raw path
    ///
    /// Returns whether an alert was queued.
    pub async fn handle_message(&self, raw: &[u8]) -> Result<bool> {
        let envelope: AlertEnvelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "Payload is not an alert envelope");
                return self.alarm_message(&String::from_utf8_lossy(raw)).await;
            }
        };

        match (envelope.message.as_deref(), envelope.log.is_some()) {
            (Some(message), true) => {
                let alert = LogAlert {
                    machine_name: envelope.machine_name.as_deref(),
                    game_platform: envelope.game_platform.as_deref().unwrap_or_default(),
                    node_name: envelope.node_name.as_deref().unwrap_or_default(),
                    file_path: envelope.file_path(),
                    message,
                };
                self.filter_message(&alert).await
            }
            (Some(message), false) => self.alarm_message(message).await,
            (None, _) => self.alarm_message(&String::from_utf8_lossy(raw)).await,
        }
    }

    /// Structured path: filter on the message text, render by schema
    pub async fn filter_message(&self, alert: &LogAlert<'_>) -> Result<bool> {
        let Some((policy, token)) = self.checkout(alert.message).await else {
            return Ok(false);
        };

        let at = mentions(&policy, alert.message);
        let rendered = render_log_alert(alert, policy.schema, at);
        self.send_alert(&policy, rendered, &token)
    }

    /// Raw path: same decisions, text schema, content as-is
    pub async fn alarm_message(&self, text: &str) -> Result<bool> {
        let Some((policy, token)) = self.checkout(text).await else {
            return Ok(false);
        };

        let at = mentions(&policy, text);
        self.send_alert(&policy, render_raw_alarm(text, at), &token)
    }

    /// Queue a rendered alert for `POST {protocol}://{url}?access_token={token}`
    ///
    /// Does not wait for delivery.
    pub fn send_alert(
        &self,
        policy: &RoutingPolicy,
        alert: OutboundAlert,
        token: &str,
    ) -> Result<bool> {
        let target = format!("{}://{}", policy.protocol, policy.url);
        self.dispatcher
            .dispatch(policy.endpoint(token), &target, alert)
    }
}

fn mentions(policy: &RoutingPolicy, text: &str) -> AtInfo {
    AtInfo {
        at_mobiles: policy.at_mobiles.clone(),
        is_at_all: is_at_all(policy, text),
    }
}

#[async_trait]
impl MessageHandler for AlertPublisher {
    async fn handle(&self, message: &BusMessage) -> Result<()> {
        self.handle_message(&message.payload)
            .await
            .map(|_| ())
            .map_err(|e| BridgeError::Handler {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for AlertPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertPublisher").finish_non_exhaustive()
    }
}
