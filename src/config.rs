//! Bridge configuration read from the watched config store
//!
//! The JSON layout keeps the field names the log shippers already write
//! (`nsqd-tcp-addresses`, `filterKeys`, ...), so existing config keys can
//! be reused unchanged.

use crate::error::{BridgeError, Result};
use crate::types::BodySchema;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default refresh interval for topic discovery, in seconds
pub const DEFAULT_TOPIC_REFRESH_SECS: u64 = 30;

/// Longest accepted topic refresh interval, in seconds (one day)
pub const MAX_TOPIC_REFRESH_SECS: u64 = 86_400;

/// Default webhook protocol
pub const DEFAULT_WEBHOOK_PROTOCOL: &str = "https";

/// Default webhook host and path (DingTalk robot API)
pub const DEFAULT_WEBHOOK_URL: &str = "oapi.dingtalk.com/robot/send";

/// Routing policy: which messages alert, where they go and who is mentioned
///
/// Replaced as one unit on every config update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Webhook host and path, without protocol
    #[serde(default = "default_webhook_url")]
    pub url: String,

    /// Webhook protocol (`http` or `https`)
    #[serde(default = "default_webhook_protocol")]
    pub protocol: String,

    /// Rotating credential pool
    #[serde(rename = "http-access-tokens", default)]
    pub access_tokens: Vec<String>,

    /// A message alerts only if it contains one of these
    #[serde(rename = "filterKeys", default)]
    pub filter_keys: Vec<String>,

    /// A message containing one of these never alerts
    #[serde(rename = "ignoreKeys", default)]
    pub ignore_keys: Vec<String>,

    /// A message containing one of these does not mention everyone
    #[serde(rename = "notAtKeys", default)]
    pub not_at_keys: Vec<String>,

    /// Explicit recipients; when set, nobody else is mentioned
    #[serde(rename = "atMobiles", default)]
    pub at_mobiles: Vec<String>,

    #[serde(default)]
    pub schema: BodySchema,
}

fn default_webhook_url() -> String {
    DEFAULT_WEBHOOK_URL.to_string()
}

fn default_webhook_protocol() -> String {
    DEFAULT_WEBHOOK_PROTOCOL.to_string()
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            url: default_webhook_url(),
            protocol: default_webhook_protocol(),
            access_tokens: Vec::new(),
            filter_keys: Vec::new(),
            ignore_keys: Vec::new(),
            not_at_keys: Vec::new(),
            at_mobiles: Vec::new(),
            schema: BodySchema::default(),
        }
    }
}

impl RoutingPolicy {
    /// Webhook endpoint for one credential
    pub fn endpoint(&self, access_token: &str) -> String {
        format!(
            "{}://{}?access_token={}",
            self.protocol, self.url, access_token
        )
    }
}

/// Bus addresses: pinned nodes or seeds for cluster discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusAddresses {
    /// Connect only to these nodes
    Direct(Vec<String>),
    /// Connect through these and follow the cluster's advertised nodes
    Lookup(Vec<String>),
}

impl BusAddresses {
    /// Addresses regardless of mode
    pub fn addresses(&self) -> &[String] {
        match self {
            BusAddresses::Direct(addrs) | BusAddresses::Lookup(addrs) => addrs,
        }
    }
}

/// Configuration object stored under the bridge's config key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(rename = "lookupd-http-addresses", default)]
    pub lookupd_http_addresses: Vec<String>,

    #[serde(rename = "nsqd-tcp-addresses", default)]
    pub nsqd_tcp_addresses: Vec<String>,

    #[serde(default)]
    pub topics: Vec<String>,

    /// Regular expressions matched against the topics the bus reports
    #[serde(rename = "topic-patterns", default)]
    pub topic_patterns: Vec<String>,

    /// Topic refresh interval in seconds
    #[serde(rename = "topic-refresh-interval", default = "default_refresh_secs")]
    pub topic_refresh_interval: u64,

    #[serde(default)]
    pub filter: RoutingPolicy,
}

fn default_refresh_secs() -> u64 {
    DEFAULT_TOPIC_REFRESH_SECS
}

impl BridgeConfig {
    /// Parse and validate a config value read from the store
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_slice(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the address, topic and interval invariants
    pub fn validate(&self) -> Result<()> {
        if self.lookupd_http_addresses.is_empty() && self.nsqd_tcp_addresses.is_empty() {
            return Err(BridgeError::Config(
                "lookupd-http-addresses or nsqd-tcp-addresses is required".to_string(),
            ));
        }

        if !self.lookupd_http_addresses.is_empty() && !self.nsqd_tcp_addresses.is_empty() {
            return Err(BridgeError::Config(
                "use lookupd-http-addresses or nsqd-tcp-addresses, not both".to_string(),
            ));
        }

        if self.topics.is_empty() && self.topic_patterns.is_empty() {
            return Err(BridgeError::Config(
                "at least one topic or topic pattern is required".to_string(),
            ));
        }

        if self.topic_refresh_interval == 0 {
            return Err(BridgeError::Config(
                "topic-refresh-interval must be positive".to_string(),
            ));
        }

        if self.topic_refresh_interval > MAX_TOPIC_REFRESH_SECS {
            return Err(BridgeError::Config(format!(
                "topic-refresh-interval must be at most {} seconds",
                MAX_TOPIC_REFRESH_SECS
            )));
        }

        self.compiled_patterns()?;
        Ok(())
    }

    /// Configured bus addresses
    pub fn bus_addresses(&self) -> BusAddresses {
        if self.nsqd_tcp_addresses.is_empty() {
            BusAddresses::Lookup(self.lookupd_http_addresses.clone())
        } else {
            BusAddresses::Direct(self.nsqd_tcp_addresses.clone())
        }
    }

    /// Topic refresh interval as a `Duration`
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(
            self.topic_refresh_interval
                .clamp(1, MAX_TOPIC_REFRESH_SECS),
        )
    }

    /// Compile the topic patterns
    pub fn compiled_patterns(&self) -> Result<Vec<Regex>> {
        self.topic_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(BridgeError::from))
            .collect()
    }
}
