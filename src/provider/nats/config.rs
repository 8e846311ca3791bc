//! NATS provider configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Configuration for the NATS JetStream bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Server URLs (e.g., "nats://127.0.0.1:4222")
    pub servers: Vec<String>,

    /// Follow servers advertised by the cluster
    ///
    /// When false the client only ever talks to `servers`.
    #[serde(default = "default_true")]
    pub discover_servers: bool,

    /// Authentication token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// JetStream stream holding every topic
    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    /// Subject prefix; topic `t` maps to subject `{prefix}.t`
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    #[serde(default)]
    pub storage: StorageType,

    /// Maximum unacknowledged messages per consumer
    #[serde(default = "default_max_ack_pending")]
    pub max_ack_pending: i64,

    /// Seconds before an unacknowledged message is redelivered
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,

    /// Maximum age of stream messages in seconds (0 = unlimited)
    #[serde(default)]
    pub max_age_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_stream_name() -> String {
    "ALERT_BRIDGE".to_string()
}

fn default_subject_prefix() -> String {
    "alerts".to_string()
}

fn default_max_ack_pending() -> i64 {
    200
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            discover_servers: true,
            token: None,
            stream_name: default_stream_name(),
            subject_prefix: default_subject_prefix(),
            storage: StorageType::default(),
            max_ack_pending: default_max_ack_pending(),
            ack_wait_secs: default_ack_wait_secs(),
            max_age_secs: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl NatsConfig {
    /// Subject a topic is carried on
    pub fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.subject_prefix, topic)
    }

    /// Topic carried on a subject, if the subject belongs to this bus
    pub fn topic_of<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject
            .strip_prefix(self.subject_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|topic| !topic.is_empty())
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }

    /// Durable consumer name for a topic and channel
    ///
    /// Consumer names may not contain subject tokens or whitespace, so
    /// those characters and `_` itself are written as `_` plus two hex
    /// digits (`_u` plus four for non-ASCII whitespace). Distinct topics
    /// always get distinct names.
    pub fn consumer_name(&self, topic: &str, channel: &str) -> String {
        let mut name = String::with_capacity(channel.len() + topic.len() + 1);
        for c in format!("{}-{}", channel, topic).chars() {
            match c {
                '_' | '.' | '*' | '>' | '/' | '\\' => name.push_str(&format!("_{:02x}", c as u32)),
                c if c.is_whitespace() && c.is_ascii() => {
                    name.push_str(&format!("_{:02x}", c as u32))
                }
                c if c.is_whitespace() => name.push_str(&format!("_u{:04x}", c as u32)),
                c => name.push(c),
            }
        }
        name
    }

    /// Server list in the comma-separated form the client accepts
    pub fn server_list(&self) -> String {
        self.servers.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.servers, vec!["nats://127.0.0.1:4222"]);
        assert!(config.discover_servers);
        assert_eq!(config.stream_name, "ALERT_BRIDGE");
        assert_eq!(config.subject_prefix, "alerts");
        assert_eq!(config.max_ack_pending, 200);
        assert_eq!(config.storage, StorageType::File);
    }

    #[test]
    fn test_subject_mapping() {
        let config = NatsConfig::default();
        assert_eq!(config.subject("game-log"), "alerts.game-log");
        assert_eq!(config.topic_of("alerts.game-log"), Some("game-log"));
        assert_eq!(config.topic_of("alerts.a.b"), Some("a.b"));
        assert_eq!(config.topic_of("alertsx.game-log"), None);
        assert_eq!(config.topic_of("alerts."), None);
        assert_eq!(config.topic_of("other.game-log"), None);
        assert_eq!(config.stream_subjects(), vec!["alerts.>"]);
    }

    #[test]
    fn test_consumer_name_is_sanitized() {
        let config = NatsConfig::default();
        assert_eq!(
            config.consumer_name("game.log", "alert-bridge"),
            "alert-bridge-game_2elog"
        );
        assert_eq!(config.consumer_name("a b>", "c"), "c-a_20b_3e");
    }

    #[test]
    fn test_consumer_name_keeps_topics_apart() {
        let config = NatsConfig::default();
        let dotted = config.consumer_name("a.b", "alert-bridge");
        let underscored = config.consumer_name("a_b", "alert-bridge");
        assert_ne!(dotted, underscored);
        assert_eq!(underscored, "alert-bridge-a_5fb");

        assert_eq!(config.consumer_name("a\u{2000}", "c"), "c-a_u2000");
        assert_ne!(
            config.consumer_name("a\u{2000}", "c"),
            config.consumer_name("a 00", "c")
        );
    }

    #[test]
    fn test_server_list() {
        let config = NatsConfig {
            servers: vec!["nats://a:4222".to_string(), "nats://b:4222".to_string()],
            ..Default::default()
        };
        assert_eq!(config.server_list(), "nats://a:4222,nats://b:4222");
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let config: NatsConfig =
            serde_json::from_str(r#"{"servers": ["nats://n1:4222"], "storage": "memory"}"#)
                .unwrap();
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.ack_wait_secs, 30);
        assert!(config.token.is_none());
    }
}
