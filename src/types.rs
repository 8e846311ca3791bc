//! Core message and alert types for the a3s-alert bridge
//!
//! Inbound payloads use camelCase JSON; outbound alerts follow the
//! DingTalk robot message schema.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A message delivered by the bus for one topic
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Provider-assigned message identifier
    pub id: String,

    /// Topic the message was consumed from
    pub topic: String,

    /// Raw message body
    pub payload: Bytes,

    /// Number of delivery attempts, starting at 1
    pub attempts: u64,

    /// Unix timestamp in milliseconds when the message was received
    pub timestamp: u64,
}

impl BusMessage {
    /// Create a first-delivery message with an auto-generated id
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            topic: topic.into(),
            payload: payload.into(),
            attempts: 1,
            timestamp: now_millis(),
        }
    }

    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Structured log alert produced by the log shippers
///
/// Every field is optional at the decode stage; the publisher decides
/// whether enough is present to take the structured path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,

    #[serde(default)]
    pub game_platform: Option<String>,

    #[serde(default)]
    pub node_name: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub log: Option<LogRef>,
}

/// `log` section of an [`AlertEnvelope`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRef {
    #[serde(default)]
    pub file: Option<FileRef>,
}

/// `log.file` section of an [`AlertEnvelope`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(default)]
    pub path: Option<String>,
}

impl AlertEnvelope {
    /// Path of the file that produced the log line, empty if absent
    pub fn file_path(&self) -> &str {
        self.log
            .as_ref()
            .and_then(|log| log.file.as_ref())
            .and_then(|file| file.path.as_deref())
            .unwrap_or_default()
    }
}

/// Webhook body schema
///
/// Only `"text"` selects the text schema; any other value falls back
/// to markdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BodySchema {
    Text,
    #[default]
    Markdown,
}

impl From<String> for BodySchema {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("text") {
            BodySchema::Text
        } else {
            BodySchema::Markdown
        }
    }
}

impl From<BodySchema> for String {
    fn from(value: BodySchema) -> Self {
        match value {
            BodySchema::Text => "text".to_string(),
            BodySchema::Markdown => "markdown".to_string(),
        }
    }
}

/// Rendered webhook payload, tagged by `msgtype`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msgtype", rename_all = "lowercase")]
pub enum OutboundAlert {
    Text { text: TextBody, at: AtInfo },
    Markdown { markdown: MarkdownBody, at: AtInfo },
}

impl OutboundAlert {
    /// Mention section of the alert
    pub fn at(&self) -> &AtInfo {
        match self {
            OutboundAlert::Text { at, .. } | OutboundAlert::Markdown { at, .. } => at,
        }
    }

    /// The schema this alert was rendered with
    pub fn schema(&self) -> BodySchema {
        match self {
            OutboundAlert::Text { .. } => BodySchema::Text,
            OutboundAlert::Markdown { .. } => BodySchema::Markdown,
        }
    }

    /// Human-visible body of the alert
    pub fn content(&self) -> &str {
        match self {
            OutboundAlert::Text { text, .. } => &text.content,
            OutboundAlert::Markdown { markdown, .. } => &markdown.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBody {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkdownBody {
    pub title: String,
    pub text: String,
}

/// Who gets mentioned by the alert
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtInfo {
    pub at_mobiles: Vec<String>,
    pub is_at_all: bool,
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
