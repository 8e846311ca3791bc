//! Error types for a3s-alert

use thiserror::Error;

/// Errors that can occur in the alert bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Bus or store connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid bridge configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration key does not exist in the store
    #[error("Config is not present at '{0}'")]
    ConfigNotFound(String),

    /// Config store read/watch/close failure
    #[error("Config store error: {0}")]
    Store(String),

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe {
        topic: String,
        reason: String,
    },

    /// Publish failure
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish {
        topic: String,
        reason: String,
    },

    /// Acknowledgement (finish or requeue) failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// A message handler rejected a message
    #[error("Failed to handle message on topic '{topic}': {reason}")]
    Handler {
        topic: String,
        reason: String,
    },

    /// The outbound alert queue is closed
    #[error("Alert dispatch error: {0}")]
    Dispatch(String),

    /// Webhook transport or response failure
    #[error("Webhook error: {0}")]
    Webhook(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Topic pattern failed to compile
    #[error("Invalid topic pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
