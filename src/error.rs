//! Error types for a3s-moderation

use crate::model::CheckKind;
use thiserror::Error;

/// Errors that can occur while dispatching, checking, or aggregating
#[derive(Debug, Error)]
pub enum ModerationError {
    /// Broker connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish {
        topic: String,
        reason: String,
    },

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe {
        topic: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Verdict or resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stream/topic creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer group creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Event missing its correlation headers or carrying an unusable payload
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// Fan-out could not reach every configured check kind
    #[error("Dispatch of {correlation_id} failed for {}", describe_failed(.failed))]
    Dispatch {
        correlation_id: String,
        failed: Vec<(CheckKind, String)>,
    },

    /// Detector failure inside a check worker
    #[error("Detector '{kind}' failed: {reason}")]
    Detector {
        kind: CheckKind,
        reason: String,
    },

    /// Corrective rewrite failure
    #[error("Rewrite failed: {0}")]
    Rewrite(String),

    /// Result store failure (retryable)
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Event handler panicked while processing a delivery
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// Payload encryption or decryption failure
    #[error("Encryption error: {0}")]
    Encryption(String),
}

impl ModerationError {
    /// Whether redelivering the event that produced this error may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModerationError::Connection(_)
                | ModerationError::Publish { .. }
                | ModerationError::Subscribe { .. }
                | ModerationError::Stream(_)
                | ModerationError::Consumer(_)
                | ModerationError::Ack(_)
                | ModerationError::Timeout(_)
                | ModerationError::Dispatch { .. }
                | ModerationError::Persistence(_)
                | ModerationError::HandlerPanic(_)
        )
    }
}

fn describe_failed(failed: &[(CheckKind, String)]) -> String {
    failed
        .iter()
        .map(|(kind, reason)| format!("{} ({})", kind, reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for moderation operations
pub type Result<T> = std::result::Result<T, ModerationError>;
