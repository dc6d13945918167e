//! Event bus wire types
//!
//! Envelope types use camelCase JSON serialization for wire compatibility.

use crate::error::{ModerationError, Result};
use crate::model::{CheckKind, CorrelationId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the correlation id of a moderation request
pub const HEADER_CORRELATION_ID: &str = "correlation_id";

/// Header carrying the check kind an event belongs to
pub const HEADER_CHECK_KIND: &str = "check_kind";

/// String key-value headers travelling with every envelope
pub type Headers = HashMap<String, String>;

/// A single message on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique message identifier (msg-<uuid>), used for broker-side dedup
    pub id: String,

    /// Logical topic (e.g., "check-requests", "check-results")
    pub topic: String,

    /// Message payload: arbitrary JSON data
    pub payload: serde_json::Value,

    /// Routing headers
    #[serde(default)]
    pub headers: Headers,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

impl Envelope {
    /// Create a new envelope with auto-generated id and timestamp
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            topic: topic.into(),
            payload,
            headers: Headers::new(),
            timestamp: now_millis(),
        }
    }

    /// Add a header entry
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add all headers from a map
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Deserialize the payload into a typed value
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ModerationError::Malformed(format!(
                "Payload of message {} on '{}' is not valid: {}",
                self.id, self.topic, e
            ))
        })
    }
}

/// Correlation headers shared by scatter and partial-result events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHeaders {
    pub correlation_id: CorrelationId,
    pub check_kind: CheckKind,
}

impl RoutingHeaders {
    pub fn new(correlation_id: CorrelationId, check_kind: CheckKind) -> Self {
        Self {
            correlation_id,
            check_kind,
        }
    }

    /// Extract routing headers; missing or unknown values are malformed
    pub fn from_headers(headers: &Headers) -> Result<Self> {
        let correlation_id = headers
            .get(HEADER_CORRELATION_ID)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ModerationError::Malformed(format!("Missing '{}' header", HEADER_CORRELATION_ID))
            })?;
        let check_kind = headers
            .get(HEADER_CHECK_KIND)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ModerationError::Malformed(format!("Missing '{}' header", HEADER_CHECK_KIND))
            })?;
        let check_kind = check_kind
            .parse::<CheckKind>()
            .map_err(|e| ModerationError::Malformed(e.to_string()))?;

        Ok(Self {
            correlation_id: CorrelationId::from(correlation_id.as_str()),
            check_kind,
        })
    }

    pub fn to_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(
            HEADER_CORRELATION_ID.to_string(),
            self.correlation_id.to_string(),
        );
        headers.insert(HEADER_CHECK_KIND.to_string(), self.check_kind.to_string());
        headers
    }
}

/// A received envelope with delivery context
#[derive(Debug, Clone)]
pub struct ReceivedEnvelope {
    /// The envelope data
    pub envelope: Envelope,

    /// Provider-assigned sequence number
    pub sequence: u64,

    /// Number of delivery attempts
    pub num_delivered: u64,

    /// Stream name
    pub stream: String,
}

/// Delivery policy for subscriptions
///
/// Controls where a new consumer group starts reading from the stream.
/// Maps to provider-native delivery policies (e.g., NATS `DeliverPolicy`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DeliverPolicy {
    /// Deliver all retained messages
    #[default]
    All,
    /// Deliver starting from the last message
    Last,
    /// Deliver only new messages published after subscription
    New,
    /// Deliver starting from a specific sequence number
    ByStartSequence { sequence: u64 },
    /// Deliver starting from a specific timestamp (Unix milliseconds)
    ByStartTime { timestamp: u64 },
}

/// Options for publishing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    /// Deduplication message ID (NATS: `Nats-Msg-Id` header)
    ///
    /// Defaults to the envelope id when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,

    /// Publish timeout in seconds (overrides provider default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Options for creating consumer group subscriptions
///
/// Unsupported options are ignored by providers that don't support them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    /// Maximum delivery attempts before dead-lettering
    ///
    /// Enforced by the bus subscription loop; NATS also receives it as
    /// `MaxDeliver`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,

    /// Backoff intervals in seconds between redelivery attempts
    ///
    /// NATS: maps to consumer `BackOff` durations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backoff_secs: Vec<u64>,

    /// Maximum number of unacknowledged messages in flight
    ///
    /// NATS: `MaxAckPending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,

    /// Where a new group starts consuming from
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,

    /// How long to wait for an ack before redelivery (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait_secs: Option<u64>,

    /// Number of competing consumer loops inside the group
    ///
    /// Defaults to 1 (sequential delivery).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

impl SubscribeOptions {
    pub fn parallelism(&self) -> usize {
        self.parallelism.unwrap_or(1).max(1)
    }

    /// Delivery cap as an unsigned count (0 = unlimited)
    pub fn max_deliver_count(&self) -> u64 {
        self.max_deliver.filter(|n| *n > 0).unwrap_or(0) as u64
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
