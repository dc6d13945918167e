//! NATS provider configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageType {
    /// Persist messages to disk (survives broker restarts)
    #[default]
    File,
    /// Keep messages in memory only
    Memory,
}

/// Configuration for the NATS JetStream provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// JetStream stream name
    pub stream_name: String,

    /// Subject prefix; topics map to `<prefix>.<topic>`
    pub subject_prefix: String,

    /// Storage backend
    pub storage: StorageType,

    /// Maximum number of retained messages (-1 = unlimited)
    pub max_events: i64,

    /// Maximum retained bytes (-1 = unlimited)
    pub max_bytes: i64,

    /// Maximum message age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            stream_name: "MODERATION".to_string(),
            subject_prefix: "moderation".to_string(),
            storage: StorageType::File,
            max_events: 1_000_000,
            max_bytes: -1,
            max_age_secs: 7 * 24 * 3600,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl NatsConfig {
    /// Build the full subject for a topic
    pub fn subject_for(&self, topic: &str) -> String {
        format!("{}.{}", self.subject_prefix, topic)
    }

    /// Recover the topic from a subject published under this prefix
    pub fn topic_of<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject
            .strip_prefix(self.subject_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }

    /// Durable consumer name for a (group, topic) pair
    ///
    /// Consumer names may not contain `.`, `*`, `>` or whitespace.
    pub fn consumer_name(&self, group: &str, topic: &str) -> String {
        format!("{}-{}", group, topic)
            .chars()
            .map(|c| match c {
                '.' | '*' | '>' => '-',
                c if c.is_whitespace() => '_',
                c => c,
            })
            .collect()
    }
}
