//! Dead Letter Queue: park events that keep failing
//!
//! The subscription loop naks retryable handler failures so the broker
//! redelivers them. Once an envelope reaches the group's `max_deliver`
//! it is handed to a `DlqHandler` and acknowledged, so a poison partial
//! result cannot block a consumer group forever.

use crate::error::Result;
use crate::types::{now_millis, ReceivedEnvelope};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A failed envelope with context about why it ended up in the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The original received envelope
    pub received: ReceivedEnvelope,

    /// Reason the envelope was dead-lettered
    pub reason: String,

    /// Unix timestamp in milliseconds when the envelope was dead-lettered
    pub dead_lettered_at: u64,
}

impl DeadLetter {
    pub fn new(received: ReceivedEnvelope, reason: impl Into<String>) -> Self {
        Self {
            received,
            reason: reason.into(),
            dead_lettered_at: now_millis(),
        }
    }
}

/// Trait for dead letter queue handlers
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Handle a dead-lettered envelope
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()>;

    /// Get the number of envelopes currently in the DLQ
    async fn count(&self) -> Result<usize>;

    /// List recent dead letters, most recent first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory DLQ handler with a bounded capacity
pub struct MemoryDlqHandler {
    dead_letters: Arc<RwLock<Vec<DeadLetter>>>,
    max_entries: usize,
}

impl MemoryDlqHandler {
    pub fn new(max_entries: usize) -> Self {
        Self {
            dead_letters: Arc::new(RwLock::new(Vec::new())),
            max_entries,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            message_id = %dead_letter.received.envelope.id,
            topic = %dead_letter.received.envelope.topic,
            num_delivered = dead_letter.received.num_delivered,
            reason = %dead_letter.reason,
            "Envelope dead-lettered"
        );

        let mut dead_letters = self.dead_letters.write().await;
        dead_letters.push(dead_letter);

        if self.max_entries > 0 && dead_letters.len() > self.max_entries {
            let drain_count = dead_letters.len() - self.max_entries;
            dead_letters.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.dead_letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let dead_letters = self.dead_letters.read().await;
        Ok(dead_letters.iter().rev().take(limit).cloned().collect())
    }
}

/// Check if an envelope has used up its delivery attempts (0 = unlimited)
pub fn should_dead_letter(received: &ReceivedEnvelope, max_deliver: u64) -> bool {
    max_deliver > 0 && received.num_delivered >= max_deliver
}
