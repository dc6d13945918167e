//! Event provider trait: the broker abstraction behind the event bus
//!
//! Broker backends (NATS JetStream, in-memory) implement `EventProvider`
//! to give the bus a uniform publish / consumer-group / ack API with
//! at-least-once delivery.

use crate::error::Result;
use crate::types::{Envelope, PublishOptions, ReceivedEnvelope, SubscribeOptions};
use async_trait::async_trait;

pub mod memory;
pub mod nats;

/// Core trait for broker backends
#[async_trait]
pub trait EventProvider: Send + Sync {
    /// Publish an envelope to its topic, returning the provider-assigned sequence number
    async fn publish(&self, envelope: &Envelope) -> Result<u64>;

    /// Join a durable consumer group on a topic
    ///
    /// Every group receives every message on the topic; members of the
    /// same group compete for messages. Unacknowledged messages are
    /// redelivered.
    async fn subscribe_durable(&self, group: &str, topic: &str) -> Result<Box<dyn Subscription>>;

    /// Create an ephemeral subscription (cleaned up on disconnect)
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>>;

    /// Fetch retained messages, optionally filtered by topic
    async fn history(&self, topic: Option<&str>, limit: usize) -> Result<Vec<Envelope>>;

    /// Delete a durable consumer group
    async fn unsubscribe(&self, group: &str, topic: &str) -> Result<()>;

    /// Get provider info (message count, etc.)
    async fn info(&self) -> Result<ProviderInfo>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Publish with provider-specific options
    ///
    /// Default implementation ignores options and delegates to `publish()`.
    async fn publish_with_options(&self, envelope: &Envelope, _opts: &PublishOptions) -> Result<u64> {
        self.publish(envelope).await
    }

    /// Join a durable consumer group with provider-specific options
    ///
    /// Default implementation ignores options and delegates to `subscribe_durable()`.
    async fn subscribe_durable_with_options(
        &self,
        group: &str,
        topic: &str,
        _opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        self.subscribe_durable(group, topic).await
    }

    /// Health check: returns true if the provider is connected and operational
    async fn health(&self) -> Result<bool> {
        self.info().await.map(|_| true)
    }
}

/// Async subscription handle for receiving envelopes
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Receive the next envelope with manual ack control
    ///
    /// Returns `Ok(None)` once the subscription is closed.
    async fn next_manual_ack(&mut self) -> Result<Option<PendingEnvelope>>;

    /// Receive the next envelope and acknowledge it immediately
    async fn next(&mut self) -> Result<Option<ReceivedEnvelope>> {
        match self.next_manual_ack().await? {
            Some(pending) => {
                let received = pending.received.clone();
                pending.ack().await?;
                Ok(Some(received))
            }
            None => Ok(None),
        }
    }
}

type AckFn = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<()>> + Send>;

/// An envelope pending acknowledgement
pub struct PendingEnvelope {
    /// The received envelope
    pub received: ReceivedEnvelope,

    /// Ack callback: call to confirm processing
    ack_fn: AckFn,

    /// Nak callback: call to request redelivery
    nak_fn: AckFn,
}

impl PendingEnvelope {
    /// Create a new pending envelope with ack/nak callbacks
    pub fn new(
        received: ReceivedEnvelope,
        ack_fn: impl FnOnce() -> futures::future::BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce() -> futures::future::BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            received,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge (request redelivery)
    pub async fn nak(self) -> Result<()> {
        (self.nak_fn)().await
    }
}

/// Provider status information
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    /// Provider name
    pub provider: String,
    /// Total messages retained
    pub messages: u64,
    /// Total bytes used
    pub bytes: u64,
    /// Number of active consumer groups
    pub consumers: usize,
}
