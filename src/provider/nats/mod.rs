//! NATS JetStream event provider
//!
//! Implements `EventProvider` using NATS JetStream durable pull consumers
//! with explicit ack, giving at-least-once delivery per consumer group.

mod client;
mod config;
mod subscriber;

pub use client::{NatsClient, StreamInfo};
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsSubscription;

use crate::error::Result;
use crate::provider::{EventProvider, ProviderInfo, Subscription};
use crate::types::{Envelope, PublishOptions, SubscribeOptions};
use async_trait::async_trait;

/// NATS JetStream event provider
///
/// Wraps `NatsClient` and implements the `EventProvider` trait.
pub struct NatsProvider {
    client: NatsClient,
}

impl NatsProvider {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl EventProvider for NatsProvider {
    async fn publish(&self, envelope: &Envelope) -> Result<u64> {
        self.client.publish(envelope).await
    }

    async fn subscribe_durable(&self, group: &str, topic: &str) -> Result<Box<dyn Subscription>> {
        self.subscribe_durable_with_options(group, topic, &SubscribeOptions::default())
            .await
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
        let sub = self.client.subscribe(topic).await?;
        Ok(Box::new(sub))
    }

    async fn history(&self, topic: Option<&str>, limit: usize) -> Result<Vec<Envelope>> {
        self.client.history(topic, limit).await
    }

    async fn unsubscribe(&self, group: &str, topic: &str) -> Result<()> {
        self.client.unsubscribe(group, topic).await
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let info = self.client.stream_info().await?;
        Ok(ProviderInfo {
            provider: "nats".to_string(),
            messages: info.messages,
            bytes: info.bytes,
            consumers: info.consumer_count,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn publish_with_options(&self, envelope: &Envelope, opts: &PublishOptions) -> Result<u64> {
        self.client.publish_with_options(envelope, opts).await
    }

    async fn subscribe_durable_with_options(
        &self,
        group: &str,
        topic: &str,
        opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        let sub = self
            .client
            .subscribe_durable_with_options(group, topic, opts)
            .await?;
        Ok(Box::new(sub))
    }
}
