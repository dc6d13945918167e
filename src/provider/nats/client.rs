//! NATS JetStream client: connect, publish, join consumer groups, query

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::error::{ModerationError, Result};
use crate::types::{DeliverPolicy, Envelope, PublishOptions, SubscribeOptions, HEADER_CHECK_KIND, HEADER_CORRELATION_ID};
use async_nats::jetstream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// Manages the connection and the JetStream stream backing all
/// moderation topics.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// JetStream stream handle (Mutex for methods requiring &mut self)
    stream: Mutex<jetstream::stream::Stream>,

    /// Configuration
    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| ModerationError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: Mutex::new(stream),
            config: Arc::new(config),
        })
    }

    /// Publish an envelope, returning the JetStream sequence number
    pub async fn publish(&self, envelope: &Envelope) -> Result<u64> {
        self.publish_with_options(envelope, &PublishOptions::default())
            .await
    }

    /// Publish an envelope with options (dedup id, timeout)
    ///
    /// The envelope id doubles as `Nats-Msg-Id` unless overridden, so a
    /// retried publish of the same envelope is deduplicated by the broker.
    pub async fn publish_with_options(
        &self,
        envelope: &Envelope,
        opts: &PublishOptions,
    ) -> Result<u64> {
        let subject = self.config.subject_for(&envelope.topic);
        let payload = serde_json::to_vec(envelope)?;

        let mut headers = async_nats::HeaderMap::new();
        let msg_id = opts.msg_id.as_deref().unwrap_or(envelope.id.as_str());
        headers.insert("Nats-Msg-Id", msg_id);
        for key in [HEADER_CORRELATION_ID, HEADER_CHECK_KIND] {
            if let Some(value) = envelope.headers.get(key) {
                headers.insert(key, value.as_str());
            }
        }

        let ack_fut = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, bytes::Bytes::from(payload))
            .await
            .map_err(|e| ModerationError::Publish {
                topic: envelope.topic.clone(),
                reason: e.to_string(),
            })?;

        let timeout_secs = opts
            .timeout_secs
            .unwrap_or(self.config.request_timeout_secs);
        let ack = tokio::time::timeout(Duration::from_secs(timeout_secs), ack_fut)
            .await
            .map_err(|_| {
                ModerationError::Timeout(format!(
                    "Publish ack timed out after {}s for subject '{}'",
                    timeout_secs, subject
                ))
            })?
            .map_err(|e| ModerationError::Publish {
                topic: envelope.topic.clone(),
                reason: format!("ack failed: {}", e),
            })?;

        tracing::debug!(
            message_id = %envelope.id,
            subject = %subject,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Message published"
        );

        Ok(ack.sequence)
    }

    /// Join (or create) a durable pull consumer for a consumer group
    pub async fn subscribe_durable_with_options(
        &self,
        group: &str,
        topic: &str,
        opts: &SubscribeOptions,
    ) -> Result<NatsSubscription> {
        let consumer_name = self.config.consumer_name(group, topic);
        let filter_subject = self.config.subject_for(topic);
        let config = build_consumer_config(&filter_subject, Some(&consumer_name), opts);

        let consumer = self
            .stream
            .lock()
            .await
            .get_or_create_consumer(&consumer_name, config)
            .await
            .map_err(|e| {
                ModerationError::Consumer(format!(
                    "Failed to create durable consumer '{}': {}",
                    consumer_name, e
                ))
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| ModerationError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            consumer = %consumer_name,
            filter = %filter_subject,
            max_deliver = ?opts.max_deliver,
            max_ack_pending = ?opts.max_ack_pending,
            "Durable subscription created"
        );

        Ok(NatsSubscription::new(
            messages,
            self.config.stream_name.clone(),
        ))
    }

    /// Create an ephemeral pull consumer for new messages only
    pub async fn subscribe(&self, topic: &str) -> Result<NatsSubscription> {
        let filter_subject = self.config.subject_for(topic);
        let opts = SubscribeOptions {
            deliver_policy: DeliverPolicy::New,
            ..Default::default()
        };

        let consumer = self
            .stream
            .lock()
            .await
            .create_consumer(build_consumer_config(&filter_subject, None, &opts))
            .await
            .map_err(|e| {
                ModerationError::Consumer(format!("Failed to create ephemeral consumer: {}", e))
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| ModerationError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        Ok(NatsSubscription::new(
            messages,
            self.config.stream_name.clone(),
        ))
    }

    /// Fetch retained envelopes from the stream
    pub async fn history(&self, topic: Option<&str>, limit: usize) -> Result<Vec<Envelope>> {
        let mut config = jetstream::consumer::pull::Config {
            deliver_policy: jetstream::consumer::DeliverPolicy::All,
            ack_policy: jetstream::consumer::AckPolicy::None,
            ..Default::default()
        };

        if let Some(topic) = topic {
            config.filter_subject = self.config.subject_for(topic);
        }

        let consumer = self
            .stream
            .lock()
            .await
            .create_consumer(config)
            .await
            .map_err(|e| {
                ModerationError::Consumer(format!("Failed to create history consumer: {}", e))
            })?;

        let mut envelopes = Vec::with_capacity(limit);
        let batch = consumer
            .fetch()
            .max_messages(limit)
            .expires(Duration::from_secs(self.config.request_timeout_secs))
            .messages()
            .await
            .map_err(|e| ModerationError::Stream(format!("Failed to fetch history: {}", e)))?;

        use futures::StreamExt;
        let mut batch = std::pin::pin!(batch);
        while let Some(msg) = batch.next().await {
            match msg {
                Ok(msg) => {
                    if let Ok(envelope) = serde_json::from_slice::<Envelope>(&msg.payload) {
                        envelopes.push(envelope);
                    }
                    if envelopes.len() >= limit {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Error fetching history message: {}", e);
                    break;
                }
            }
        }

        Ok(envelopes)
    }

    /// Delete the durable consumer of a consumer group
    pub async fn unsubscribe(&self, group: &str, topic: &str) -> Result<()> {
        let consumer_name = self.config.consumer_name(group, topic);
        self.stream
            .lock()
            .await
            .delete_consumer(&consumer_name)
            .await
            .map_err(|e| {
                ModerationError::Consumer(format!(
                    "Failed to delete consumer '{}': {}",
                    consumer_name, e
                ))
            })?;

        tracing::info!(consumer = %consumer_name, "Consumer deleted");
        Ok(())
    }

    /// Get stream info
    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self.stream.lock().await;
        let info = stream
            .info()
            .await
            .map_err(|e| ModerationError::Stream(format!("Failed to get stream info: {}", e)))?;

        Ok(StreamInfo {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        })
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Summary of stream state
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
}

/// Build a JetStream pull consumer config from SubscribeOptions
fn build_consumer_config(
    filter_subject: &str,
    durable_name: Option<&str>,
    opts: &SubscribeOptions,
) -> jetstream::consumer::pull::Config {
    let deliver_policy = match &opts.deliver_policy {
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        DeliverPolicy::Last => jetstream::consumer::DeliverPolicy::Last,
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::ByStartSequence { sequence } => {
            jetstream::consumer::DeliverPolicy::ByStartSequence {
                start_sequence: *sequence,
            }
        }
        DeliverPolicy::ByStartTime { timestamp } => {
            let secs = *timestamp / 1000;
            let nanos = ((*timestamp % 1000) * 1_000_000) as u32;
            let time = time::OffsetDateTime::from_unix_timestamp(secs as i64)
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
                + time::Duration::nanoseconds(nanos as i64);
            jetstream::consumer::DeliverPolicy::ByStartTime { start_time: time }
        }
    };

    let backoff: Vec<Duration> = opts
        .backoff_secs
        .iter()
        .map(|s| Duration::from_secs(*s))
        .collect();

    jetstream::consumer::pull::Config {
        durable_name: durable_name.map(|s| s.to_string()),
        filter_subject: filter_subject.to_string(),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy,
        max_deliver: opts.max_deliver.unwrap_or(0),
        max_ack_pending: opts.max_ack_pending.unwrap_or(0),
        ack_wait: opts
            .ack_wait_secs
            .map(Duration::from_secs)
            .unwrap_or_default(),
        backoff,
        ..Default::default()
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream exists with the correct configuration
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let max_age = if config.max_age_secs > 0 {
        Duration::from_secs(config.max_age_secs)
    } else {
        Duration::ZERO
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_messages: config.max_events,
        max_age,
        max_bytes: config.max_bytes,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| {
            ModerationError::Stream(format!(
                "Failed to create/get stream '{}': {}",
                config.stream_name, e
            ))
        })?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream stream ready"
    );

    Ok(stream)
}
