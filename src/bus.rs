//! High-level event bus built on pluggable providers
//!
//! `EventBus` is the publish/subscribe port the dispatcher, the check
//! workers and the aggregator talk to. It serializes payloads into
//! envelopes, retries transport failures, and runs consumer-group loops
//! that ack, nak or dead-letter each delivery according to the handler's
//! outcome.

use crate::crypto::{EncryptedPayload, PayloadEncryptor};
use crate::dlq::{should_dead_letter, DeadLetter, DlqHandler};
use crate::error::{ModerationError, Result};
use crate::handler::{panic_message, EventHandler};
use crate::metrics::BusMetrics;
use crate::provider::{EventProvider, PendingEnvelope, ProviderInfo, Subscription};
use crate::retry::{with_retry, RetryConfig};
use crate::types::{Envelope, Headers, PublishOptions, ReceivedEnvelope, SubscribeOptions};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// High-level event bus backed by a pluggable provider
pub struct EventBus {
    provider: Arc<dyn EventProvider>,
    retry: RetryConfig,
    encryptor: Option<Arc<dyn PayloadEncryptor>>,
    dlq: Option<Arc<dyn DlqHandler>>,
    metrics: Arc<BusMetrics>,
}

impl EventBus {
    /// Create a new event bus from a provider
    pub fn new(provider: impl EventProvider + 'static) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    /// Create a bus over a provider shared with other components
    pub fn from_arc(provider: Arc<dyn EventProvider>) -> Self {
        Self {
            provider,
            retry: RetryConfig::default(),
            encryptor: None,
            dlq: None,
            metrics: Arc::new(BusMetrics::default()),
        }
    }

    pub fn set_retry(&mut self, retry: RetryConfig) {
        self.retry = retry;
    }

    /// Seal every published payload and open sealed payloads before handling
    pub fn set_encryptor(&mut self, encryptor: Arc<dyn PayloadEncryptor>) {
        self.encryptor = Some(encryptor);
    }

    /// Route deliveries that exhausted `max_deliver` to a dead letter queue
    pub fn set_dlq_handler(&mut self, dlq: Arc<dyn DlqHandler>) {
        self.dlq = Some(dlq);
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn provider(&self) -> &dyn EventProvider {
        self.provider.as_ref()
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }

    /// Publish a payload to a topic with the given headers
    ///
    /// Transport failures are retried per the bus `RetryConfig`; the
    /// envelope id doubles as the broker dedup id so retried publishes
    /// are not stored twice.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        headers: Headers,
    ) -> Result<Envelope> {
        let mut value = serde_json::to_value(payload)?;
        if let Some(encryptor) = &self.encryptor {
            value = encryptor.encrypt(&value)?;
        }

        let envelope = Envelope::new(topic, value).with_headers(headers);
        let opts = PublishOptions {
            msg_id: Some(envelope.id.clone()),
            ..Default::default()
        };

        let provider = &self.provider;
        let metrics = &self.metrics;
        let envelope_ref = &envelope;
        let opts_ref = &opts;
        let result = with_retry(&self.retry, "publish", move |attempt| {
            if attempt > 0 {
                metrics.record_publish_retry();
            }
            provider.publish_with_options(envelope_ref, opts_ref)
        })
        .await;

        match result {
            Ok(sequence) => {
                self.metrics.record_published();
                tracing::debug!(
                    topic,
                    message_id = %envelope.id,
                    sequence,
                    "Envelope published"
                );
                Ok(envelope)
            }
            Err(e) => {
                self.metrics.record_publish_error();
                Err(e)
            }
        }
    }

    /// Join a consumer group on a topic and run `handler` for every delivery
    ///
    /// Spawns `options.parallelism()` competing loops inside the group.
    /// The returned handle stops them; dropping it stops them too.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        options: &SubscribeOptions,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = Arc::new(LoopContext {
            topic: topic.to_string(),
            group: group.to_string(),
            handler,
            encryptor: self.encryptor.clone(),
            dlq: self.dlq.clone(),
            metrics: self.metrics.clone(),
            retry: self.retry.clone(),
            max_deliver: options.max_deliver_count(),
        });

        let mut tasks = Vec::with_capacity(options.parallelism());
        for worker in 0..options.parallelism() {
            let provider = &self.provider;
            let subscription = with_retry(&self.retry, "subscribe", move |_| {
                provider.subscribe_durable_with_options(group, topic, options)
            })
            .await?;

            tasks.push(tokio::spawn(run_loop(
                subscription,
                context.clone(),
                shutdown_rx.clone(),
                worker,
            )));
        }

        tracing::info!(
            topic,
            group,
            parallelism = tasks.len(),
            provider = self.provider.name(),
            "Subscribed"
        );

        Ok(SubscriptionHandle {
            topic: topic.to_string(),
            group: group.to_string(),
            shutdown: shutdown_tx,
            tasks,
        })
    }

    /// Fetch retained envelopes, optionally filtered by topic
    pub async fn history(&self, topic: Option<&str>, limit: usize) -> Result<Vec<Envelope>> {
        self.provider.history(topic, limit).await
    }

    /// Delete a durable consumer group
    pub async fn unsubscribe(&self, group: &str, topic: &str) -> Result<()> {
        self.provider.unsubscribe(group, topic).await
    }

    pub async fn info(&self) -> Result<ProviderInfo> {
        self.provider.info().await
    }

    pub async fn health(&self) -> Result<bool> {
        self.provider.health().await
    }
}

/// Running consumer-group loops for one `EventBus::subscribe` call
pub struct SubscriptionHandle {
    topic: String,
    group: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Stop receiving and wait for in-flight handlers to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(topic = %self.topic, group = %self.group, error = %e, "Subscription loop panicked");
            }
        }
        tracing::info!(topic = %self.topic, group = %self.group, "Subscription stopped");
    }
}

struct LoopContext {
    topic: String,
    group: String,
    handler: Arc<dyn EventHandler>,
    encryptor: Option<Arc<dyn PayloadEncryptor>>,
    dlq: Option<Arc<dyn DlqHandler>>,
    metrics: Arc<BusMetrics>,
    retry: RetryConfig,
    max_deliver: u64,
}

async fn run_loop(
    mut subscription: Box<dyn Subscription>,
    context: Arc<LoopContext>,
    mut shutdown: watch::Receiver<bool>,
    worker: usize,
) {
    let mut consecutive_errors: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        // The handler runs outside the select so shutdown never cancels it.
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = subscription.next_manual_ack() => next,
        };

        match next {
            Ok(Some(pending)) => {
                consecutive_errors = 0;
                context.process(pending).await;
            }
            Ok(None) => {
                tracing::info!(topic = %context.topic, group = %context.group, worker, "Subscription closed");
                break;
            }
            Err(e) => {
                let delay = context.retry.delay_for_attempt(consecutive_errors);
                consecutive_errors = consecutive_errors.saturating_add(1);
                tracing::warn!(
                    topic = %context.topic,
                    group = %context.group,
                    worker,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Receive failed, backing off"
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

impl LoopContext {
    async fn process(&self, pending: PendingEnvelope) {
        self.metrics.record_received();
        let mut received = pending.received.clone();

        tracing::debug!(
            topic = %self.topic,
            group = %self.group,
            sequence = received.sequence,
            num_delivered = received.num_delivered,
            "Envelope received"
        );

        if EncryptedPayload::is_encrypted(&received.envelope.payload) {
            match &self.encryptor {
                Some(encryptor) => match encryptor.decrypt(&received.envelope.payload) {
                    Ok(payload) => received.envelope.payload = payload,
                    Err(e) => {
                        self.discard(pending, &e.to_string()).await;
                        return;
                    }
                },
                None => {
                    self.discard(pending, "encrypted payload but no encryptor configured")
                        .await;
                    return;
                }
            }
        }

        let outcome = match AssertUnwindSafe(self.handler.handle(&received))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(
                    topic = %self.topic,
                    group = %self.group,
                    message_id = %received.envelope.id,
                    panic = %message,
                    "Handler panicked"
                );
                Err(ModerationError::HandlerPanic(message))
            }
        };

        match outcome {
            Ok(()) => {
                self.metrics.record_acked();
                if let Err(e) = pending.ack().await {
                    tracing::warn!(topic = %self.topic, group = %self.group, error = %e, "Ack failed");
                }
            }
            Err(e) if !e.is_retryable() => {
                self.discard(pending, &e.to_string()).await;
            }
            Err(e) if should_dead_letter(&received, self.max_deliver) => {
                self.dead_letter(pending, received, e.to_string()).await;
            }
            Err(e) => {
                tracing::warn!(
                    topic = %self.topic,
                    group = %self.group,
                    message_id = %received.envelope.id,
                    num_delivered = received.num_delivered,
                    error = %e,
                    "Handler failed, requesting redelivery"
                );
                self.metrics.record_naked();
                if let Err(e) = pending.nak().await {
                    tracing::warn!(topic = %self.topic, group = %self.group, error = %e, "Nak failed");
                }
            }
        }
    }

    async fn discard(&self, pending: PendingEnvelope, reason: &str) {
        tracing::warn!(
            topic = %self.topic,
            group = %self.group,
            message_id = %pending.received.envelope.id,
            reason,
            "Discarding envelope"
        );
        self.metrics.record_discarded();
        if let Err(e) = pending.ack().await {
            tracing::warn!(topic = %self.topic, group = %self.group, error = %e, "Ack failed");
        }
    }

    async fn dead_letter(&self, pending: PendingEnvelope, received: ReceivedEnvelope, reason: String) {
        self.metrics.record_dead_lettered();
        match &self.dlq {
            Some(dlq) => {
                if let Err(e) = dlq.handle(DeadLetter::new(received, reason)).await {
                    tracing::error!(topic = %self.topic, group = %self.group, error = %e, "Dead letter handler failed");
                }
            }
            None => {
                tracing::warn!(
                    topic = %self.topic,
                    group = %self.group,
                    message_id = %received.envelope.id,
                    num_delivered = received.num_delivered,
                    reason = %reason,
                    "Delivery attempts exhausted, dropping envelope"
                );
            }
        }
        if let Err(e) = pending.ack().await {
            tracing::warn!(topic = %self.topic, group = %self.group, error = %e, "Ack failed");
        }
    }
}
