//! NATS JetStream pull-consumer subscription

use crate::error::{ModerationError, Result};
use crate::provider::{PendingEnvelope, Subscription};
use crate::types::{Envelope, ReceivedEnvelope};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Subscription backed by a JetStream pull consumer message stream
pub struct NatsSubscription {
    /// Wrapped so the subscription is `Sync`; only accessed through `&mut self`
    messages: Mutex<jetstream::consumer::pull::Stream>,
    stream_name: String,
}

impl NatsSubscription {
    pub(crate) fn new(messages: jetstream::consumer::pull::Stream, stream_name: String) -> Self {
        Self {
            messages: Mutex::new(messages),
            stream_name,
        }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next_manual_ack(&mut self) -> Result<Option<PendingEnvelope>> {
        loop {
            let Some(next) = self.messages.get_mut().next().await else {
                return Ok(None);
            };

            let msg = next.map_err(|e| ModerationError::Consumer(format!("Failed to pull message: {}", e)))?;

            let envelope = match serde_json::from_slice::<Envelope>(&msg.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Not ours to decode; ack so it is not redelivered forever
                    tracing::warn!(subject = %msg.subject, error = %e, "Discarding undecodable message");
                    msg.ack()
                        .await
                        .map_err(|e| ModerationError::Ack(e.to_string()))?;
                    continue;
                }
            };

            let (sequence, num_delivered) = match msg.info() {
                Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
                Err(_) => (0, 1),
            };

            let received = ReceivedEnvelope {
                envelope,
                sequence,
                num_delivered,
                stream: self.stream_name.clone(),
            };

            let msg = Arc::new(msg);
            let ack_msg = msg.clone();
            let nak_msg = msg;

            return Ok(Some(PendingEnvelope::new(
                received,
                move || {
                    async move {
                        ack_msg
                            .ack()
                            .await
                            .map_err(|e| ModerationError::Ack(e.to_string()))
                    }
                    .boxed()
                },
                move || {
                    async move {
                        nak_msg
                            .ack_with(jetstream::AckKind::Nak(None))
                            .await
                            .map_err(|e| ModerationError::Ack(e.to_string()))
                    }
                    .boxed()
                },
            )));
        }
    }
}
