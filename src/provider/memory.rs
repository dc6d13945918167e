//! In-memory event provider
//!
//! A single-process broker for tests and embedded deployments. Each
//! durable consumer group owns one queue per topic: every group receives
//! every message, and subscriptions joined to the same group compete for
//! deliveries. A nak puts the message back on the group queue with its
//! delivery count incremented.

use crate::error::{ModerationError, Result};
use crate::provider::{EventProvider, PendingEnvelope, ProviderInfo, Subscription};
use crate::types::{DeliverPolicy, Envelope, ReceivedEnvelope, SubscribeOptions};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

const STREAM_NAME: &str = "memory";

/// Configuration for the in-memory provider
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum number of retained messages (oldest dropped first)
    pub max_events: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_events: 100_000 }
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    envelope: Envelope,
    sequence: u64,
    num_delivered: u64,
}

struct GroupQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

impl GroupQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

/// (topic, group)
type GroupKey = (String, String);

#[derive(Default)]
struct State {
    sequence: u64,
    retained: VecDeque<(u64, Envelope, usize)>,
    bytes: u64,
    groups: HashMap<GroupKey, GroupQueue>,
}

/// In-memory broker with durable consumer groups
#[derive(Clone, Default)]
pub struct MemoryProvider {
    config: MemoryConfig,
    state: Arc<Mutex<State>>,
}

impl MemoryProvider {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| ModerationError::Stream(format!("Failed to acquire memory stream lock: {}", e)))
    }

    fn join_group(
        &self,
        topic: &str,
        group: &str,
        policy: &DeliverPolicy,
    ) -> Result<(mpsc::UnboundedSender<Delivery>, Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>)> {
        let mut state = self.lock_state()?;
        let key = (topic.to_string(), group.to_string());

        if let Some(queue) = state.groups.get(&key) {
            return Ok((queue.tx.clone(), queue.rx.clone()));
        }

        let queue = GroupQueue::new();
        let backlog = replay_backlog(&state.retained, topic, policy);
        for delivery in backlog {
            // Receiver is held by the queue itself, send cannot fail here
            let _ = queue.tx.send(delivery);
        }

        let handles = (queue.tx.clone(), queue.rx.clone());
        state.groups.insert(key, queue);

        tracing::debug!(topic, group, "Memory consumer group created");
        Ok(handles)
    }
}

fn replay_backlog(
    retained: &VecDeque<(u64, Envelope, usize)>,
    topic: &str,
    policy: &DeliverPolicy,
) -> Vec<Delivery> {
    let matching = retained.iter().filter(|(_, env, _)| env.topic == topic);
    let selected: Vec<&(u64, Envelope, usize)> = match policy {
        DeliverPolicy::All => matching.collect(),
        DeliverPolicy::New => Vec::new(),
        DeliverPolicy::Last => matching.last().into_iter().collect(),
        DeliverPolicy::ByStartSequence { sequence } => {
            matching.filter(|(seq, _, _)| seq >= sequence).collect()
        }
        DeliverPolicy::ByStartTime { timestamp } => {
            matching.filter(|(_, env, _)| env.timestamp >= *timestamp).collect()
        }
    };

    selected
        .into_iter()
        .map(|(seq, env, _)| Delivery {
            envelope: env.clone(),
            sequence: *seq,
            num_delivered: 1,
        })
        .collect()
}

#[async_trait]
impl EventProvider for MemoryProvider {
    async fn publish(&self, envelope: &Envelope) -> Result<u64> {
        let size = serde_json::to_vec(envelope)?.len();
        let mut state = self.lock_state()?;

        state.sequence += 1;
        let sequence = state.sequence;

        state.retained.push_back((sequence, envelope.clone(), size));
        state.bytes += size as u64;
        while self.config.max_events > 0 && state.retained.len() > self.config.max_events {
            if let Some((_, _, dropped)) = state.retained.pop_front() {
                state.bytes -= dropped as u64;
            }
        }

        for ((topic, _), queue) in state.groups.iter() {
            if topic == &envelope.topic {
                let _ = queue.tx.send(Delivery {
                    envelope: envelope.clone(),
                    sequence,
                    num_delivered: 1,
                });
            }
        }

        tracing::debug!(
            message_id = %envelope.id,
            topic = %envelope.topic,
            sequence,
            "Message published"
        );

        Ok(sequence)
    }

    async fn subscribe_durable(&self, group: &str, topic: &str) -> Result<Box<dyn Subscription>> {
        self.subscribe_durable_with_options(group, topic, &SubscribeOptions::default())
            .await
    }

    async fn subscribe_durable_with_options(
        &self,
        group: &str,
        topic: &str,
        opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = self.join_group(topic, group, &opts.deliver_policy)?;
        Ok(Box::new(MemorySubscription {
            tx,
            rx,
            ephemeral: None,
        }))
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
        let group = format!("ephemeral-{}", uuid::Uuid::new_v4());
        let (tx, rx) = self.join_group(topic, &group, &DeliverPolicy::New)?;
        Ok(Box::new(MemorySubscription {
            tx,
            rx,
            ephemeral: Some((Arc::downgrade(&self.state), (topic.to_string(), group))),
        }))
    }

    async fn history(&self, topic: Option<&str>, limit: usize) -> Result<Vec<Envelope>> {
        let state = self.lock_state()?;
        let mut envelopes: Vec<Envelope> = state
            .retained
            .iter()
            .rev()
            .filter(|(_, env, _)| topic.map_or(true, |t| env.topic == t))
            .take(limit)
            .map(|(_, env, _)| env.clone())
            .collect();
        envelopes.reverse();
        Ok(envelopes)
    }

    async fn unsubscribe(&self, group: &str, topic: &str) -> Result<()> {
        let mut state = self.lock_state()?;
        state
            .groups
            .remove(&(topic.to_string(), group.to_string()))
            .ok_or_else(|| {
                ModerationError::Consumer(format!(
                    "Consumer group '{}' on '{}' not found",
                    group, topic
                ))
            })?;
        Ok(())
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let state = self.lock_state()?;
        Ok(ProviderInfo {
            provider: "memory".to_string(),
            messages: state.retained.len() as u64,
            bytes: state.bytes,
            consumers: state.groups.len(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription to an in-memory consumer group
pub struct MemorySubscription {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    ephemeral: Option<(Weak<Mutex<State>>, GroupKey)>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_manual_ack(&mut self) -> Result<Option<PendingEnvelope>> {
        let delivery = {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };

        let Some(delivery) = delivery else {
            return Ok(None);
        };

        let received = ReceivedEnvelope {
            envelope: delivery.envelope.clone(),
            sequence: delivery.sequence,
            num_delivered: delivery.num_delivered,
            stream: STREAM_NAME.to_string(),
        };

        let requeue = self.tx.clone();
        Ok(Some(PendingEnvelope::new(
            received,
            || async { Ok(()) }.boxed(),
            move || {
                async move {
                    let retry = Delivery {
                        num_delivered: delivery.num_delivered + 1,
                        ..delivery
                    };
                    requeue.send(retry).map_err(|_| {
                        ModerationError::Ack("Consumer group closed before redelivery".to_string())
                    })
                }
                .boxed()
            },
        )))
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Some((state, key)) = self.ephemeral.take() {
            if let Some(state) = state.upgrade() {
                if let Ok(mut state) = state.lock() {
                    state.groups.remove(&key);
                }
            }
        }
    }
}
