//! Dispatcher: fans one message out to every configured check
//!
//! `enqueue` mints a correlation id and publishes one scatter event per
//! check kind. It does not wait for the checks themselves.

use crate::bus::EventBus;
use crate::error::{ModerationError, Result};
use crate::model::{CheckKind, CheckSet, CorrelationId, Message};
use crate::types::RoutingHeaders;
use std::sync::Arc;

pub struct Dispatcher {
    bus: Arc<EventBus>,
    checks: CheckSet,
    scatter_topic: String,
}

impl Dispatcher {
    pub fn new(bus: Arc<EventBus>, checks: CheckSet, scatter_topic: impl Into<String>) -> Self {
        Self {
            bus,
            checks,
            scatter_topic: scatter_topic.into(),
        }
    }

    pub fn checks(&self) -> &CheckSet {
        &self.checks
    }

    /// Publish one scatter event per configured check kind
    ///
    /// All publishes run concurrently, each with the bus transport retry.
    /// If any of them still fails the whole dispatch fails with
    /// `ModerationError::Dispatch` naming the kinds that were not reached.
    /// Events that did go out cannot be recalled; the aggregator's expiry
    /// policy is what eventually settles such a request.
    pub async fn enqueue(&self, message: &Message) -> Result<CorrelationId> {
        let correlation_id = CorrelationId::new();

        let publishes = self.checks.kinds().iter().map(|kind| {
            let headers = RoutingHeaders::new(correlation_id.clone(), *kind).to_headers();
            async move {
                let outcome = self.bus.publish(&self.scatter_topic, message, headers).await;
                (*kind, outcome)
            }
        });

        let failed: Vec<(CheckKind, String)> = futures::future::join_all(publishes)
            .await
            .into_iter()
            .filter_map(|(kind, outcome)| outcome.err().map(|e| (kind, e.to_string())))
            .collect();

        if !failed.is_empty() {
            tracing::error!(
                correlation_id = %correlation_id,
                failed = failed.len(),
                expected = self.checks.len(),
                "Scatter dispatch incomplete"
            );
            return Err(ModerationError::Dispatch {
                correlation_id: correlation_id.to_string(),
                failed,
            });
        }

        tracing::info!(
            correlation_id = %correlation_id,
            checks = self.checks.len(),
            topic = %self.scatter_topic,
            "Message dispatched"
        );
        Ok(correlation_id)
    }
}
