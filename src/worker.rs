//! Check worker harness
//!
//! Detectors (PII tagger, toxicity classifier, ad filter, off-topic
//! scorer) live outside this crate. `CheckWorker` wires one of them to
//! the bus: it consumes scatter events for its kind and answers each with
//! a partial result on the result topic, under the same routing headers.

use crate::bus::{EventBus, SubscriptionHandle};
use crate::error::{ModerationError, Result};
use crate::handler::{panic_message, EventHandler};
use crate::model::{CheckKind, Message, PartialResult};
use crate::types::{ReceivedEnvelope, RoutingHeaders, SubscribeOptions};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// One moderation detector
#[async_trait]
pub trait Detector: Send + Sync {
    fn kind(&self) -> CheckKind;

    async fn process(&self, message: &Message) -> Result<PartialResult>;
}

/// Consumer-group name a worker of `kind` joins
pub fn worker_group(kind: CheckKind) -> String {
    format!("{}-service", kind)
}

pub struct CheckWorker {
    detector: Arc<dyn Detector>,
    bus: Arc<EventBus>,
    result_topic: String,
}

impl CheckWorker {
    pub fn new(detector: Arc<dyn Detector>, bus: Arc<EventBus>, result_topic: impl Into<String>) -> Self {
        Self {
            detector,
            bus,
            result_topic: result_topic.into(),
        }
    }

    pub fn kind(&self) -> CheckKind {
        self.detector.kind()
    }

    /// Run the detector and publish its partial result
    ///
    /// A detector failure or panic is published as an errored partial so
    /// the aggregator is never left waiting on this kind.
    pub async fn check(&self, routing: &RoutingHeaders, message: &Message) -> Result<PartialResult> {
        let kind = self.detector.kind();
        let outcome = AssertUnwindSafe(self.detector.process(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ModerationError::Detector {
                    kind,
                    reason: format!("panicked: {}", panic_message(panic)),
                })
            });

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let e = match e {
                    ModerationError::Detector { .. } => e,
                    other => ModerationError::Detector {
                        kind,
                        reason: other.to_string(),
                    },
                };
                tracing::warn!(
                    correlation_id = %routing.correlation_id,
                    check_kind = %kind,
                    error = %e,
                    "Detector failed, reporting errored result"
                );
                PartialResult::errored(message, e.to_string())
            }
        };

        self.bus
            .publish(&self.result_topic, &result, routing.to_headers())
            .await?;

        tracing::debug!(
            correlation_id = %routing.correlation_id,
            check_kind = %kind,
            safe = result.safe,
            score = result.score,
            "Partial result published"
        );
        Ok(result)
    }

    /// Join `<kind>-service` on the scatter topic
    pub async fn run(
        self: &Arc<Self>,
        scatter_topic: &str,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        let handler: Arc<dyn EventHandler> = self.clone();
        self.bus
            .subscribe(scatter_topic, &worker_group(self.kind()), options, handler)
            .await
    }
}

#[async_trait]
impl EventHandler for CheckWorker {
    async fn handle(&self, received: &ReceivedEnvelope) -> Result<()> {
        let routing = RoutingHeaders::from_headers(&received.envelope.headers)?;
        if routing.check_kind != self.kind() {
            return Ok(());
        }

        let message: Message = received.envelope.decode()?;
        self.check(&routing, &message).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CorrelationId;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::EventProvider;
    use crate::types::{Envelope, HEADER_CHECK_KIND};

    struct KeywordDetector;

    #[async_trait]
    impl Detector for KeywordDetector {
        fn kind(&self) -> CheckKind {
            CheckKind::Ad
        }

        async fn process(&self, message: &Message) -> Result<PartialResult> {
            if message.answer.contains("unreachable") {
                return Err(ModerationError::Connection("model server unreachable".into()));
            }
            if message.answer.contains("overflow") {
                panic!("tokenizer overflow");
            }
            let is_ad = message.answer.contains("MegaStore");
            Ok(PartialResult::new(!is_ad, if is_ad { 0.9 } else { 0.1 }, &message.answer)
                .with_question(&message.question))
        }
    }

    fn received(envelope: Envelope) -> ReceivedEnvelope {
        ReceivedEnvelope {
            envelope,
            sequence: 1,
            num_delivered: 1,
            stream: "test".into(),
        }
    }

    fn setup() -> (MemoryProvider, CheckWorker) {
        let provider = MemoryProvider::default();
        let bus = Arc::new(EventBus::new(provider.clone()));
        let worker = CheckWorker::new(Arc::new(KeywordDetector), bus, "check-results");
        (provider, worker)
    }

    #[test]
    fn test_worker_group_names() {
        assert_eq!(worker_group(CheckKind::Pii), "pii-service");
        assert_eq!(worker_group(CheckKind::OffTopic), "off_topic-service");
    }

    #[tokio::test]
    async fn test_publishes_result_with_same_headers() {
        let (provider, worker) = setup();
        let routing = RoutingHeaders::new(CorrelationId::from("req-9"), CheckKind::Ad);
        let envelope = Envelope::new("check-requests", serde_json::to_value(Message::new("Q", "Shop at MegaStore")).unwrap())
            .with_headers(routing.to_headers());

        worker.handle(&received(envelope)).await.unwrap();

        let results = provider.history(Some("check-results"), 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(RoutingHeaders::from_headers(&results[0].headers).unwrap(), routing);
        let partial: PartialResult = results[0].decode().unwrap();
        assert!(!partial.safe);
        assert_eq!(partial.question.as_deref(), Some("Q"));
    }

    #[tokio::test]
    async fn test_other_kinds_are_skipped() {
        let (provider, worker) = setup();
        let routing = RoutingHeaders::new(CorrelationId::from("req-9"), CheckKind::Pii);
        let envelope = Envelope::new("check-requests", serde_json::to_value(Message::new("Q", "A")).unwrap())
            .with_headers(routing.to_headers());

        worker.handle(&received(envelope)).await.unwrap();
        assert!(provider.history(Some("check-results"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detector_error_becomes_errored_partial() {
        let (_provider, worker) = setup();
        let routing = RoutingHeaders::new(CorrelationId::from("req-9"), CheckKind::Ad);

        let partial = worker
            .check(&routing, &Message::new("Q", "server unreachable"))
            .await
            .unwrap();
        assert!(!partial.is_safe());
        assert_eq!(partial.score, 0.0);
        assert_eq!(partial.masked_answer, "server unreachable");
        assert!(partial.error.unwrap().contains("model server unreachable"));
    }

    #[tokio::test]
    async fn test_malformed_scatter_event_is_not_retryable() {
        let (_provider, worker) = setup();
        let envelope = Envelope::new("check-requests", serde_json::json!({"question": "Q"}))
            .with_header(HEADER_CHECK_KIND, "ad");

        let err = worker.handle(&received(envelope)).await.unwrap_err();
        assert!(matches!(err, ModerationError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_detector_panic_becomes_errored_partial() {
        let (provider, worker) = setup();
        let routing = RoutingHeaders::new(CorrelationId::from("req-10"), CheckKind::Ad);

        let partial = worker
            .check(&routing, &Message::new("Q", "integer overflow ahead"))
            .await
            .unwrap();
        assert!(!partial.is_safe());
        assert!(partial.error.unwrap().contains("tokenizer overflow"));

        let results = provider.history(Some("check-results"), 10).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
