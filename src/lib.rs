//! # a3s-moderation
//!
//! Scatter/gather moderation of chatbot answers over a pluggable event bus.
//!
//! ## Overview
//!
//! A bot answer is fanned out to independent check workers (PII, safety,
//! advertising, off-topic). Their partial results are gathered per
//! correlation id, merged into one verdict with a composed masked answer
//! (or a corrective rewrite), and persisted exactly once.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_moderation::{
//!     Aggregator, AggregatorConfig, CheckSet, Dispatcher, EventBus, MemoryProvider,
//!     MemoryResultStore, Message, SubscribeOptions,
//! };
//!
//! # async fn example() -> a3s_moderation::Result<()> {
//! let bus = Arc::new(EventBus::new(MemoryProvider::default()));
//! let store = Arc::new(MemoryResultStore::new());
//!
//! let aggregator = Arc::new(Aggregator::new(
//!     CheckSet::default(),
//!     store.clone(),
//!     AggregatorConfig::default(),
//! ));
//! let _handle = aggregator
//!     .run(&bus, "check-results", "aggregator", &SubscribeOptions::default())
//!     .await?;
//!
//! let dispatcher = Dispatcher::new(bus.clone(), CheckSet::default(), "check-requests");
//! let id = dispatcher
//!     .enqueue(&Message::new("What is AI?", "AI is artificial intelligence."))
//!     .await?;
//!
//! println!("Accepted: {}", id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **memory**: In-memory broker for testing and single-process use
//! - **nats**: NATS JetStream for distributed, persistent delivery
//!
//! ## Architecture
//!
//! - **Dispatcher**: mints a correlation id, publishes one scatter event per check
//! - **CheckWorker**: runs a `Detector` for one check kind, publishes its partial result
//! - **Aggregator**: correlation buffer, merge engine, rewrite trigger, persistence
//! - **EventBus**: publish/subscribe over any `EventProvider`, with ack/nak/DLQ handling
//! - **ResultStore**: upsert sink for final verdicts

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod model;
pub mod provider;
pub mod retry;
pub mod rewrite;
pub mod store;
pub mod types;
pub mod worker;

// Re-export core types
pub use aggregator::{
    AggregateOutcome, Aggregator, AggregatorConfig, AggregatorStats, ExpiryAction, ExpiryPolicy,
};
pub use bus::{EventBus, SubscriptionHandle};
pub use config::ModerationConfig;
pub use crypto::{Aes256GcmEncryptor, EncryptedPayload, PayloadEncryptor};
pub use dispatcher::Dispatcher;
pub use dlq::{DeadLetter, DlqHandler, MemoryDlqHandler};
pub use error::{ModerationError, Result};
pub use handler::{EventHandler, FnHandler};
pub use metrics::{BusMetrics, MetricsSnapshot};
pub use model::{
    CheckFamily, CheckKind, CheckSet, CorrelationId, FinalVerdict, Message, PartialResult,
    Severity, Violation,
};
pub use provider::{EventProvider, PendingEnvelope, ProviderInfo, Subscription};
pub use retry::RetryConfig;
pub use rewrite::{describe_problems, Rewriter, DEFAULT_REWRITE_FALLBACK};
pub use store::{FileResultStore, MemoryResultStore, ResultStore, StoredVerdict};
pub use types::{
    DeliverPolicy, Envelope, Headers, PublishOptions, ReceivedEnvelope, RoutingHeaders,
    SubscribeOptions, HEADER_CHECK_KIND, HEADER_CORRELATION_ID,
};
pub use worker::{CheckWorker, Detector};

// Re-export providers for convenience
pub use provider::memory::{MemoryConfig, MemoryProvider};
pub use provider::nats::{NatsClient, NatsConfig, NatsProvider, NatsSubscription, StorageType};
