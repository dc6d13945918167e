//! Aggregator: gathers partial results and emits one verdict per request
//!
//! Partial results are buffered per correlation id. The moment a bucket
//! holds every configured check kind it is removed from pending state;
//! that removal is the single completeness trigger, so duplicate and
//! concurrent deliveries can never merge the same request twice. The
//! merge itself is synchronous (`merge::plan`); the optional corrective
//! rewrite and the store write happen outside the lock.
//!
//! ```text
//! PENDING(k of N) ──complete──▶ MERGING ──saved──▶ PERSISTED
//!        ▲                         │
//!        └──── save failed ────────┘
//! ```

pub mod mask;
pub mod merge;

use crate::bus::{EventBus, SubscriptionHandle};
use crate::error::{ModerationError, Result};
use crate::handler::EventHandler;
use crate::model::{CheckKind, CheckSet, CorrelationId, FinalVerdict, Message, PartialResult};
use crate::rewrite::{Rewriter, DEFAULT_REWRITE_FALLBACK};
use crate::store::ResultStore;
use crate::types::{Headers, ReceivedEnvelope, RoutingHeaders, SubscribeOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Error recorded for checks that never reported before expiry
pub const EXPIRED_CHECK_ERROR: &str = "check timed out";

/// What happens to a bucket that outlives its time-to-live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryAction {
    /// Persist a degraded verdict; missing checks count as errored
    #[default]
    Degrade,
    /// Drop the bucket without a verdict
    Discard,
}

/// Per-bucket expiry policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Incomplete buckets stay resident until their checks arrive
    #[default]
    Never,
    After {
        ttl: Duration,
        action: ExpiryAction,
    },
}

/// Aggregator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// How many finished correlation ids are remembered to ignore late duplicates
    pub completed_capacity: usize,

    /// Bucket time-to-live in seconds (unset = never expire)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_secs: Option<u64>,

    pub expiry_action: ExpiryAction,

    /// Interval of the background expiry sweep
    pub sweep_interval_secs: u64,

    /// Answer used when a corrective rewrite cannot be produced
    pub rewrite_fallback: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            completed_capacity: 100_000,
            expiry_secs: None,
            expiry_action: ExpiryAction::Degrade,
            sweep_interval_secs: 30,
            rewrite_fallback: DEFAULT_REWRITE_FALLBACK.to_string(),
        }
    }
}

impl AggregatorConfig {
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        match self.expiry_secs {
            Some(secs) => ExpiryPolicy::After {
                ttl: Duration::from_secs(secs),
                action: self.expiry_action,
            },
            None => ExpiryPolicy::Never,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Result of handling one partial result
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome {
    /// Missing or unusable routing headers; the event was dropped
    Discarded,
    /// Recorded; the request still waits for other checks
    Pending { received: usize, expected: usize },
    /// This partial completed the request and the verdict was persisted
    Completed(FinalVerdict),
    /// The request already has a verdict; the event was ignored
    AlreadyCompleted,
}

/// Point-in-time aggregator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorStats {
    pub pending: usize,
    pub completed: u64,
    pub duplicates_ignored: u64,
    pub discarded: u64,
    pub expired: u64,
}

struct Bucket {
    parts: BTreeMap<CheckKind, PartialResult>,
    created_at: Instant,
}

/// Bounded memory of finished correlation ids, oldest evicted first
struct CompletedIds {
    order: VecDeque<CorrelationId>,
    ids: HashSet<CorrelationId>,
    capacity: usize,
}

impl CompletedIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, id: &CorrelationId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: CorrelationId) {
        if self.capacity == 0 || !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }
}

struct State {
    pending: HashMap<CorrelationId, Bucket>,
    /// Ids removed from pending whose verdict is not yet persisted
    merging: HashSet<CorrelationId>,
    completed: CompletedIds,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    duplicates_ignored: AtomicU64,
    discarded: AtomicU64,
    expired: AtomicU64,
}

/// Correlation buffer and merge trigger for one deployment
pub struct Aggregator {
    checks: CheckSet,
    store: Arc<dyn ResultStore>,
    rewriter: Option<Arc<dyn Rewriter>>,
    config: AggregatorConfig,
    state: Mutex<State>,
    counters: Counters,
}

impl Aggregator {
    pub fn new(checks: CheckSet, store: Arc<dyn ResultStore>, config: AggregatorConfig) -> Self {
        let state = State {
            pending: HashMap::new(),
            merging: HashSet::new(),
            completed: CompletedIds::new(config.completed_capacity),
        };
        Self {
            checks,
            store,
            rewriter: None,
            config,
            state: Mutex::new(state),
            counters: Counters::default(),
        }
    }

    /// Use `rewriter` for answers failing a corrective check
    pub fn with_rewriter(mut self, rewriter: Arc<dyn Rewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn checks(&self) -> &CheckSet {
        &self.checks
    }

    /// No critical section leaves `State` half-updated; poisoning is recovered
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one partial result and merge once the request is complete
    ///
    /// Returns a retryable error only when the verdict could not be
    /// persisted; the bucket is restored so redelivery re-runs the merge.
    pub async fn on_partial_result(
        &self,
        result: PartialResult,
        headers: &Headers,
    ) -> Result<AggregateOutcome> {
        let routing = match RoutingHeaders::from_headers(headers) {
            Ok(routing) => routing,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding partial result");
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                return Ok(AggregateOutcome::Discarded);
            }
        };
        let RoutingHeaders {
            correlation_id,
            check_kind,
        } = routing;

        if !self.checks.contains(check_kind) {
            tracing::warn!(
                correlation_id = %correlation_id,
                check_kind = %check_kind,
                "Discarding partial result for unconfigured check kind"
            );
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return Ok(AggregateOutcome::Discarded);
        }

        let (parts, created_at) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.completed.contains(&correlation_id) {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    check_kind = %check_kind,
                    "Ignoring partial result for completed request"
                );
                self.counters.duplicates_ignored.fetch_add(1, Ordering::Relaxed);
                return Ok(AggregateOutcome::AlreadyCompleted);
            }

            let bucket = state
                .pending
                .entry(correlation_id.clone())
                .or_insert_with(|| Bucket {
                    parts: BTreeMap::new(),
                    created_at: Instant::now(),
                });
            bucket.parts.insert(check_kind, result);

            // Duplicates arriving mid-merge are only kept for a possible restore
            if state.merging.contains(&correlation_id) || !self.checks.is_complete(&bucket.parts) {
                let received = bucket.parts.len();
                tracing::debug!(
                    correlation_id = %correlation_id,
                    check_kind = %check_kind,
                    received,
                    expected = self.checks.len(),
                    "Partial result recorded"
                );
                return Ok(AggregateOutcome::Pending {
                    received,
                    expected: self.checks.len(),
                });
            }

            let Some(bucket) = state.pending.remove(&correlation_id) else {
                return Err(ModerationError::Persistence(format!(
                    "Bucket for {} vanished during completion",
                    correlation_id
                )));
            };
            state.merging.insert(correlation_id.clone());
            (bucket.parts, bucket.created_at)
        };

        let verdict = self
            .finalize(&correlation_id, parts.clone(), parts, created_at)
            .await?;
        Ok(AggregateOutcome::Completed(verdict))
    }

    /// Merge, rewrite if needed, and persist
    ///
    /// `restore` is what goes back into pending state if the save fails.
    async fn finalize(
        &self,
        correlation_id: &CorrelationId,
        parts: BTreeMap<CheckKind, PartialResult>,
        restore: BTreeMap<CheckKind, PartialResult>,
        created_at: Instant,
    ) -> Result<FinalVerdict> {
        let plan = merge::plan(&self.checks, parts);
        let verdict = match plan.rewrite.clone() {
            Some(request) => {
                let rewritten = self.rewrite(correlation_id, &request).await;
                plan.finish(rewritten)
            }
            None => plan.into_verdict(),
        };

        if let Err(e) = self.store.save(correlation_id, &verdict).await {
            tracing::warn!(
                correlation_id = %correlation_id,
                error = %e,
                "Failed to persist verdict, restoring bucket"
            );
            self.restore(correlation_id, restore, created_at);
            return Err(match e {
                ModerationError::Persistence(_) => e,
                other => ModerationError::Persistence(other.to_string()),
            });
        }

        {
            let mut state = self.lock_state();
            state.pending.remove(correlation_id);
            state.merging.remove(correlation_id);
            state.completed.insert(correlation_id.clone());
        }
        self.counters.completed.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            correlation_id = %correlation_id,
            overall_safe = verdict.overall_safe,
            violations = verdict.violations.len(),
            "Verdict persisted"
        );
        Ok(verdict)
    }

    async fn rewrite(&self, correlation_id: &CorrelationId, request: &merge::RewriteRequest) -> String {
        let Some(rewriter) = &self.rewriter else {
            tracing::warn!(
                correlation_id = %correlation_id,
                kinds = ?request.kinds,
                "No rewriter configured, using fallback answer"
            );
            return self.config.rewrite_fallback.clone();
        };

        match rewriter.rewrite(&request.text, &request.problem).await {
            Ok(text) => {
                tracing::debug!(correlation_id = %correlation_id, kinds = ?request.kinds, "Answer rewritten");
                text
            }
            Err(e) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    kinds = ?request.kinds,
                    error = %e,
                    "Rewrite failed, using fallback answer"
                );
                self.config.rewrite_fallback.clone()
            }
        }
    }

    fn restore(
        &self,
        correlation_id: &CorrelationId,
        parts: BTreeMap<CheckKind, PartialResult>,
        created_at: Instant,
    ) {
        let mut state = self.lock_state();
        state.merging.remove(correlation_id);
        let bucket = state
            .pending
            .entry(correlation_id.clone())
            .or_insert_with(|| Bucket {
                parts: BTreeMap::new(),
                created_at,
            });
        bucket.created_at = bucket.created_at.min(created_at);
        for (kind, part) in parts {
            // Partials that arrived while merging are newer
            bucket.parts.entry(kind).or_insert(part);
        }
    }

    /// Expire buckets older than the configured ttl
    ///
    /// Returns the correlation ids that were expired. Degraded verdicts
    /// that fail to persist leave their bucket pending for the next sweep.
    pub async fn expire_stale(&self, now: Instant) -> Result<Vec<CorrelationId>> {
        let ExpiryPolicy::After { ttl, action } = self.config.expiry_policy() else {
            return Ok(Vec::new());
        };

        let stale: Vec<(CorrelationId, Bucket)> = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let ids: Vec<CorrelationId> = state
                .pending
                .iter()
                .filter(|(id, _)| !state.merging.contains(*id))
                .filter(|(_, bucket)| now.saturating_duration_since(bucket.created_at) >= ttl)
                .map(|(id, _)| id.clone())
                .collect();

            let mut stale = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(bucket) = state.pending.remove(&id) {
                    match action {
                        ExpiryAction::Discard => state.completed.insert(id.clone()),
                        ExpiryAction::Degrade => {
                            state.merging.insert(id.clone());
                        }
                    }
                    stale.push((id, bucket));
                }
            }
            stale
        };

        let mut expired = Vec::with_capacity(stale.len());
        for (correlation_id, bucket) in stale {
            let missing: Vec<CheckKind> = self
                .checks
                .kinds()
                .iter()
                .filter(|kind| !bucket.parts.contains_key(kind))
                .copied()
                .collect();

            match action {
                ExpiryAction::Discard => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        missing = ?missing,
                        "Discarding expired request"
                    );
                }
                ExpiryAction::Degrade => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        missing = ?missing,
                        "Request expired, persisting degraded verdict"
                    );
                    let message = recover_message(&bucket.parts);
                    let mut parts = bucket.parts.clone();
                    for kind in &missing {
                        parts.insert(*kind, PartialResult::errored(&message, EXPIRED_CHECK_ERROR));
                    }
                    if let Err(e) = self
                        .finalize(&correlation_id, parts, bucket.parts, bucket.created_at)
                        .await
                    {
                        tracing::warn!(correlation_id = %correlation_id, error = %e, "Degraded verdict not persisted");
                        continue;
                    }
                }
            }

            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            expired.push(correlation_id);
        }

        Ok(expired)
    }

    /// Run `expire_stale` periodically until the returned task is aborted
    pub fn spawn_expiry_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = aggregator.expire_stale(Instant::now()).await {
                    tracing::warn!(error = %e, "Expiry sweep failed");
                }
            }
        })
    }

    /// Join the aggregator group on the result topic
    pub async fn run(
        self: &Arc<Self>,
        bus: &EventBus,
        result_topic: &str,
        group: &str,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        let handler: Arc<dyn EventHandler> = self.clone();
        bus.subscribe(result_topic, group, options, handler).await
    }

    pub fn stats(&self) -> AggregatorStats {
        let pending = self.lock_state().pending.len();
        AggregatorStats {
            pending,
            completed: self.counters.completed.load(Ordering::Relaxed),
            duplicates_ignored: self.counters.duplicates_ignored.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }
}

/// Best-effort reconstruction of the screened message from partial results
fn recover_message(parts: &BTreeMap<CheckKind, PartialResult>) -> Message {
    let question = parts
        .values()
        .find_map(|part| part.question.clone())
        .unwrap_or_default();
    let answer = parts
        .values()
        .map(|part| part.masked_answer.as_str())
        .find(|answer| !answer.is_empty())
        .unwrap_or_default();
    Message::new(question, answer)
}

#[async_trait]
impl EventHandler for Aggregator {
    async fn handle(&self, received: &ReceivedEnvelope) -> Result<()> {
        let result: PartialResult = match received.envelope.decode() {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    message_id = %received.envelope.id,
                    error = %e,
                    "Discarding undecodable partial result"
                );
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        self.on_partial_result(result, &received.envelope.headers)
            .await
            .map(|_| ())
    }
}
