//! Event bus counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the bus on every publish and delivery
#[derive(Debug, Default)]
pub struct BusMetrics {
    published: AtomicU64,
    publish_errors: AtomicU64,
    publish_retries: AtomicU64,
    received: AtomicU64,
    acked: AtomicU64,
    naked: AtomicU64,
    discarded: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of `BusMetrics`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub published: u64,
    pub publish_errors: u64,
    pub publish_retries: u64,
    pub received: u64,
    pub acked: u64,
    pub naked: u64,
    pub discarded: u64,
    pub dead_lettered: u64,
}

impl BusMetrics {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_naked(&self) {
        self.naked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            naked: self.naked.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.published,
            &self.publish_errors,
            &self.publish_retries,
            &self.received,
            &self.acked,
            &self.naked,
            &self.discarded,
            &self.dead_lettered,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
