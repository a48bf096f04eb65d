//! Persistent interaction counters
//!
//! Counters live in the non-expiring counter namespace and are created lazily
//! at zero. Every change is a single atomic store step; a decrement that would
//! cross zero is clamped inside that same step and reported as an
//! inconsistency instead of failing the caller.

use crate::keys::CacheKey;
use crate::metrics::CacheMetrics;
use crate::model::CounterKind;
use crate::store::{CacheStore, Increment};
use crate::CacheResult;
use std::sync::Arc;
use tracing::{debug, warn};

/// One counter adjustment: add `delta` to the `kind` counter of `subject_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub subject_id: u64,
    pub kind: CounterKind,
    pub delta: i64,
}

impl CounterDelta {
    pub fn new(subject_id: u64, kind: CounterKind, delta: i64) -> Self {
        Self {
            subject_id,
            kind,
            delta,
        }
    }

    pub fn key(&self) -> String {
        CacheKey::counter(self.subject_id, self.kind)
    }
}

#[derive(Clone)]
pub struct CounterStore {
    store: Arc<dyn CacheStore>,
    metrics: CacheMetrics,
}

impl CounterStore {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            metrics: CacheMetrics::new(),
        }
    }

    /// Atomically add `delta` and return the new value.
    pub async fn increment(&self, subject_id: u64, kind: CounterKind, delta: i64) -> CacheResult<u64> {
        let key = CacheKey::counter(subject_id, kind);
        let result = self.store.incr_clamped(&key, delta).await?;
        self.observe(&CounterDelta::new(subject_id, kind, delta), result);
        Ok(result.value)
    }

    /// Report the outcome of an increment applied elsewhere, e.g. together
    /// with a membership change. A clamp is logged and counted here.
    pub fn observe(&self, change: &CounterDelta, result: Increment) {
        let key = change.key();
        if result.clamped {
            warn!(
                key = %key,
                subject_id = change.subject_id,
                kind = %change.kind,
                delta = change.delta,
                "Counter clamped at zero; decrement without matching increment"
            );
            self.metrics.record_inconsistency("counter_clamped");
        } else {
            debug!(key = %key, delta = change.delta, value = result.value, "Counter updated");
        }
    }

    /// Current value, 0 when the counter was never written.
    pub async fn get(&self, subject_id: u64, kind: CounterKind) -> CacheResult<u64> {
        Ok(self.get_raw(subject_id, kind).await?.unwrap_or(0))
    }

    /// Current value, `None` when the counter was never written.
    pub async fn get_raw(&self, subject_id: u64, kind: CounterKind) -> CacheResult<Option<u64>> {
        let key = CacheKey::counter(subject_id, kind);
        let value = self.store.get_int(&key).await?;
        Ok(value.map(|v| v.max(0) as u64))
    }

    /// Initialize a counter from the source of truth unless it already exists.
    /// Returns whether the seed was written.
    pub async fn seed(&self, subject_id: u64, kind: CounterKind, value: u64) -> CacheResult<bool> {
        let key = CacheKey::counter(subject_id, kind);
        let written = self
            .store
            .set_if_absent(&key, value.to_string().into_bytes())
            .await?;
        if written {
            debug!(key = %key, value, "Counter seeded");
        }
        Ok(written)
    }

    /// Administrative reset to zero.
    pub async fn reset(&self, subject_id: u64, kind: CounterKind) -> CacheResult<()> {
        let key = CacheKey::counter(subject_id, kind);
        self.store.set(&key, b"0".to_vec(), None).await
    }

    /// Drop the counter entirely, e.g. when its subject is deleted.
    pub async fn clear(&self, subject_id: u64, kind: CounterKind) -> CacheResult<bool> {
        self.store.del(&CacheKey::counter(subject_id, kind)).await
    }
}
