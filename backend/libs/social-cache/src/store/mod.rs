//! Backing store abstraction
//!
//! Any key-value store offering atomic increment, atomic set operations and a
//! sorted set satisfies [`CacheStore`]. Every mutation here must be a single
//! store-native atomic step; callers never do read-modify-write.

mod memory;
mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

use crate::keys::CacheNamespace;
use crate::CacheResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Result of an atomic clamped increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    pub value: u64,
    /// The delta would have driven the value below zero and was clamped.
    pub clamped: bool,
}

/// Direction of a set membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Insert,
    Remove,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store a value. `None` TTL means no expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()>;

    /// Store only if the key does not exist yet. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> CacheResult<bool>;

    async fn del(&self, key: &str) -> CacheResult<bool>;

    /// Read an integer value written by `incr_clamped` or `set`.
    async fn get_int(&self, key: &str) -> CacheResult<Option<i64>>;

    /// Atomically add `delta`, clamping the result at zero.
    async fn incr_clamped(&self, key: &str, delta: i64) -> CacheResult<Increment>;

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn set_contains(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn set_len(&self, key: &str) -> CacheResult<u64>;

    /// Insert or remove `member` and, only if membership changed, apply each
    /// `(counter_key, delta)` with `incr_clamped` semantics. Both happen in one
    /// atomic step or not at all. `None` means membership was unchanged and no
    /// counter was touched.
    async fn set_update_counted(
        &self,
        key: &str,
        member: &str,
        change: Membership,
        counters: &[(String, i64)],
    ) -> CacheResult<Option<Vec<Increment>>>;

    /// Insert or update a sorted set member.
    async fn zset_put(&self, key: &str, member: &str, score: f64) -> CacheResult<()>;

    async fn zset_remove(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn zset_score(&self, key: &str, member: &str) -> CacheResult<Option<f64>>;

    /// Members in ascending `(score, member)` order, inclusive index range.
    async fn zset_range(&self, key: &str, start: usize, stop: usize)
        -> CacheResult<Vec<(String, f64)>>;

    async fn ping(&self) -> CacheResult<()>;
}

/// Namespace to physical store mapping.
#[derive(Clone)]
pub struct StoreRouter {
    fallback: Arc<dyn CacheStore>,
    stores: HashMap<CacheNamespace, Arc<dyn CacheStore>>,
}

impl StoreRouter {
    /// Route every namespace to the same store. Keys stay disjoint through
    /// their namespace prefix.
    pub fn single(store: Arc<dyn CacheStore>) -> Self {
        Self::with_overrides(store, HashMap::new())
    }

    /// Route namespaces found in `overrides` to their own store and everything
    /// else to `fallback`.
    pub fn with_overrides(
        fallback: Arc<dyn CacheStore>,
        overrides: HashMap<CacheNamespace, Arc<dyn CacheStore>>,
    ) -> Self {
        let stores = CacheNamespace::ALL
            .iter()
            .map(|ns| {
                let store = overrides.get(ns).cloned().unwrap_or_else(|| fallback.clone());
                (*ns, store)
            })
            .collect();
        Self { fallback, stores }
    }

    pub fn store(&self, namespace: CacheNamespace) -> Arc<dyn CacheStore> {
        self.stores
            .get(&namespace)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// One entry per physical store, for health checks.
    pub fn distinct(&self) -> Vec<(CacheNamespace, Arc<dyn CacheStore>)> {
        let mut seen: Vec<(CacheNamespace, Arc<dyn CacheStore>)> = Vec::new();
        for ns in CacheNamespace::ALL {
            let store = self.store(ns);
            if !seen.iter().any(|(_, s)| Arc::ptr_eq(s, &store)) {
                seen.push((ns, store));
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_store_routes_everything() {
        let store: Arc<dyn CacheStore> = Arc::new(InMemoryStore::new());
        let router = StoreRouter::single(store.clone());
        for ns in CacheNamespace::ALL {
            assert!(Arc::ptr_eq(&router.store(ns), &store));
        }
        assert_eq!(router.distinct().len(), 1);
    }

    #[test]
    fn test_overrides_are_distinct() {
        let fallback: Arc<dyn CacheStore> = Arc::new(InMemoryStore::new());
        let counters: Arc<dyn CacheStore> = Arc::new(InMemoryStore::new());
        let mut overrides = HashMap::new();
        overrides.insert(CacheNamespace::Counter, counters.clone());

        let router = StoreRouter::with_overrides(fallback.clone(), overrides);
        assert!(Arc::ptr_eq(&router.store(CacheNamespace::Counter), &counters));
        assert!(Arc::ptr_eq(&router.store(CacheNamespace::Feed), &fallback));
        assert_eq!(router.distinct().len(), 2);
    }
}
