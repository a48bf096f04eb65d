//! In-process store backed by `DashMap`.
//!
//! Mirrors the Redis semantics the cache relies on (TTL, INCRBY, SADD/SREM,
//! ZADD ordering by `(score, member)`). Each mutation holds the shard lock of
//! its key for the whole step, which gives the same atomicity per key as the
//! single-threaded Redis command loop.

use super::{CacheStore, Increment, Membership};
use crate::{CacheError, CacheResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    #[inline]
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }
}

/// Total order over f64 scores for the sorted index.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn put(&mut self, member: &str, score: f64) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(Score(previous), member.to_string()));
        }
        self.ordered.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }
}

/// In-memory [`CacheStore`] for tests and single-process development.
#[derive(Default)]
pub struct InMemoryStore {
    values: DashMap<String, StoredValue>,
    sets: DashMap<String, HashSet<String>>,
    zsets: DashMap<String, SortedSet>,
    offline: AtomicBool,
    /// operation -> key fragment that makes it fail (`None`: every key)
    faults: DashMap<&'static str, Option<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `StoreUnavailable`
    /// until the store is brought back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Make `operation` fail with `StoreUnavailable`, either for every key or
    /// only for keys containing `key_fragment`. Other operations keep working.
    pub fn fail_operation(&self, operation: &'static str, key_fragment: Option<&str>) {
        self.faults
            .insert(operation, key_fragment.map(str::to_string));
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Drop everything. Administrative flush.
    pub fn flush(&self) {
        self.values.clear();
        self.sets.clear();
        self.zsets.clear();
    }

    fn check(&self, operation: &'static str, key: &str) -> CacheResult<()> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(CacheError::unavailable(operation, "in-memory store offline"));
        }
        if let Some(fault) = self.faults.get(operation) {
            let hit = match fault.value() {
                Some(fragment) => key.contains(fragment.as_str()),
                None => true,
            };
            if hit {
                return Err(CacheError::unavailable(operation, "injected fault"));
            }
        }
        Ok(())
    }

    /// INCRBY clamped at zero. Holds the entry lock of `key` for the whole step.
    fn apply_increment(&self, key: &str, delta: i64) -> CacheResult<Increment> {
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new(b"0".to_vec(), None));
        if entry.is_expired() {
            *entry = StoredValue::new(b"0".to_vec(), None);
        }

        let current = parse_int(key, &entry.data)?;
        let raw = current.saturating_add(delta);
        let (value, clamped) = if raw < 0 { (0, true) } else { (raw, false) };
        entry.data = value.to_string().into_bytes();

        Ok(Increment {
            value: value as u64,
            clamped,
        })
    }

    /// Membership change plus counter deltas under the set's entry lock. Counter
    /// values are validated before anything is written.
    fn update_counted(
        &self,
        set: &mut HashSet<String>,
        member: &str,
        change: Membership,
        counters: &[(String, i64)],
    ) -> CacheResult<Option<Vec<Increment>>> {
        let present = set.contains(member);
        let changes = match change {
            Membership::Insert => !present,
            Membership::Remove => present,
        };
        if !changes {
            return Ok(None);
        }

        for (counter_key, _) in counters {
            if let Some(data) = self.live_value(counter_key) {
                parse_int(counter_key, &data)?;
            }
        }

        match change {
            Membership::Insert => set.insert(member.to_string()),
            Membership::Remove => set.remove(member),
        };
        counters
            .iter()
            .map(|(counter_key, delta)| self.apply_increment(counter_key, *delta))
            .collect::<CacheResult<Vec<_>>>()
            .map(Some)
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        let expired = match self.values.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.data.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove_if(key, |_, v| v.is_expired());
        }
        None
    }
}

fn parse_int(key: &str, data: &[u8]) -> CacheResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| CacheError::Serialization(format!("value at '{}' is not an integer", key)))
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check("get", key)?;
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        self.check("set", key)?;
        self.values
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> CacheResult<bool> {
        self.check("set_if_absent", key)?;
        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, None));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, None));
                Ok(true)
            }
        }
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        self.check("del", key)?;
        let removed = self.values.remove(key).is_some()
            | self.sets.remove(key).is_some()
            | self.zsets.remove(key).is_some();
        Ok(removed)
    }

    async fn get_int(&self, key: &str) -> CacheResult<Option<i64>> {
        self.check("get_int", key)?;
        match self.live_value(key) {
            Some(data) => parse_int(key, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn incr_clamped(&self, key: &str, delta: i64) -> CacheResult<Increment> {
        self.check("incr_clamped", key)?;
        self.apply_increment(key, delta)
    }

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.check("set_add", key)?;
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.check("set_remove", key)?;
        let removed = match self.sets.get_mut(key) {
            Some(mut set) => set.remove(member),
            None => false,
        };
        self.sets.remove_if(key, |_, set| set.is_empty());
        Ok(removed)
    }

    async fn set_contains(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.check("set_contains", key)?;
        Ok(self
            .sets
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    async fn set_len(&self, key: &str) -> CacheResult<u64> {
        self.check("set_len", key)?;
        Ok(self.sets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn set_update_counted(
        &self,
        key: &str,
        member: &str,
        change: Membership,
        counters: &[(String, i64)],
    ) -> CacheResult<Option<Vec<Increment>>> {
        self.check("set_update_counted", key)?;
        for (counter_key, _) in counters {
            self.check("set_update_counted", counter_key)?;
        }

        let outcome = {
            let mut set = self.sets.entry(key.to_string()).or_default();
            self.update_counted(&mut set, member, change, counters)
        };
        self.sets.remove_if(key, |_, set| set.is_empty());
        outcome
    }

    async fn zset_put(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        self.check("zset_put", key)?;
        self.zsets
            .entry(key.to_string())
            .or_default()
            .put(member, score);
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.check("zset_remove", key)?;
        let removed = match self.zsets.get_mut(key) {
            Some(mut zset) => zset.remove(member),
            None => false,
        };
        self.zsets.remove_if(key, |_, zset| zset.scores.is_empty());
        Ok(removed)
    }

    async fn zset_score(&self, key: &str, member: &str) -> CacheResult<Option<f64>> {
        self.check("zset_score", key)?;
        Ok(self
            .zsets
            .get(key)
            .and_then(|zset| zset.scores.get(member).copied()))
    }

    async fn zset_range(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> CacheResult<Vec<(String, f64)>> {
        self.check("zset_range", key)?;
        if stop < start {
            return Ok(Vec::new());
        }
        Ok(self
            .zsets
            .get(key)
            .map(|zset| {
                zset.ordered
                    .iter()
                    .skip(start)
                    .take(stop - start + 1)
                    .map(|(score, member)| (member.clone(), score.0))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check("ping", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_value_expires() {
        let store = InMemoryStore::new();
        store
            .set("k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_clamps_at_zero() {
        let store = InMemoryStore::new();
        let inc = store.incr_clamped("c", 2).await.unwrap();
        assert_eq!(inc, Increment { value: 2, clamped: false });

        let inc = store.incr_clamped("c", -5).await.unwrap();
        assert_eq!(inc, Increment { value: 0, clamped: true });
        assert_eq!(store.get_int("c").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let store = InMemoryStore::new();
        store.set("c", b"abc".to_vec(), None).await.unwrap();
        assert!(matches!(
            store.incr_clamped("c", 1).await,
            Err(CacheError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.incr_clamped("hits", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get_int("hits").await.unwrap(), Some(800));
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("seed", b"5".to_vec()).await.unwrap());
        assert!(!store.set_if_absent("seed", b"9".to_vec()).await.unwrap());
        assert_eq!(store.get_int("seed").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_zset_orders_by_score_then_member() {
        let store = InMemoryStore::new();
        store.zset_put("z", "b", 1.0).await.unwrap();
        store.zset_put("z", "a", 1.0).await.unwrap();
        store.zset_put("z", "c", -3.0).await.unwrap();
        store.zset_put("z", "c", 5.0).await.unwrap();

        let range = store.zset_range("z", 0, 10).await.unwrap();
        let members: Vec<&str> = range.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["a", "b", "c"]);
        assert_eq!(store.zset_score("z", "c").await.unwrap(), Some(5.0));

        assert!(store.zset_remove("z", "a").await.unwrap());
        assert_eq!(store.zset_range("z", 0, 0).await.unwrap()[0].0, "b");
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.get("k").await,
            Err(CacheError::StoreUnavailable { .. })
        ));
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_set_update_counted_moves_counters_only_on_change() {
        let store = InMemoryStore::new();
        let counters = vec![("likes".to_string(), 1)];

        let applied = store
            .set_update_counted("liked", "u1", Membership::Insert, &counters)
            .await
            .unwrap();
        assert_eq!(applied, Some(vec![Increment { value: 1, clamped: false }]));
        assert_eq!(
            store
                .set_update_counted("liked", "u1", Membership::Insert, &counters)
                .await
                .unwrap(),
            None
        );
        assert_eq!(store.get_int("likes").await.unwrap(), Some(1));

        let removed = store
            .set_update_counted("liked", "u1", Membership::Remove, &[("likes".to_string(), -1)])
            .await
            .unwrap();
        assert_eq!(removed, Some(vec![Increment { value: 0, clamped: false }]));
        assert_eq!(store.set_len("liked").await.unwrap(), 0);
        assert!(store.sets.get("liked").is_none());
    }

    #[tokio::test]
    async fn test_set_update_counted_is_all_or_nothing() {
        let store = InMemoryStore::new();
        store.set("likes", b"abc".to_vec(), None).await.unwrap();

        let result = store
            .set_update_counted("liked", "u1", Membership::Insert, &[("likes".to_string(), 1)])
            .await;
        assert!(matches!(result, Err(CacheError::Serialization(_))));
        assert!(!store.set_contains("liked", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_fault_hits_one_operation() {
        let store = InMemoryStore::new();
        store.fail_operation("incr_clamped", Some(":likes"));

        assert!(matches!(
            store.incr_clamped("counter:7:likes", 1).await,
            Err(CacheError::StoreUnavailable { .. })
        ));
        assert!(store.incr_clamped("counter:7:shares", 1).await.is_ok());
        assert!(store.set_add("s", "m").await.is_ok());

        store.clear_faults();
        assert!(store.incr_clamped("counter:7:likes", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_zset_remove_prunes_empty_set() {
        let store = InMemoryStore::new();
        store.zset_put("z", "a", 1.0).await.unwrap();
        assert!(store.zset_remove("z", "a").await.unwrap());
        assert!(store.zsets.get("z").is_none());
        assert!(store.zset_range("z", 0, 10).await.unwrap().is_empty());
    }
}
