//! Interaction state: who liked a post, who follows a user.
//!
//! One set per target, members are user ids. `add`/`remove` report whether
//! membership changed. `add_counted`/`remove_counted` also move the matching
//! counters inside the same atomic step, which keeps `cardinality(target)`
//! equal to the counter value even when a write fails halfway.

use crate::counter::CounterDelta;
use crate::keys::CacheKey;
use crate::model::UserId;
use crate::store::{CacheStore, Increment, Membership};
use crate::CacheResult;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// user -> post
    Liked,
    /// follower -> followee
    Follows,
}

impl Relation {
    fn target_key(&self, target_id: u64) -> String {
        match self {
            Relation::Liked => CacheKey::liked_by(target_id),
            Relation::Follows => CacheKey::followed_by(target_id),
        }
    }
}

#[derive(Clone)]
pub struct InteractionStateStore {
    store: Arc<dyn CacheStore>,
    relation: Relation,
}

impl InteractionStateStore {
    pub fn new(store: Arc<dyn CacheStore>, relation: Relation) -> Self {
        Self { store, relation }
    }

    pub fn likes(store: Arc<dyn CacheStore>) -> Self {
        Self::new(store, Relation::Liked)
    }

    pub fn follows(store: Arc<dyn CacheStore>) -> Self {
        Self::new(store, Relation::Follows)
    }

    pub fn relation(&self) -> Relation {
        self.relation
    }

    /// Returns `true` if the pair was not present before.
    pub async fn add(&self, user_id: UserId, target_id: u64) -> CacheResult<bool> {
        let key = self.relation.target_key(target_id);
        self.store.set_add(&key, &user_id.to_string()).await
    }

    /// Returns `true` if the pair was present before.
    pub async fn remove(&self, user_id: UserId, target_id: u64) -> CacheResult<bool> {
        let key = self.relation.target_key(target_id);
        self.store.set_remove(&key, &user_id.to_string()).await
    }

    /// `add` that applies `counters` in the same atomic step when the pair is
    /// new. `None` when it was already present; nothing was changed then.
    pub async fn add_counted(
        &self,
        user_id: UserId,
        target_id: u64,
        counters: &[CounterDelta],
    ) -> CacheResult<Option<Vec<(CounterDelta, Increment)>>> {
        self.update_counted(user_id, target_id, Membership::Insert, counters)
            .await
    }

    /// `remove` that applies `counters` in the same atomic step when the pair
    /// was present.
    pub async fn remove_counted(
        &self,
        user_id: UserId,
        target_id: u64,
        counters: &[CounterDelta],
    ) -> CacheResult<Option<Vec<(CounterDelta, Increment)>>> {
        self.update_counted(user_id, target_id, Membership::Remove, counters)
            .await
    }

    async fn update_counted(
        &self,
        user_id: UserId,
        target_id: u64,
        change: Membership,
        counters: &[CounterDelta],
    ) -> CacheResult<Option<Vec<(CounterDelta, Increment)>>> {
        let key = self.relation.target_key(target_id);
        let deltas: Vec<(String, i64)> = counters.iter().map(|c| (c.key(), c.delta)).collect();
        let applied = self
            .store
            .set_update_counted(&key, &user_id.to_string(), change, &deltas)
            .await?;
        Ok(applied.map(|results| counters.iter().copied().zip(results).collect()))
    }

    pub async fn contains(&self, user_id: UserId, target_id: u64) -> CacheResult<bool> {
        let key = self.relation.target_key(target_id);
        self.store.set_contains(&key, &user_id.to_string()).await
    }

    /// Number of users in the relation with `target_id`.
    pub async fn cardinality(&self, target_id: u64) -> CacheResult<u64> {
        let key = self.relation.target_key(target_id);
        self.store.set_len(&key).await
    }

    /// Forget every member of `target_id`.
    pub async fn clear(&self, target_id: u64) -> CacheResult<bool> {
        self.store.del(&self.relation.target_key(target_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let likes = InteractionStateStore::likes(Arc::new(InMemoryStore::new()));
        assert!(likes.add(1, 7).await.unwrap());
        assert!(!likes.add(1, 7).await.unwrap());
        assert!(likes.contains(1, 7).await.unwrap());
        assert_eq!(likes.cardinality(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_non_member_is_noop() {
        let likes = InteractionStateStore::likes(Arc::new(InMemoryStore::new()));
        assert!(!likes.remove(1, 7).await.unwrap());
        assert!(!likes.contains(1, 7).await.unwrap());
        assert_eq!(likes.cardinality(7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relations_do_not_overlap() {
        let store: Arc<dyn CacheStore> = Arc::new(InMemoryStore::new());
        let likes = InteractionStateStore::likes(store.clone());
        let follows = InteractionStateStore::follows(store);

        likes.add(1, 7).await.unwrap();
        assert!(!follows.contains(1, 7).await.unwrap());

        follows.add(1, 7).await.unwrap();
        likes.remove(1, 7).await.unwrap();
        assert!(follows.contains(1, 7).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_target() {
        let likes = InteractionStateStore::likes(Arc::new(InMemoryStore::new()));
        likes.add(1, 7).await.unwrap();
        likes.add(2, 7).await.unwrap();
        likes.add(1, 8).await.unwrap();

        assert!(likes.clear(7).await.unwrap());
        assert_eq!(likes.cardinality(7).await.unwrap(), 0);
        assert!(likes.contains(1, 8).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_counted_moves_counter_once() {
        let store = Arc::new(InMemoryStore::new());
        let likes = InteractionStateStore::likes(store.clone());
        let counters = crate::counter::CounterStore::new(store);
        let like = [CounterDelta::new(7, crate::model::CounterKind::Likes, 1)];

        let applied = likes.add_counted(1, 7, &like).await.unwrap().unwrap();
        assert_eq!(applied[0].1.value, 1);
        assert!(likes.add_counted(1, 7, &like).await.unwrap().is_none());
        assert_eq!(counters.get(7, crate::model::CounterKind::Likes).await.unwrap(), 1);

        let unlike = [CounterDelta::new(7, crate::model::CounterKind::Likes, -1)];
        assert!(likes.remove_counted(1, 7, &unlike).await.unwrap().is_some());
        assert!(likes.remove_counted(1, 7, &unlike).await.unwrap().is_none());
        assert_eq!(counters.get(7, crate::model::CounterKind::Likes).await.unwrap(), 0);
        assert_eq!(likes.cardinality(7).await.unwrap(), 0);
    }
}
