//! Cache facade used by request handlers.
//!
//! Write path: feed and listing versions are bumped first, then interaction
//! state and counters move in one atomic step, then the trending score.
//! Multi-step writes run every step and return the first failure, and each
//! step is idempotent, so a retry completes what a failed call left undone.
//! Read path: cache first, primary store on miss, with every store failure
//! downgraded to a miss. Only `InvalidKey` and primary store failures reach
//! the caller on reads.

use crate::codec::PayloadCodec;
use crate::counter::{CounterDelta, CounterStore};
use crate::feed::{FeedCache, FeedLookup};
use crate::interaction::InteractionStateStore;
use crate::keys::{ttl, CacheKey, CacheNamespace, KeyRouter};
use crate::metrics::CacheMetrics;
use crate::model::{CounterKind, FeedPage, PostId, PostSummary, UserId};
use crate::primary::PrimaryStore;
use crate::store::{Increment, StoreRouter};
use crate::trending::{TrendingRanker, TrendingWeights};
use crate::{CacheError, CacheResult};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tunables for [`CacheFacade`].
#[derive(Debug, Clone)]
pub struct FacadeSettings {
    pub feed_ttl: Duration,
    pub compression_threshold: usize,
    pub trending_weights: TrendingWeights,
}

impl Default for FacadeSettings {
    fn default() -> Self {
        Self {
            feed_ttl: Duration::from_secs(ttl::FEED),
            compression_threshold: crate::codec::DEFAULT_COMPRESSION_THRESHOLD,
            trending_weights: TrendingWeights::default(),
        }
    }
}

/// Spread expiries of keys written together by up to 10%.
fn add_jitter(ttl: Duration) -> Duration {
    let jitter_percent = rand::random::<u32>() % 10;
    ttl + ttl * jitter_percent / 100
}

/// Remember the first failure of a multi-step write.
fn keep_first<T>(first: &mut Option<CacheError>, result: CacheResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            first.get_or_insert(e);
            None
        }
    }
}

/// Post detail lookup that distinguishes a missing post from a failure.
enum DetailsError {
    Missing,
    Cache(CacheError),
}

impl From<CacheError> for DetailsError {
    fn from(err: CacheError) -> Self {
        DetailsError::Cache(err)
    }
}

#[derive(Clone)]
pub struct CacheFacade {
    stores: StoreRouter,
    keys: KeyRouter,
    codec: PayloadCodec,
    feed: FeedCache,
    counters: CounterStore,
    likes: InteractionStateStore,
    follows: InteractionStateStore,
    trending: TrendingRanker,
    primary: Arc<dyn PrimaryStore>,
    metrics: CacheMetrics,
}

impl CacheFacade {
    pub fn new(stores: StoreRouter, primary: Arc<dyn PrimaryStore>, settings: FacadeSettings) -> Self {
        let keys = KeyRouter::new(settings.feed_ttl);
        let codec = PayloadCodec::new(settings.compression_threshold);
        let persistent = stores.store(CacheNamespace::Counter);

        let counters = CounterStore::new(persistent.clone());
        let feed = FeedCache::new(stores.store(CacheNamespace::Feed), persistent.clone())
            .with_ttl(settings.feed_ttl)
            .with_codec(codec);
        let trending = TrendingRanker::new(
            persistent.clone(),
            counters.clone(),
            settings.trending_weights,
        );

        Self {
            keys,
            codec,
            feed,
            likes: InteractionStateStore::likes(persistent.clone()),
            follows: InteractionStateStore::follows(persistent),
            counters,
            trending,
            stores,
            primary,
            metrics: CacheMetrics::new(),
        }
    }

    pub fn feed(&self) -> &FeedCache {
        &self.feed
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn likes(&self) -> &InteractionStateStore {
        &self.likes
    }

    pub fn follows(&self) -> &InteractionStateStore {
        &self.follows
    }

    pub fn trending_ranker(&self) -> &TrendingRanker {
        &self.trending
    }

    pub fn key_router(&self) -> &KeyRouter {
        &self.keys
    }

    // ============= Generic read-through =============

    /// Return the cached value for `raw_key`, or compute, store and return it.
    ///
    /// `ttl` defaults to the namespace policy. Concurrent misses may each
    /// compute; the last write wins. Store and decode failures count as a
    /// miss, so only an invalid key or an error from `compute` is returned.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        namespace: CacheNamespace,
        raw_key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.keys.resolve(namespace, raw_key)?;
        let store = self.stores.store(namespace);

        match store.get(&key).await {
            Ok(Some(bytes)) => match self.codec.decode::<T>(&bytes) {
                Ok(value) => {
                    debug!(key = %key, "Cache hit");
                    self.metrics.record_hit(&key);
                    return Ok(value);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Cache entry undecodable, recomputing");
                    self.metrics.record_error(&key, "deserialize");
                    if let Err(e) = store.del(&key).await {
                        debug!(key = %key, error = %e, "Undecodable entry not removed");
                    }
                }
            },
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                self.metrics.record_miss(&key, "absent");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, recomputing");
                self.metrics.record_error(&key, "store");
            }
        }

        let value = compute().await?;

        if let Err(e) = self.put(namespace, raw_key, &value, ttl).await {
            warn!(key = %key, error = %e, "Cache write failed");
            let error_type = match e {
                CacheError::Serialization(_) => "serialize",
                _ => "store",
            };
            self.metrics.record_error(&key, error_type);
        }

        Ok(value)
    }

    /// Store `value` under `raw_key`. `ttl` defaults to the namespace policy.
    pub async fn put<T: Serialize>(
        &self,
        namespace: CacheNamespace,
        raw_key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let key = self.keys.resolve(namespace, raw_key)?;
        let ttl = ttl
            .or(self.keys.policy(namespace).default_ttl)
            .map(add_jitter);
        let bytes = self.codec.encode(value)?;
        self.stores.store(namespace).set(&key, bytes, ttl).await?;

        debug!(key = %key, ttl = ?ttl, "Cache set");
        self.metrics.record_write(&key);
        Ok(())
    }

    /// Remove a single read-through entry.
    pub async fn evict(&self, namespace: CacheNamespace, raw_key: &str) -> CacheResult<bool> {
        let key = self.keys.resolve(namespace, raw_key)?;
        let removed = self.stores.store(namespace).del(&key).await?;
        if removed {
            self.metrics.record_invalidation(&key);
        }
        Ok(removed)
    }

    // ============= Write path =============

    /// Returns `true` if the like is new.
    pub async fn like_post(&self, user_id: UserId, post_id: PostId) -> CacheResult<bool> {
        let applied = self
            .likes
            .add_counted(user_id, post_id, &[CounterDelta::new(post_id, CounterKind::Likes, 1)])
            .await?;
        let changed = self.observe_counted(applied);
        if changed {
            self.refresh_trending(post_id, CounterKind::Likes).await;
        }
        Ok(changed)
    }

    /// Returns `true` if a like was removed.
    pub async fn unlike_post(&self, user_id: UserId, post_id: PostId) -> CacheResult<bool> {
        let applied = self
            .likes
            .remove_counted(user_id, post_id, &[CounterDelta::new(post_id, CounterKind::Likes, -1)])
            .await?;
        let changed = self.observe_counted(applied);
        if changed {
            self.refresh_trending(post_id, CounterKind::Likes).await;
        }
        Ok(changed)
    }

    /// Returns the new comment count.
    pub async fn comment_on_post(&self, post_id: PostId) -> CacheResult<u64> {
        self.engage(post_id, CounterKind::Comments, 1).await
    }

    /// Returns the new comment count.
    pub async fn delete_comment(&self, post_id: PostId) -> CacheResult<u64> {
        self.engage(post_id, CounterKind::Comments, -1).await
    }

    /// Returns the new share count.
    pub async fn share_post(&self, post_id: PostId) -> CacheResult<u64> {
        self.engage(post_id, CounterKind::Shares, 1).await
    }

    async fn engage(&self, post_id: PostId, kind: CounterKind, delta: i64) -> CacheResult<u64> {
        self.ensure_seeded(post_id, kind).await?;
        let count = self.counters.increment(post_id, kind, delta).await?;
        self.refresh_trending(post_id, kind).await;
        Ok(count)
    }

    /// A new post invalidates the feeds of its author and `followers` and the
    /// author's post listing, then enters the detail cache and the ranking.
    /// Returns the number of feeds bumped.
    pub async fn publish_post(&self, post: &PostSummary, followers: &[UserId]) -> CacheResult<usize> {
        let mut affected = Vec::with_capacity(followers.len() + 1);
        affected.push(post.author_id);
        affected.extend(followers.iter().copied().filter(|id| *id != post.author_id));

        let mut first = None;
        let invalidated = keep_first(&mut first, self.feed.invalidate_many(&affected).await);
        keep_first(&mut first, self.invalidate_user_posts(post.author_id).await);

        if let Err(e) = self.cache_post_details(post).await {
            warn!(post_id = post.id, error = %e, "Post details not cached");
        }
        for kind in [CounterKind::Likes, CounterKind::Comments, CounterKind::Shares] {
            if let Err(e) = self.counters.seed(post.id, kind, 0).await {
                warn!(post_id = post.id, kind = %kind, error = %e, "Counter seed failed");
            }
        }
        if let Err(e) = self.trending.register_post(post.id, post.created_at).await {
            warn!(post_id = post.id, error = %e, "Trending registration failed");
        }

        if let Some(e) = first {
            return Err(e);
        }
        let invalidated = invalidated.unwrap_or_default();
        debug!(post_id = post.id, author_id = post.author_id, invalidated, "Post published");
        Ok(invalidated)
    }

    /// An edited post invalidates the feeds that show it and the author's
    /// listing, then replaces its cached details. Returns the number of feeds
    /// bumped.
    pub async fn update_post(&self, post: &PostSummary, affected_users: &[UserId]) -> CacheResult<usize> {
        let mut affected = Vec::with_capacity(affected_users.len() + 1);
        affected.push(post.author_id);
        affected.extend(affected_users.iter().copied().filter(|id| *id != post.author_id));

        let mut first = None;
        let invalidated = keep_first(&mut first, self.feed.invalidate_many(&affected).await);
        keep_first(&mut first, self.invalidate_user_posts(post.author_id).await);
        if let Err(e) = self.cache_post_details(post).await {
            warn!(post_id = post.id, error = %e, "Post details not refreshed, evicting");
            keep_first(&mut first, self.invalidate_post_details(post.id).await);
        }

        if let Some(e) = first {
            return Err(e);
        }
        let invalidated = invalidated.unwrap_or_default();
        debug!(post_id = post.id, invalidated, "Post updated");
        Ok(invalidated)
    }

    /// Remove every trace of a post and invalidate the feeds that showed it
    /// and the author's listing. Returns the number of feeds bumped.
    pub async fn delete_post(
        &self,
        post_id: PostId,
        author_id: UserId,
        affected_users: &[UserId],
    ) -> CacheResult<usize> {
        let mut affected = Vec::with_capacity(affected_users.len() + 1);
        affected.push(author_id);
        affected.extend(affected_users.iter().copied().filter(|id| *id != author_id));

        let mut first = None;
        let invalidated = keep_first(&mut first, self.feed.invalidate_many(&affected).await);
        keep_first(&mut first, self.invalidate_user_posts(author_id).await);
        keep_first(&mut first, self.invalidate_post_details(post_id).await);

        if let Err(e) = self.trending.remove(post_id).await {
            warn!(post_id, error = %e, "Trending removal failed");
        }
        keep_first(&mut first, self.likes.clear(post_id).await);
        for kind in [CounterKind::Likes, CounterKind::Comments, CounterKind::Shares] {
            keep_first(&mut first, self.counters.clear(post_id, kind).await);
        }

        if let Some(e) = first {
            warn!(post_id, error = %e, "Post cleanup incomplete");
            return Err(e);
        }
        let invalidated = invalidated.unwrap_or_default();
        debug!(post_id, invalidated, "Post deleted");
        Ok(invalidated)
    }

    /// Returns `true` if the follow is new.
    pub async fn follow_user(&self, follower_id: UserId, followee_id: UserId) -> CacheResult<bool> {
        // Bumped first: whatever fails afterwards, the old feed is unservable.
        self.feed.invalidate(follower_id).await?;
        let applied = self
            .follows
            .add_counted(
                follower_id,
                followee_id,
                &[
                    CounterDelta::new(followee_id, CounterKind::Followers, 1),
                    CounterDelta::new(follower_id, CounterKind::Following, 1),
                ],
            )
            .await?;
        Ok(self.observe_counted(applied))
    }

    /// Returns `true` if a follow was removed.
    pub async fn unfollow_user(&self, follower_id: UserId, followee_id: UserId) -> CacheResult<bool> {
        self.feed.invalidate(follower_id).await?;
        let applied = self
            .follows
            .remove_counted(
                follower_id,
                followee_id,
                &[
                    CounterDelta::new(followee_id, CounterKind::Followers, -1),
                    CounterDelta::new(follower_id, CounterKind::Following, -1),
                ],
            )
            .await?;
        Ok(self.observe_counted(applied))
    }

    /// Report the counter side of a membership step. Returns whether the
    /// membership changed.
    fn observe_counted(&self, applied: Option<Vec<(CounterDelta, Increment)>>) -> bool {
        match applied {
            Some(results) => {
                for (change, result) in &results {
                    self.counters.observe(change, *result);
                }
                true
            }
            None => false,
        }
    }

    async fn refresh_trending(&self, post_id: PostId, kind: CounterKind) {
        if let Err(e) = self.trending.record_engagement(post_id, kind).await {
            warn!(post_id, kind = %kind, error = %e, "Trending update failed");
            self.metrics.record_error(&CacheKey::trending(), "trending");
        }
    }

    /// Store a post's details for the detail read path.
    pub async fn cache_post_details(&self, post: &PostSummary) -> CacheResult<()> {
        self.put(
            CacheNamespace::Default,
            &CacheKey::post_details(post.id),
            post,
            Some(Duration::from_secs(ttl::POST_DETAILS)),
        )
        .await
    }

    pub async fn invalidate_post_details(&self, post_id: PostId) -> CacheResult<bool> {
        self.evict(CacheNamespace::Default, &CacheKey::post_details(post_id))
            .await
    }

    /// Bump the version of an author's post listing; cached pages of the old
    /// version are never read again and expire by TTL.
    pub async fn invalidate_user_posts(&self, author_id: UserId) -> CacheResult<u64> {
        let key = CacheKey::user_posts_version(author_id);
        let bumped = self
            .stores
            .store(CacheNamespace::Counter)
            .incr_clamped(&key, 1)
            .await?;
        debug!(author_id, version = bumped.value, "Author listing invalidated");
        self.metrics.record_invalidation(&key);
        Ok(bumped.value)
    }

    async fn user_posts_version(&self, author_id: UserId) -> CacheResult<u64> {
        let stored = self
            .stores
            .store(CacheNamespace::Counter)
            .get_int(&CacheKey::user_posts_version(author_id))
            .await?;
        Ok(stored.unwrap_or(0).max(0) as u64)
    }

    // ============= Read path =============

    /// Personalized feed page, served from cache when the cached page carries
    /// the user's current version.
    pub async fn user_feed(&self, user_id: UserId, page: u32, items_per_page: u32) -> CacheResult<FeedPage> {
        let page = page.max(1);
        let items_per_page = items_per_page.max(1);

        if let FeedLookup::Hit(entry) = self.feed.get(user_id, page, items_per_page).await {
            return Ok(entry.into_page());
        }

        // Captured before computing so a concurrent invalidation leaves the
        // stored page stale.
        let version = match self.feed.current_version(user_id).await {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(user_id, error = %e, "Feed version unavailable, result will not be cached");
                None
            }
        };

        let computed = self
            .primary
            .fetch_feed_page(user_id, page, items_per_page)
            .await
            .map_err(CacheError::Primary)?;
        self.metrics.record_fallback("user_feed");

        if let Some(version) = version {
            if let Err(e) = self
                .feed
                .put_versioned(user_id, page, items_per_page, &computed, version)
                .await
            {
                warn!(user_id, page, error = %e, "Feed page not cached");
            }
        }

        Ok(computed)
    }

    /// One page of an author's posts. Pages are keyed by the listing version
    /// read before computing, so an invalidation racing the computation
    /// leaves the stored page unreachable.
    pub async fn user_posts(&self, author_id: UserId, page: u32, items_per_page: u32) -> CacheResult<FeedPage> {
        let page = page.max(1);
        let items_per_page = items_per_page.max(1);
        let compute = move || async move {
            let computed = self
                .primary
                .fetch_user_posts(author_id, page, items_per_page)
                .await
                .map_err(CacheError::Primary)?;
            self.metrics.record_fallback("user_posts");
            Ok::<_, CacheError>(computed)
        };

        match self.user_posts_version(author_id).await {
            Ok(version) => {
                self.get_or_compute(
                    CacheNamespace::Default,
                    &CacheKey::user_posts_page(author_id, version, page, items_per_page),
                    Some(Duration::from_secs(ttl::USER_POSTS)),
                    compute,
                )
                .await
            }
            Err(e) => {
                warn!(author_id, error = %e, "Listing version unavailable, result will not be cached");
                compute().await
            }
        }
    }

    /// Post details, `None` when the post does not exist. Missing posts are
    /// not cached.
    pub async fn post_details(&self, post_id: PostId) -> CacheResult<Option<PostSummary>> {
        let result = self
            .get_or_compute(
                CacheNamespace::Default,
                &CacheKey::post_details(post_id),
                Some(Duration::from_secs(ttl::POST_DETAILS)),
                move || async move {
                    self.metrics.record_fallback("post_details");
                    match self.primary.fetch_post(post_id).await {
                        Ok(Some(post)) => Ok(post),
                        Ok(None) => Err(DetailsError::Missing),
                        Err(e) => Err(DetailsError::Cache(CacheError::Primary(e))),
                    }
                },
            )
            .await;

        match result {
            Ok(post) => Ok(Some(post)),
            Err(DetailsError::Missing) => Ok(None),
            Err(DetailsError::Cache(e)) => Err(e),
        }
    }

    /// Counter value. Counters mirroring a like/follow set read 0 until the
    /// first write; the others are seeded from the primary store on first use.
    pub async fn counter(&self, subject_id: u64, kind: CounterKind) -> CacheResult<u64> {
        let cached = match self.counters.get_raw(subject_id, kind).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(subject_id, kind = %kind, error = %e, "Counter read failed, using primary store");
                return self.fetch_count(subject_id, kind).await;
            }
        };

        match cached {
            Some(value) => Ok(value),
            None if kind.tracks_membership() => Ok(0),
            None => {
                let value = self.fetch_count(subject_id, kind).await?;
                match self.counters.seed(subject_id, kind, value).await {
                    Ok(true) => Ok(value),
                    // Someone else created it first; theirs is authoritative.
                    Ok(false) => Ok(self.counters.get(subject_id, kind).await.unwrap_or(value)),
                    Err(e) => {
                        warn!(subject_id, kind = %kind, error = %e, "Counter seed failed");
                        Ok(value)
                    }
                }
            }
        }
    }

    /// Seed a primary-backed counter before its first increment, so the value
    /// does not depend on whether it was read or written first.
    async fn ensure_seeded(&self, subject_id: u64, kind: CounterKind) -> CacheResult<()> {
        if kind.tracks_membership() || self.counters.get_raw(subject_id, kind).await?.is_some() {
            return Ok(());
        }
        let value = self.fetch_count(subject_id, kind).await?;
        self.counters.seed(subject_id, kind, value).await?;
        Ok(())
    }

    async fn fetch_count(&self, subject_id: u64, kind: CounterKind) -> CacheResult<u64> {
        let value = self
            .primary
            .fetch_post_count(subject_id, kind)
            .await
            .map_err(CacheError::Primary)?;
        self.metrics.record_fallback("counter");
        Ok(value)
    }

    /// `false` when the store cannot answer.
    pub async fn is_liked(&self, user_id: UserId, post_id: PostId) -> bool {
        self.likes.contains(user_id, post_id).await.unwrap_or_else(|e| {
            warn!(user_id, post_id, error = %e, "Like state unavailable");
            false
        })
    }

    /// `false` when the store cannot answer.
    pub async fn is_following(&self, follower_id: UserId, followee_id: UserId) -> bool {
        self.follows
            .contains(follower_id, followee_id)
            .await
            .unwrap_or_else(|e| {
                warn!(follower_id, followee_id, error = %e, "Follow state unavailable");
                false
            })
    }

    /// Trending page. Falls back to the primary store's ranking when the
    /// trending set is empty or unreachable, and to an empty page when that
    /// fails too.
    pub async fn trending(&self, k: usize, page: usize) -> Vec<PostId> {
        match self.trending.top_k(k, page).await {
            Ok(ids) if !ids.is_empty() || k == 0 => return ids,
            Ok(_) => {
                // Past the end of a non-empty ranking is just an empty page.
                if page > 1 && matches!(self.trending.top_k(1, 1).await, Ok(first) if !first.is_empty()) {
                    return Vec::new();
                }
                debug!(k, page, "Trending set empty, using primary store");
            }
            Err(e) => warn!(k, page, error = %e, "Trending unavailable, using primary store"),
        }

        self.metrics.record_fallback("trending");
        self.primary
            .fetch_top_posts(k, page)
            .await
            .unwrap_or_else(|e| {
                warn!(k, page, error = %e, "Primary ranking unavailable");
                Vec::new()
            })
    }

    /// Compare the like set of a post with its counter. A mismatch is logged
    /// and counted; the return value says whether both agree.
    pub async fn verify_like_consistency(&self, post_id: PostId) -> CacheResult<bool> {
        let members = self.likes.cardinality(post_id).await?;
        let counted = self.counters.get(post_id, CounterKind::Likes).await?;
        if members != counted {
            warn!(post_id, members, counted, "Like counter disagrees with like set");
            self.metrics.record_inconsistency("like_count_mismatch");
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CacheStore, InMemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPrimary {
        feed_calls: AtomicUsize,
        count_calls: AtomicUsize,
        post_calls: AtomicUsize,
        listing_calls: AtomicUsize,
        top_calls: AtomicUsize,
    }

    fn summary(id: PostId, author_id: UserId, content: &str) -> PostSummary {
        PostSummary {
            id,
            author_id,
            content: content.to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    #[async_trait]
    impl PrimaryStore for CountingPrimary {
        async fn fetch_feed_page(&self, user_id: UserId, page: u32, items_per_page: u32) -> anyhow::Result<FeedPage> {
            self.feed_calls.fetch_add(1, Ordering::SeqCst);
            let post = summary(user_id * 100 + page as u64, 1, "hello");
            Ok(FeedPage::new(vec![post], 1, items_per_page, page))
        }

        async fn fetch_post_count(&self, _post_id: PostId, _kind: CounterKind) -> anyhow::Result<u64> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        }

        async fn fetch_post(&self, post_id: PostId) -> anyhow::Result<Option<PostSummary>> {
            self.post_calls.fetch_add(1, Ordering::SeqCst);
            Ok((post_id < 1000).then(|| summary(post_id, 1, "from primary")))
        }

        async fn fetch_user_posts(&self, author_id: UserId, page: u32, items_per_page: u32) -> anyhow::Result<FeedPage> {
            let call = self.listing_calls.fetch_add(1, Ordering::SeqCst) as u64;
            let post = summary(author_id * 1000 + call, author_id, "listing");
            Ok(FeedPage::new(vec![post], 1, items_per_page, page))
        }

        async fn fetch_top_posts(&self, _k: usize, _page: usize) -> anyhow::Result<Vec<PostId>> {
            self.top_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![500, 400])
        }
    }

    fn facade() -> (CacheFacade, Arc<InMemoryStore>, Arc<CountingPrimary>) {
        let store = Arc::new(InMemoryStore::new());
        let primary = Arc::new(CountingPrimary::default());
        let facade = CacheFacade::new(
            StoreRouter::single(store.clone()),
            primary.clone(),
            FacadeSettings::default(),
        );
        (facade, store, primary)
    }

    #[test]
    fn test_add_jitter_bounds() {
        let ttl = Duration::from_secs(300);
        let jittered = add_jitter(ttl);
        assert!(jittered >= ttl);
        assert!(jittered <= ttl + ttl / 10);
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_value() {
        let (facade, _, _) = facade();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let value: Result<String, CacheError> = facade
                .get_or_compute(CacheNamespace::Results, "report:1", None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("computed".to_string())
                })
                .await;
            assert_eq!(value.unwrap(), "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_rejects_empty_key() {
        let (facade, _, _) = facade();
        let result: Result<u32, CacheError> = facade
            .get_or_compute(CacheNamespace::Default, "", None, || async { Ok(1) })
            .await;
        assert!(matches!(result, Err(CacheError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_get_or_compute_survives_outage() {
        let (facade, store, _) = facade();
        store.set_offline(true);
        let value: Result<u32, CacheError> = facade
            .get_or_compute(CacheNamespace::Default, "k", None, || async { Ok(7) })
            .await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_get_or_compute_propagates_compute_error() {
        let (facade, _, _) = facade();
        let result: Result<u32, CacheError> = facade
            .get_or_compute(CacheNamespace::Default, "k", None, || async {
                Err(CacheError::Primary(anyhow::anyhow!("db down")))
            })
            .await;
        assert!(matches!(result, Err(CacheError::Primary(_))));
    }

    #[tokio::test]
    async fn test_get_or_compute_uses_namespace_ttl() {
        let (facade, store, _) = facade();
        let _: u32 = facade
            .get_or_compute::<_, CacheError, _, _>(CacheNamespace::Counter, "total", None, || async { Ok(5) })
            .await
            .unwrap();
        // Persistent namespace: no expiry, value readable as-is.
        assert!(store.get("counter:total").await.unwrap().is_some());
        assert!(facade.evict(CacheNamespace::Counter, "total").await.unwrap());
    }

    #[tokio::test]
    async fn test_like_unlike_keep_counter_in_step() {
        let (facade, _, _) = facade();
        assert!(facade.like_post(1, 7).await.unwrap());
        assert!(!facade.like_post(1, 7).await.unwrap());
        assert!(facade.like_post(2, 7).await.unwrap());
        assert!(facade.unlike_post(1, 7).await.unwrap());
        assert!(!facade.unlike_post(1, 7).await.unwrap());

        assert_eq!(facade.counters().get(7, CounterKind::Likes).await.unwrap(), 1);
        assert!(facade.verify_like_consistency(7).await.unwrap());
        assert!(facade.is_liked(2, 7).await);
        assert!(!facade.is_liked(1, 7).await);
        assert_eq!(facade.trending(10, 1).await, vec![7]);
    }

    #[tokio::test]
    async fn test_failed_like_leaves_nothing_behind() {
        let (facade, store, _) = facade();
        store.fail_operation("set_update_counted", Some("liked_by:7"));

        assert!(facade.like_post(1, 7).await.is_err());
        assert!(!facade.is_liked(1, 7).await);
        assert_eq!(facade.counters().get(7, CounterKind::Likes).await.unwrap(), 0);

        store.clear_faults();
        assert!(facade.like_post(1, 7).await.unwrap());
        assert_eq!(facade.counters().get(7, CounterKind::Likes).await.unwrap(), 1);
        assert!(facade.verify_like_consistency(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_like_with_broken_counter_keeps_membership_unchanged() {
        let (facade, store, _) = facade();
        let counter_key = CacheKey::counter(7, CounterKind::Likes);
        store.set(&counter_key, b"garbage".to_vec(), None).await.unwrap();

        assert!(matches!(
            facade.like_post(1, 7).await,
            Err(CacheError::Serialization(_))
        ));
        assert!(!facade.is_liked(1, 7).await);

        facade.counters().reset(7, CounterKind::Likes).await.unwrap();
        assert!(facade.like_post(1, 7).await.unwrap());
        assert!(facade.verify_like_consistency(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_follow_is_repaired_by_retry() {
        let (facade, store, _) = facade();
        store.fail_operation("set_update_counted", Some("followed_by:2"));

        assert!(facade.follow_user(1, 2).await.is_err());
        assert!(!facade.is_following(1, 2).await);
        // The feed was already invalidated before the failing step.
        assert_eq!(facade.feed().current_version(1).await.unwrap(), 2);

        store.clear_faults();
        assert!(facade.follow_user(1, 2).await.unwrap());
        assert_eq!(facade.counters().get(2, CounterKind::Followers).await.unwrap(), 1);
        assert_eq!(facade.counters().get(1, CounterKind::Following).await.unwrap(), 1);
        assert_eq!(facade.follows().cardinality(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_user_feed_reads_through_once() {
        let (facade, _, primary) = facade();
        let first = facade.user_feed(3, 1, 10).await.unwrap();
        let second = facade.user_feed(3, 1, 10).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(primary.feed_calls.load(Ordering::SeqCst), 1);

        facade.follow_user(3, 9).await.unwrap();
        facade.user_feed(3, 1, 10).await.unwrap();
        assert_eq!(primary.feed_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_user_feed_falls_back_when_store_down() {
        let (facade, store, primary) = facade();
        store.set_offline(true);
        facade.user_feed(3, 1, 10).await.unwrap();
        facade.user_feed(3, 1, 10).await.unwrap();
        assert_eq!(primary.feed_calls.load(Ordering::SeqCst), 2);
        assert!(!facade.is_liked(1, 1).await);
        assert_eq!(facade.trending(10, 1).await, vec![500, 400]);
    }

    #[tokio::test]
    async fn test_counter_seeds_from_primary_once() {
        let (facade, _, primary) = facade();
        assert_eq!(facade.counter(5, CounterKind::Comments).await.unwrap(), 42);
        assert_eq!(facade.comment_on_post(5).await.unwrap(), 43);
        assert_eq!(facade.counter(5, CounterKind::Comments).await.unwrap(), 43);
        assert_eq!(primary.count_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_counter_does_not_depend_on_call_order() {
        let (facade, _, primary) = facade();

        assert_eq!(facade.counter(5, CounterKind::Comments).await.unwrap(), 42);
        assert_eq!(facade.comment_on_post(5).await.unwrap(), 43);

        assert_eq!(facade.comment_on_post(6).await.unwrap(), 43);
        assert_eq!(facade.counter(6, CounterKind::Comments).await.unwrap(), 43);

        assert_eq!(facade.share_post(6).await.unwrap(), 43);
        assert_eq!(primary.count_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_like_counter_is_never_seeded() {
        let (facade, _, primary) = facade();
        assert_eq!(facade.counter(5, CounterKind::Likes).await.unwrap(), 0);
        assert!(facade.like_post(1, 5).await.unwrap());
        assert_eq!(facade.counter(5, CounterKind::Likes).await.unwrap(), 1);
        assert!(facade.verify_like_consistency(5).await.unwrap());
        assert_eq!(primary.count_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_follow_updates_both_counters() {
        let (facade, _, _) = facade();
        assert!(facade.follow_user(1, 2).await.unwrap());
        assert!(!facade.follow_user(1, 2).await.unwrap());
        assert!(facade.is_following(1, 2).await);
        assert!(!facade.is_following(2, 1).await);

        let counters = facade.counters();
        assert_eq!(counters.get(2, CounterKind::Followers).await.unwrap(), 1);
        assert_eq!(counters.get(1, CounterKind::Following).await.unwrap(), 1);
        assert_eq!(facade.feed().current_version(1).await.unwrap(), 3);

        assert!(facade.unfollow_user(1, 2).await.unwrap());
        assert_eq!(counters.get(2, CounterKind::Followers).await.unwrap(), 0);
        assert_eq!(counters.get(1, CounterKind::Following).await.unwrap(), 0);
        assert_eq!(facade.feed().current_version(1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_publish_and_delete_post() {
        let (facade, _, _) = facade();
        let post = summary(11, 1, "new");

        assert_eq!(facade.publish_post(&post, &[2, 3, 1]).await.unwrap(), 3);
        assert_eq!(facade.feed().current_version(2).await.unwrap(), 2);
        assert_eq!(facade.counters().get_raw(11, CounterKind::Likes).await.unwrap(), Some(0));
        assert_eq!(facade.trending(10, 1).await, vec![11]);
        assert_eq!(facade.post_details(11).await.unwrap(), Some(post));

        facade.like_post(2, 11).await.unwrap();
        assert_eq!(facade.delete_post(11, 1, &[2, 3]).await.unwrap(), 3);
        assert!(facade.trending_ranker().top_k(10, 1).await.unwrap().is_empty());
        assert!(!facade.is_liked(2, 11).await);
        assert_eq!(facade.counters().get_raw(11, CounterKind::Likes).await.unwrap(), None);
        assert_eq!(facade.feed().current_version(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_publish_invalidates_even_when_seeding_fails() {
        let (facade, store, _) = facade();
        facade.user_feed(2, 1, 10).await.unwrap();
        store.fail_operation("set_if_absent", None);

        facade.publish_post(&summary(12, 1, "new"), &[2]).await.unwrap();
        assert_eq!(facade.feed().current_version(2).await.unwrap(), 2);
        assert!(!facade.feed().get(2, 1, 10).await.is_hit());
    }

    #[tokio::test]
    async fn test_publish_reports_failed_invalidation_and_retry_completes() {
        let (facade, store, _) = facade();
        store.fail_operation("incr_clamped", Some("feed_version:3"));

        let post = summary(13, 1, "new");
        assert!(facade.publish_post(&post, &[2, 3]).await.is_err());
        assert_eq!(facade.feed().current_version(2).await.unwrap(), 2);
        assert_eq!(facade.feed().current_version(3).await.unwrap(), 1);

        store.clear_faults();
        assert_eq!(facade.publish_post(&post, &[2, 3]).await.unwrap(), 3);
        assert_eq!(facade.feed().current_version(3).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_runs_every_cleanup_step() {
        let (facade, store, _) = facade();
        facade.publish_post(&summary(14, 1, "doomed"), &[]).await.unwrap();
        facade.like_post(2, 14).await.unwrap();
        store.fail_operation("del", Some("liked_by:14"));

        assert!(facade.delete_post(14, 1, &[2]).await.is_err());
        // Later steps still ran.
        assert_eq!(facade.counters().get_raw(14, CounterKind::Likes).await.unwrap(), None);
        assert_eq!(facade.feed().current_version(2).await.unwrap(), 2);

        store.clear_faults();
        facade.delete_post(14, 1, &[2]).await.unwrap();
        assert!(!facade.is_liked(2, 14).await);
    }

    #[tokio::test]
    async fn test_post_details_read_through_and_update() {
        let (facade, _, primary) = facade();
        let first = facade.post_details(5).await.unwrap().unwrap();
        assert_eq!(first.content, "from primary");
        facade.post_details(5).await.unwrap();
        assert_eq!(primary.post_calls.load(Ordering::SeqCst), 1);

        let edited = summary(5, 1, "edited");
        assert_eq!(facade.update_post(&edited, &[2]).await.unwrap(), 2);
        assert_eq!(facade.post_details(5).await.unwrap(), Some(edited));
        assert_eq!(primary.post_calls.load(Ordering::SeqCst), 1);

        facade.delete_post(5, 1, &[]).await.unwrap();
        assert_eq!(facade.post_details(5).await.unwrap().unwrap().content, "from primary");
        assert_eq!(primary.post_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_post_is_not_cached() {
        let (facade, _, primary) = facade();
        assert_eq!(facade.post_details(5000).await.unwrap(), None);
        assert_eq!(facade.post_details(5000).await.unwrap(), None);
        assert_eq!(primary.post_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_user_posts_invalidated_by_post_writes() {
        let (facade, _, primary) = facade();
        let first = facade.user_posts(1, 1, 10).await.unwrap();
        assert_eq!(facade.user_posts(1, 1, 10).await.unwrap(), first);
        assert_eq!(primary.listing_calls.load(Ordering::SeqCst), 1);

        let post = summary(21, 1, "new");
        facade.publish_post(&post, &[]).await.unwrap();
        let after_publish = facade.user_posts(1, 1, 10).await.unwrap();
        assert_ne!(after_publish, first);
        assert_eq!(primary.listing_calls.load(Ordering::SeqCst), 2);

        facade.update_post(&post, &[]).await.unwrap();
        facade.user_posts(1, 1, 10).await.unwrap();
        facade.delete_post(21, 1, &[]).await.unwrap();
        facade.user_posts(1, 1, 10).await.unwrap();
        assert_eq!(primary.listing_calls.load(Ordering::SeqCst), 4);

        // Other authors keep their cached listing.
        facade.user_posts(2, 1, 10).await.unwrap();
        facade.user_posts(2, 1, 10).await.unwrap();
        assert_eq!(primary.listing_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_trending_falls_back_to_primary_when_empty() {
        let (facade, _, primary) = facade();
        assert_eq!(facade.trending(10, 1).await, vec![500, 400]);
        assert_eq!(primary.top_calls.load(Ordering::SeqCst), 1);

        facade.like_post(1, 7).await.unwrap();
        assert_eq!(facade.trending(10, 1).await, vec![7]);
        // Past the end of a populated ranking.
        assert!(facade.trending(10, 2).await.is_empty());
        assert_eq!(primary.top_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_trending_huge_page_does_not_panic() {
        let (facade, _, _) = facade();
        facade.like_post(1, 7).await.unwrap();
        assert!(facade.trending(10, usize::MAX).await.is_empty());
    }
}
