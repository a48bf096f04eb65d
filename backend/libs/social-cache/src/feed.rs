//! Versioned feed page cache
//!
//! Each user has a version stamp starting at 1. Pages are stored under a
//! stable hash of `(user_id, page, items_per_page)` together with the version
//! that was current when the page was computed. Invalidation bumps the
//! version and leaves stored pages alone: a page whose stamp differs from the
//! current version is never served and is reclaimed by TTL or overwrite.
//!
//! The version counter is stored as `version - 1` so an absent key reads as
//! version 1 and the first bump is a plain atomic increment.

use crate::codec::PayloadCodec;
use crate::keys::{ttl, CacheKey};
use crate::metrics::CacheMetrics;
use crate::model::{FeedPage, PostSummary, UserId};
use crate::store::CacheStore;
use crate::CacheResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cached feed page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedCacheEntry {
    pub user_id: UserId,
    pub page: u32,
    pub items_per_page: u32,
    /// Feed version this page was computed against
    pub version: u64,
    pub items: Vec<PostSummary>,
    pub total_items: u64,
    pub total_pages: u32,
    pub fetched_at: DateTime<Utc>,
}

impl FeedCacheEntry {
    pub fn into_page(self) -> FeedPage {
        FeedPage {
            items: self.items,
            total_items: self.total_items,
            total_pages: self.total_pages,
            current_page: self.page,
        }
    }

    fn is_for(&self, user_id: UserId, page: u32, items_per_page: u32) -> bool {
        self.user_id == user_id && self.page == page && self.items_per_page == items_per_page
    }

    fn is_older_than(&self, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => Utc::now() - self.fetched_at >= ttl,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    StaleVersion { stored: u64, current: u64 },
    Expired,
    Corrupt,
    Unavailable,
}

impl MissReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissReason::Absent => "absent",
            MissReason::StaleVersion { .. } => "stale_version",
            MissReason::Expired => "expired",
            MissReason::Corrupt => "corrupt",
            MissReason::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedLookup {
    Hit(FeedCacheEntry),
    Miss(MissReason),
}

impl FeedLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, FeedLookup::Hit(_))
    }

    pub fn into_entry(self) -> Option<FeedCacheEntry> {
        match self {
            FeedLookup::Hit(entry) => Some(entry),
            FeedLookup::Miss(_) => None,
        }
    }
}

/// Feed cache operations
#[derive(Clone)]
pub struct FeedCache {
    pages: Arc<dyn CacheStore>,
    versions: Arc<dyn CacheStore>,
    codec: PayloadCodec,
    ttl: Duration,
    metrics: CacheMetrics,
}

impl FeedCache {
    /// `pages` backs the feed namespace, `versions` the persistent counter
    /// namespace.
    pub fn new(pages: Arc<dyn CacheStore>, versions: Arc<dyn CacheStore>) -> Self {
        Self {
            pages,
            versions,
            codec: PayloadCodec::default(),
            ttl: Duration::from_secs(ttl::FEED),
            metrics: CacheMetrics::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn current_version(&self, user_id: UserId) -> CacheResult<u64> {
        let stored = self
            .versions
            .get_int(&CacheKey::feed_version(user_id))
            .await?;
        Ok(1 + stored.unwrap_or(0).max(0) as u64)
    }

    /// Look up a page. Any store or decode failure is reported as a miss.
    pub async fn get(&self, user_id: UserId, page: u32, items_per_page: u32) -> FeedLookup {
        let key = CacheKey::feed_page(user_id, page, items_per_page);
        let lookup = self.lookup(&key, user_id, page, items_per_page).await;

        match &lookup {
            FeedLookup::Hit(entry) => {
                debug!(user_id, page, version = entry.version, "Feed cache hit");
                self.metrics.record_hit(&key);
            }
            FeedLookup::Miss(reason) => {
                debug!(user_id, page, reason = reason.as_str(), "Feed cache miss");
                self.metrics.record_miss(&key, reason.as_str());
            }
        }
        lookup
    }

    async fn lookup(
        &self,
        key: &str,
        user_id: UserId,
        page: u32,
        items_per_page: u32,
    ) -> FeedLookup {
        let current = match self.current_version(user_id).await {
            Ok(version) => version,
            Err(e) => {
                warn!(user_id, error = %e, "Feed version read failed, treating as miss");
                self.metrics.record_error(key, "version_read");
                return FeedLookup::Miss(MissReason::Unavailable);
            }
        };

        let bytes = match self.pages.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return FeedLookup::Miss(MissReason::Absent),
            Err(e) => {
                warn!(key = %key, error = %e, "Feed cache read failed, treating as miss");
                self.metrics.record_error(key, "store");
                return FeedLookup::Miss(MissReason::Unavailable);
            }
        };

        let entry: FeedCacheEntry = match self.codec.decode(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Feed cache entry undecodable");
                self.metrics.record_error(key, "deserialize");
                if let Err(e) = self.pages.del(key).await {
                    debug!(key = %key, error = %e, "Corrupt feed entry not removed");
                }
                return FeedLookup::Miss(MissReason::Corrupt);
            }
        };

        if !entry.is_for(user_id, page, items_per_page) {
            warn!(key = %key, user_id, "Feed cache key collision");
            return FeedLookup::Miss(MissReason::Absent);
        }
        if entry.version != current {
            return FeedLookup::Miss(MissReason::StaleVersion {
                stored: entry.version,
                current,
            });
        }
        if entry.is_older_than(self.ttl) {
            return FeedLookup::Miss(MissReason::Expired);
        }

        FeedLookup::Hit(entry)
    }

    /// Store a page stamped with the user's current version.
    pub async fn put(
        &self,
        user_id: UserId,
        page: u32,
        items_per_page: u32,
        payload: &FeedPage,
    ) -> CacheResult<u64> {
        let version = self.current_version(user_id).await?;
        self.put_versioned(user_id, page, items_per_page, payload, version)
            .await?;
        Ok(version)
    }

    /// Store a page stamped with `version`, read before the payload was
    /// computed. If an invalidation landed in between, the page is stored
    /// already stale and is never served.
    pub async fn put_versioned(
        &self,
        user_id: UserId,
        page: u32,
        items_per_page: u32,
        payload: &FeedPage,
        version: u64,
    ) -> CacheResult<()> {
        let key = CacheKey::feed_page(user_id, page, items_per_page);
        let entry = FeedCacheEntry {
            user_id,
            page,
            items_per_page,
            version,
            items: payload.items.clone(),
            total_items: payload.total_items,
            total_pages: payload.total_pages,
            fetched_at: Utc::now(),
        };
        let bytes = self.codec.encode(&entry)?;
        self.pages.set(&key, bytes, Some(self.ttl)).await?;

        debug!(user_id, page, version, "Feed page cached");
        self.metrics.record_write(&key);
        Ok(())
    }

    /// Bump the user's feed version. O(1); stored pages are left in place.
    pub async fn invalidate(&self, user_id: UserId) -> CacheResult<u64> {
        let key = CacheKey::feed_version(user_id);
        let stored = self.versions.incr_clamped(&key, 1).await?;
        let version = stored.value + 1;

        debug!(user_id, version, "Feed invalidated");
        self.metrics.record_invalidation(&key);
        Ok(version)
    }

    /// Invalidate several feeds, e.g. every follower of a posting author.
    /// Every bump is attempted; if any failed the first error is returned so
    /// the caller can retry the whole batch. Returns the number of bumps.
    pub async fn invalidate_many(&self, user_ids: &[UserId]) -> CacheResult<usize> {
        let mut invalidated = 0;
        let mut first_error = None;
        for &user_id in user_ids {
            match self.invalidate(user_id).await {
                Ok(_) => invalidated += 1,
                Err(e) => {
                    warn!(user_id, error = %e, "Feed invalidation failed");
                    self.metrics
                        .record_error(&CacheKey::feed_version(user_id), "invalidate");
                    first_error.get_or_insert(e);
                }
            }
        }
        if !user_ids.is_empty() {
            debug!(count = invalidated, requested = user_ids.len(), "Batch invalidated feeds");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(invalidated),
        }
    }
}
