//! Trending ranking
//!
//! Score = likes*w1 + comments*w2 + shares*w3 - decay_per_hour*age_hours,
//! recomputed from the current counters on every engagement write. There is
//! no background sweep: a post without engagement keeps its last score.
//!
//! Scores are stored negated so that an ascending range over the sorted set
//! yields highest score first, with equal scores ordered by member ascending.
//! Members are zero-padded post ids, making lexical order equal numeric order.

use crate::counter::CounterStore;
use crate::keys::CacheKey;
use crate::model::{CounterKind, PostId};
use crate::store::CacheStore;
use crate::CacheResult;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendingWeights {
    pub likes: f64,
    pub comments: f64,
    pub shares: f64,
    pub decay_per_hour: f64,
}

impl Default for TrendingWeights {
    fn default() -> Self {
        Self {
            likes: 1.0,
            comments: 2.0,
            shares: 3.0,
            decay_per_hour: 0.1,
        }
    }
}

impl TrendingWeights {
    pub fn score(&self, likes: u64, comments: u64, shares: u64, age_hours: f64) -> f64 {
        likes as f64 * self.likes + comments as f64 * self.comments + shares as f64 * self.shares
            - self.decay_per_hour * age_hours.max(0.0)
    }
}

fn member(post_id: PostId) -> String {
    format!("{:020}", post_id)
}

/// Inclusive index range of 1-based `page` of size `k`, `None` on overflow.
fn page_bounds(k: usize, page: usize) -> Option<(usize, usize)> {
    let start = (page.max(1) - 1).checked_mul(k)?;
    let stop = start.checked_add(k - 1)?;
    Some((start, stop))
}

#[derive(Clone)]
pub struct TrendingRanker {
    store: Arc<dyn CacheStore>,
    counters: CounterStore,
    weights: TrendingWeights,
}

impl TrendingRanker {
    pub fn new(store: Arc<dyn CacheStore>, counters: CounterStore, weights: TrendingWeights) -> Self {
        Self {
            store,
            counters,
            weights,
        }
    }

    pub fn weights(&self) -> TrendingWeights {
        self.weights
    }

    /// Remember when a post was created and enter it into the ranking.
    pub async fn register_post(&self, post_id: PostId, created_at: DateTime<Utc>) -> CacheResult<f64> {
        self.store
            .set_if_absent(
                &CacheKey::post_created_at(post_id),
                created_at.timestamp().to_string().into_bytes(),
            )
            .await?;
        self.recompute(post_id).await
    }

    /// Recompute the score of `post_id` after an engagement of `kind`.
    pub async fn record_engagement(&self, post_id: PostId, kind: CounterKind) -> CacheResult<f64> {
        if !kind.is_engagement() {
            debug!(post_id, kind = %kind, "Non-engagement counter does not affect trending");
        }
        self.recompute(post_id).await
    }

    async fn recompute(&self, post_id: PostId) -> CacheResult<f64> {
        let likes = self.counters.get(post_id, CounterKind::Likes).await?;
        let comments = self.counters.get(post_id, CounterKind::Comments).await?;
        let shares = self.counters.get(post_id, CounterKind::Shares).await?;
        let age_hours = self.age_hours(post_id).await?;

        let score = self.weights.score(likes, comments, shares, age_hours);
        // `+ 0.0` folds -0.0 into 0.0 so equal scores share one sort key.
        self.store
            .zset_put(&CacheKey::trending(), &member(post_id), -score + 0.0)
            .await?;

        debug!(post_id, likes, comments, shares, age_hours, score, "Trending score updated");
        Ok(score)
    }

    async fn age_hours(&self, post_id: PostId) -> CacheResult<f64> {
        match self
            .store
            .get_int(&CacheKey::post_created_at(post_id))
            .await?
        {
            Some(created) => {
                let age_secs = (Utc::now().timestamp() - created).max(0);
                Ok(age_secs as f64 / 3600.0)
            }
            None => {
                debug!(post_id, "Post creation time unknown, no decay applied");
                Ok(0.0)
            }
        }
    }

    /// Page `page` (1-based) of `k` post ids, highest score first.
    pub async fn top_k(&self, k: usize, page: usize) -> CacheResult<Vec<PostId>> {
        Ok(self
            .top_k_with_scores(k, page)
            .await?
            .into_iter()
            .map(|(post_id, _)| post_id)
            .collect())
    }

    pub async fn top_k_with_scores(&self, k: usize, page: usize) -> CacheResult<Vec<(PostId, f64)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        // A page beyond the addressable range is simply empty.
        let Some((start, stop)) = page_bounds(k, page) else {
            debug!(k, page, "Trending page out of range");
            return Ok(Vec::new());
        };
        let range = self
            .store
            .zset_range(&CacheKey::trending(), start, stop)
            .await?;

        Ok(range
            .into_iter()
            .filter_map(|(member, stored)| match member.parse::<PostId>() {
                Ok(post_id) => Some((post_id, -stored + 0.0)),
                Err(_) => {
                    warn!(member = %member, "Malformed trending member skipped");
                    None
                }
            })
            .collect())
    }

    pub async fn score(&self, post_id: PostId) -> CacheResult<Option<f64>> {
        let stored = self
            .store
            .zset_score(&CacheKey::trending(), &member(post_id))
            .await?;
        Ok(stored.map(|s| -s + 0.0))
    }

    /// Drop a deleted post from the ranking.
    pub async fn remove(&self, post_id: PostId) -> CacheResult<bool> {
        let removed = self
            .store
            .zset_remove(&CacheKey::trending(), &member(post_id))
            .await?;
        self.store.del(&CacheKey::post_created_at(post_id)).await?;
        Ok(removed)
    }
}
