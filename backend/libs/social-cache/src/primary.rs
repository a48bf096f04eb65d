//! Source of truth consulted on cache misses.

use crate::model::{CounterKind, FeedPage, PostId, PostSummary, UserId};
use async_trait::async_trait;

/// The relational store behind the cache. Implemented by the application;
/// the cache never writes through it.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Compute one page of a user's personalized feed.
    async fn fetch_feed_page(
        &self,
        user_id: UserId,
        page: u32,
        items_per_page: u32,
    ) -> anyhow::Result<FeedPage>;

    /// Authoritative count for a subject, e.g. the number of comments on a
    /// post. Only consulted for counters not backed by a like/follow set.
    async fn fetch_post_count(&self, post_id: PostId, kind: CounterKind) -> anyhow::Result<u64>;

    /// A single active post, `None` if it does not exist or was deleted.
    async fn fetch_post(&self, post_id: PostId) -> anyhow::Result<Option<PostSummary>>;

    /// One page of the posts written by `author_id`, newest first.
    async fn fetch_user_posts(
        &self,
        author_id: UserId,
        page: u32,
        items_per_page: u32,
    ) -> anyhow::Result<FeedPage>;

    /// Ranking used while the trending set is empty or unreachable: most
    /// liked first, newer first among equals.
    async fn fetch_top_posts(&self, k: usize, page: usize) -> anyhow::Result<Vec<PostId>>;
}
