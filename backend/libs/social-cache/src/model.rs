//! Value types shared by the cache components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = u64;
pub type PostId = u64;

/// Engagement metric tracked by a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    Likes,
    Comments,
    Shares,
    Followers,
    Following,
}

impl CounterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::Likes => "likes",
            CounterKind::Comments => "comments",
            CounterKind::Shares => "shares",
            CounterKind::Followers => "followers",
            CounterKind::Following => "following",
        }
    }

    /// Whether the metric feeds the trending score.
    pub fn is_engagement(&self) -> bool {
        matches!(
            self,
            CounterKind::Likes | CounterKind::Comments | CounterKind::Shares
        )
    }
}

impl CounterKind {
    /// Counters that mirror a like/follow set. Their value is the set's
    /// cardinality, so they are never seeded from the primary store.
    pub fn tracks_membership(&self) -> bool {
        matches!(
            self,
            CounterKind::Likes | CounterKind::Followers | CounterKind::Following
        )
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post as it appears inside a cached feed page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSummary {
    pub id: PostId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One page of a user's feed as produced by the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPage {
    pub items: Vec<PostSummary>,
    pub total_items: u64,
    pub total_pages: u32,
    pub current_page: u32,
}

impl FeedPage {
    pub fn new(items: Vec<PostSummary>, total_items: u64, items_per_page: u32, page: u32) -> Self {
        let per_page = u64::from(items_per_page.max(1));
        let total_pages = u32::try_from(total_items.div_ceil(per_page)).unwrap_or(u32::MAX);
        Self {
            items,
            total_items,
            total_pages,
            current_page: page,
        }
    }

    pub fn post_ids(&self) -> Vec<PostId> {
        self.items.iter().map(|p| p.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_page_total_pages() {
        let page = FeedPage::new(Vec::new(), 21, 10, 1);
        assert_eq!(page.total_pages, 3);

        let empty = FeedPage::new(Vec::new(), 0, 10, 1);
        assert_eq!(empty.total_pages, 0);

        let huge = FeedPage::new(Vec::new(), u64::MAX, 1, 1);
        assert_eq!(huge.total_pages, u32::MAX);
    }

    #[test]
    fn test_counter_kind_engagement() {
        assert!(CounterKind::Likes.is_engagement());
        assert!(CounterKind::Shares.is_engagement());
        assert!(!CounterKind::Followers.is_engagement());
        assert_eq!(CounterKind::Following.to_string(), "following");
        assert!(CounterKind::Likes.tracks_membership());
        assert!(!CounterKind::Comments.tracks_membership());
        assert!(!CounterKind::Shares.tracks_membership());
    }
}
