//! Key router and cache key schema
//!
//! Every physical key is `{namespace}:{raw_key}`. Namespaces map onto separate
//! Redis logical databases with their own TTL and eviction policy, so the same
//! raw key never collides across namespaces.

use crate::model::{CounterKind, PostId, UserId};
use crate::{CacheError, CacheResult};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// Logical partition of the cache keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    Feed,
    Session,
    Counter,
    Broker,
    Results,
    Default,
}

impl CacheNamespace {
    pub const ALL: [CacheNamespace; 6] = [
        CacheNamespace::Feed,
        CacheNamespace::Session,
        CacheNamespace::Counter,
        CacheNamespace::Broker,
        CacheNamespace::Results,
        CacheNamespace::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheNamespace::Feed => "feed",
            CacheNamespace::Session => "session",
            CacheNamespace::Counter => "counter",
            CacheNamespace::Broker => "broker",
            CacheNamespace::Results => "results",
            CacheNamespace::Default => "default",
        }
    }

    /// Built-in placement and TTL for the namespace.
    pub fn default_policy(&self) -> NamespacePolicy {
        match self {
            CacheNamespace::Default => NamespacePolicy::expiring(1, ttl::DEFAULT),
            CacheNamespace::Feed => NamespacePolicy::expiring(1, ttl::FEED),
            CacheNamespace::Session => NamespacePolicy::expiring(2, ttl::SESSION),
            CacheNamespace::Counter => NamespacePolicy::persistent(3),
            CacheNamespace::Broker => NamespacePolicy::persistent(4),
            CacheNamespace::Results => NamespacePolicy::expiring(5, ttl::RESULTS),
        }
    }

    /// Build a physical key without validation. Only used with raw keys that
    /// are non-empty by construction.
    fn key(&self, raw: impl fmt::Display) -> String {
        format!("{}:{}", self.as_str(), raw)
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default TTL values (seconds)
pub mod ttl {
    pub const DEFAULT: u64 = 300; // 5 minutes
    pub const FEED: u64 = 300; // 5 minutes
    pub const FEED_MAX: u64 = 1800; // 30 minutes
    pub const SESSION: u64 = 86_400; // 24 hours
    pub const RESULTS: u64 = 3600; // 1 hour
    pub const POST_DETAILS: u64 = 1800; // 30 minutes
    pub const USER_POSTS: u64 = 600; // 10 minutes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Entries disappear when their TTL elapses.
    Ttl,
    /// Entries are only removed explicitly.
    Never,
}

/// Physical placement of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespacePolicy {
    /// Redis logical database index.
    pub database: u8,
    pub default_ttl: Option<Duration>,
    pub eviction: EvictionPolicy,
}

impl NamespacePolicy {
    const fn expiring(database: u8, ttl_secs: u64) -> Self {
        Self {
            database,
            default_ttl: Some(Duration::from_secs(ttl_secs)),
            eviction: EvictionPolicy::Ttl,
        }
    }

    const fn persistent(database: u8) -> Self {
        Self {
            database,
            default_ttl: None,
            eviction: EvictionPolicy::Never,
        }
    }
}

/// Maps namespaces to physical stores and builds physical keys.
#[derive(Debug, Clone)]
pub struct KeyRouter {
    feed_ttl: Duration,
}

impl Default for KeyRouter {
    fn default() -> Self {
        Self {
            feed_ttl: Duration::from_secs(ttl::FEED),
        }
    }
}

impl KeyRouter {
    pub fn new(feed_ttl: Duration) -> Self {
        Self { feed_ttl }
    }

    /// Resolve a raw key into `{namespace}:{raw_key}`.
    pub fn resolve(&self, namespace: CacheNamespace, raw_key: &str) -> CacheResult<String> {
        resolve(namespace, raw_key)
    }

    pub fn policy(&self, namespace: CacheNamespace) -> NamespacePolicy {
        let mut policy = namespace.default_policy();
        if namespace == CacheNamespace::Feed {
            policy.default_ttl = Some(self.feed_ttl);
        }
        policy
    }
}

/// Pure key resolution. Fails only on an empty raw key.
pub fn resolve(namespace: CacheNamespace, raw_key: &str) -> CacheResult<String> {
    if raw_key.trim().is_empty() {
        return Err(CacheError::InvalidKey(format!(
            "empty raw key for namespace '{}'",
            namespace
        )));
    }
    Ok(namespace.key(raw_key))
}

/// Cache key builder for the fixed key families of this crate.
pub struct CacheKey;

impl CacheKey {
    // ============= Counter namespace (persistent) =============

    /// Format: counter:{subject_id}:{kind}
    pub fn counter(subject_id: u64, kind: CounterKind) -> String {
        CacheNamespace::Counter.key(format_args!("{}:{}", subject_id, kind))
    }

    /// Feed version stamp. Kept in the persistent namespace so it cannot
    /// expire while cached pages stamped with older versions still exist.
    /// Format: counter:feed_version:{user_id}
    pub fn feed_version(user_id: UserId) -> String {
        CacheNamespace::Counter.key(format_args!("feed_version:{}", user_id))
    }

    /// Users who liked a post. Format: counter:liked_by:{post_id}
    pub fn liked_by(post_id: PostId) -> String {
        CacheNamespace::Counter.key(format_args!("liked_by:{}", post_id))
    }

    /// Users following a user. Format: counter:followed_by:{user_id}
    pub fn followed_by(user_id: UserId) -> String {
        CacheNamespace::Counter.key(format_args!("followed_by:{}", user_id))
    }

    /// Ranked trending posts. Format: counter:trending:posts
    pub fn trending() -> String {
        CacheNamespace::Counter.key("trending:posts")
    }

    /// Post creation time (unix seconds) used for trending decay.
    pub fn post_created_at(post_id: PostId) -> String {
        CacheNamespace::Counter.key(format_args!("post_created:{}", post_id))
    }

    /// Version of an author's post listing pages.
    /// Format: counter:user_posts_version:{author_id}
    pub fn user_posts_version(author_id: UserId) -> String {
        CacheNamespace::Counter.key(format_args!("user_posts_version:{}", author_id))
    }

    // ============= Default namespace (raw keys) =============

    /// Raw key of a post's details. Format: post:{post_id}
    pub fn post_details(post_id: PostId) -> String {
        format!("post:{}", post_id)
    }

    /// Raw key of one page of an author's posts, stamped with the listing
    /// version. Format: user_posts:{author_id}:v{version}:page:{page}:per:{n}
    pub fn user_posts_page(author_id: UserId, version: u64, page: u32, items_per_page: u32) -> String {
        format!(
            "user_posts:{}:v{}:page:{}:per:{}",
            author_id, version, page, items_per_page
        )
    }

    // ============= Feed namespace =============

    /// Feed page snapshot.
    /// Format: feed:page:{hash(user_id, page, items_per_page)}
    pub fn feed_page(user_id: UserId, page: u32, items_per_page: u32) -> String {
        CacheNamespace::Feed.key(format_args!(
            "page:{}",
            feed_page_hash(user_id, page, items_per_page)
        ))
    }

    // ============= Utility =============

    /// Extract the namespace segment of a physical key.
    pub fn namespace_of(key: &str) -> Option<&str> {
        key.split_once(':').map(|(ns, _)| ns)
    }
}

/// Stable 16 hex character digest of a feed page identity.
pub fn feed_page_hash(user_id: UserId, page: u32, items_per_page: u32) -> String {
    let digest = Sha256::digest(
        format!("user_feed:{}:page:{}:per_page:{}", user_id, page, items_per_page).as_bytes(),
    );
    let mut hash = hex::encode(digest);
    hash.truncate(16);
    hash
}
