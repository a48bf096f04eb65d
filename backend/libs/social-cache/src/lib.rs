//! Social feed caching and real-time counter layer
//!
//! Sits between request handlers and the relational store:
//! - Namespaced keys routed onto separate Redis logical databases
//! - Versioned feed pages, invalidated by a version bump instead of deletion
//! - Atomic, never-negative interaction counters
//! - Like/follow membership sets kept in step with the counters
//! - Trending ranking with linear age decay
//! - Post detail and per-author listing caches
//! - A facade that downgrades store failures to misses and falls back to the
//!   primary store

mod error;
mod metrics;

pub mod codec;
pub mod config;
pub mod counter;
pub mod facade;
pub mod feed;
pub mod interaction;
pub mod keys;
pub mod model;
pub mod pipeline;
pub mod primary;
pub mod runtime;
pub mod store;
pub mod trending;

pub use codec::PayloadCodec;
pub use config::{CacheBackend, CacheConfig};
pub use counter::{CounterDelta, CounterStore};
pub use error::{CacheError, CacheResult};
pub use facade::{CacheFacade, FacadeSettings};
pub use feed::{FeedCache, FeedCacheEntry, FeedLookup, MissReason};
pub use interaction::{InteractionStateStore, Relation};
pub use keys::{CacheKey, CacheNamespace, EvictionPolicy, KeyRouter, NamespacePolicy};
pub use metrics::CacheMetrics;
pub use model::{CounterKind, FeedPage, PostId, PostSummary, UserId};
pub use primary::PrimaryStore;
pub use runtime::CacheRuntime;
pub use store::{CacheStore, InMemoryStore, Increment, Membership, RedisStore, StoreRouter};
pub use trending::{TrendingRanker, TrendingWeights};
