//! Configuration for the social cache
//!
//! Loads configuration from environment variables.

use crate::codec::DEFAULT_COMPRESSION_THRESHOLD;
use crate::facade::FacadeSettings;
use crate::keys::ttl;
use crate::trending::TrendingWeights;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Which store implementation backs the namespaces
    pub backend: CacheBackend,
    /// Redis connection settings
    pub redis: RedisConfig,
    /// Upper bound for a single store command
    pub op_timeout: Duration,
    /// Lifetime of cached feed pages
    pub feed_ttl: Duration,
    /// Payloads at or above this size are compressed
    pub compression_threshold: usize,
    pub trending: TrendingConfig,
    pub health: HealthCheckConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    /// In-process store, for local development and tests
    Memory,
}

impl FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(CacheBackend::Redis),
            "memory" | "in-memory" | "inmemory" => Ok(CacheBackend::Memory),
            other => bail!("unknown cache backend '{}', expected 'redis' or 'memory'", other),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL without a database path; the database comes from the
    /// namespace layout
    pub url: String,
    /// Connection establishment timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendingConfig {
    pub like_weight: f64,
    pub comment_weight: f64,
    pub share_weight: f64,
    pub decay_per_hour: f64,
}

impl Default for TrendingConfig {
    fn default() -> Self {
        let weights = TrendingWeights::default();
        Self {
            like_weight: weights.likes,
            comment_weight: weights.comments,
            share_weight: weights.shares,
            decay_per_hour: weights.decay_per_hour,
        }
    }
}

impl TrendingConfig {
    pub fn weights(&self) -> TrendingWeights {
        TrendingWeights {
            likes: self.like_weight,
            comments: self.comment_weight,
            shares: self.share_weight,
            decay_per_hour: self.decay_per_hour,
        }
    }
}

/// Periodic store ping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub check_interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_health_check_interval(),
        }
    }
}

// Default values
fn default_connect_timeout() -> Duration {
    redis_utils::DEFAULT_CONNECT_TIMEOUT
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(250);

/// Parse an optional environment variable, failing on a malformed value.
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value '{}' for {}: {}", raw, name, e)),
        Err(_) => Ok(None),
    }
}

impl CacheConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let backend = match std::env::var("CACHE_BACKEND") {
            Ok(raw) => raw.parse().context("CACHE_BACKEND")?,
            Err(_) => CacheBackend::Redis,
        };

        let url = match std::env::var("REDIS_URL") {
            Ok(url) => url,
            Err(_) => {
                let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
                let port = env_parse::<u16>("REDIS_PORT")?.unwrap_or(6379);
                redis_utils::redis_url_from_parts(&host, port)
            }
        };
        let redis = RedisConfig {
            url,
            connect_timeout: env_parse::<u64>("REDIS_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or_else(default_connect_timeout),
        };

        let defaults = TrendingConfig::default();
        let trending = TrendingConfig {
            like_weight: env_parse("TRENDING_LIKE_WEIGHT")?.unwrap_or(defaults.like_weight),
            comment_weight: env_parse("TRENDING_COMMENT_WEIGHT")?
                .unwrap_or(defaults.comment_weight),
            share_weight: env_parse("TRENDING_SHARE_WEIGHT")?.unwrap_or(defaults.share_weight),
            decay_per_hour: env_parse("TRENDING_DECAY_PER_HOUR")?
                .unwrap_or(defaults.decay_per_hour),
        };

        let health = HealthCheckConfig {
            enabled: env_parse("REDIS_HEALTH_CHECK_ENABLED")?.unwrap_or(true),
            check_interval: env_parse::<u64>("REDIS_HEALTH_CHECK_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or_else(default_health_check_interval),
        };

        let config = CacheConfig {
            backend,
            redis,
            op_timeout: env_parse::<u64>("CACHE_OP_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_OP_TIMEOUT),
            feed_ttl: Duration::from_secs(
                env_parse("FEED_CACHE_TTL_SECS")?.unwrap_or(ttl::FEED),
            ),
            compression_threshold: env_parse("CACHE_COMPRESSION_THRESHOLD")?
                .unwrap_or(DEFAULT_COMPRESSION_THRESHOLD),
            trending,
            health,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let feed_secs = self.feed_ttl.as_secs();
        if !(ttl::FEED..=ttl::FEED_MAX).contains(&feed_secs) {
            bail!(
                "FEED_CACHE_TTL_SECS must be between {} and {}, got {}",
                ttl::FEED,
                ttl::FEED_MAX,
                feed_secs
            );
        }
        if self.op_timeout.is_zero() {
            bail!("CACHE_OP_TIMEOUT_MS must be greater than zero");
        }
        if self.health.enabled && self.health.check_interval.is_zero() {
            bail!("REDIS_HEALTH_CHECK_INTERVAL_SECS must be greater than zero");
        }
        let t = &self.trending;
        for (name, value) in [
            ("TRENDING_LIKE_WEIGHT", t.like_weight),
            ("TRENDING_COMMENT_WEIGHT", t.comment_weight),
            ("TRENDING_SHARE_WEIGHT", t.share_weight),
            ("TRENDING_DECAY_PER_HOUR", t.decay_per_hour),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{} must be a non-negative number, got {}", name, value);
            }
        }
        Ok(())
    }

    pub fn facade_settings(&self) -> FacadeSettings {
        FacadeSettings {
            feed_ttl: self.feed_ttl,
            compression_threshold: self.compression_threshold,
            trending_weights: self.trending.weights(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Redis,
            redis: RedisConfig {
                url: redis_utils::redis_url_from_parts("localhost", 6379),
                connect_timeout: default_connect_timeout(),
            },
            op_timeout: DEFAULT_OP_TIMEOUT,
            feed_ttl: Duration::from_secs(ttl::FEED),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            trending: TrendingConfig::default(),
            health: HealthCheckConfig::default(),
        }
    }
}
