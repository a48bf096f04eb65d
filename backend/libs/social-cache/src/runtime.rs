//! Store lifecycle: connect on startup, periodic health check, shutdown.

use crate::config::{CacheBackend, CacheConfig};
use crate::facade::CacheFacade;
use crate::keys::CacheNamespace;
use crate::primary::PrimaryStore;
use crate::store::{CacheStore, InMemoryStore, RedisStore, StoreRouter};
use crate::CacheResult;
use anyhow::{Context, Result};
use redis_utils::RedisPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Failures in a row before the health loop escalates to `error!`.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Owns the physical stores behind every namespace. Cloning shares them.
#[derive(Clone)]
pub struct CacheRuntime {
    config: CacheConfig,
    stores: StoreRouter,
    shutdown: Arc<watch::Sender<bool>>,
}

impl CacheRuntime {
    /// Connect to the configured backend. With Redis, one connection manager
    /// is opened per logical database in the namespace layout.
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        let stores = match config.backend {
            CacheBackend::Memory => {
                info!("Using in-memory cache store");
                StoreRouter::single(Arc::new(InMemoryStore::new()))
            }
            CacheBackend::Redis => Self::connect_redis(&config).await?,
        };
        info!(
            backend = ?config.backend,
            op_timeout_ms = config.op_timeout.as_millis() as u64,
            feed_ttl_secs = config.feed_ttl.as_secs(),
            "Cache runtime ready"
        );
        Ok(Self::from_stores(config, stores))
    }

    async fn connect_redis(config: &CacheConfig) -> Result<StoreRouter> {
        let mut by_database: BTreeMap<u8, Arc<dyn CacheStore>> = BTreeMap::new();
        let mut routes = HashMap::new();

        for namespace in CacheNamespace::ALL {
            let database = namespace.default_policy().database;
            let store = match by_database.get(&database) {
                Some(store) => store.clone(),
                None => {
                    let pool = RedisPool::connect_with_timeout(
                        &config.redis.url,
                        i64::from(database),
                        config.redis.connect_timeout,
                    )
                    .await
                    .with_context(|| {
                        format!("failed to connect Redis database {} ({})", database, namespace)
                    })?;
                    let store: Arc<dyn CacheStore> =
                        Arc::new(RedisStore::from_pool(&pool, config.op_timeout));
                    by_database.insert(database, store.clone());
                    store
                }
            };
            debug!(namespace = %namespace, database, "Namespace routed");
            routes.insert(namespace, store);
        }

        let fallback = routes
            .get(&CacheNamespace::Default)
            .cloned()
            .context("default namespace has no store")?;
        Ok(StoreRouter::with_overrides(fallback, routes))
    }

    /// Runtime over an in-process store with default settings.
    pub fn in_memory() -> Self {
        let config = CacheConfig {
            backend: CacheBackend::Memory,
            ..CacheConfig::default()
        };
        Self::from_stores(config, StoreRouter::single(Arc::new(InMemoryStore::new())))
    }

    /// Runtime over already constructed stores.
    pub fn from_stores(config: CacheConfig, stores: StoreRouter) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            stores,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stores(&self) -> &StoreRouter {
        &self.stores
    }

    pub fn facade(&self, primary: Arc<dyn PrimaryStore>) -> CacheFacade {
        CacheFacade::new(self.stores.clone(), primary, self.config.facade_settings())
    }

    /// Ping every physical store once.
    pub async fn health_check(&self) -> CacheResult<()> {
        for (namespace, store) in self.stores.distinct() {
            if let Err(e) = store.ping().await {
                warn!(namespace = %namespace, error = %e, "Store ping failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Ping the stores every `check_interval` until [`shutdown`] is called.
    /// Keeps idle Redis connections alive and surfaces outages early.
    ///
    /// [`shutdown`]: CacheRuntime::shutdown
    pub async fn run_health_checks(&self) {
        let health = &self.config.health;
        if !health.enabled {
            info!("Cache health check disabled by configuration");
            return;
        }

        info!(
            interval_secs = health.check_interval.as_secs(),
            "Starting cache health check loop"
        );

        let mut shutdown = self.shutdown.subscribe();
        let mut consecutive_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = sleep(health.check_interval) => {}
                _ = shutdown.changed() => break,
            }

            match self.health_check().await {
                Ok(()) => {
                    if consecutive_failures > 0 {
                        info!(
                            previous_failures = consecutive_failures,
                            "Cache store connection recovered"
                        );
                    }
                    consecutive_failures = 0;
                    debug!("Cache health check: OK");
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            consecutive_failures,
                            error = %e,
                            "Cache health check: CRITICAL - multiple consecutive failures"
                        );
                    } else {
                        warn!(consecutive_failures, error = %e, "Cache health check: FAILED");
                    }
                }
            }
        }

        info!("Cache health check loop stopped");
    }

    /// Stop background loops. Connections close when the last clone drops.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Cache runtime shutting down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_memory_runtime_is_healthy() {
        let runtime = CacheRuntime::in_memory();
        assert!(runtime.health_check().await.is_ok());
        assert_eq!(runtime.stores().distinct().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = CacheConfig {
            backend: CacheBackend::Memory,
            ..CacheConfig::default()
        };
        let runtime = CacheRuntime::connect(config).await.unwrap();
        assert!(runtime.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_reports_outage() {
        let store = Arc::new(InMemoryStore::new());
        let runtime = CacheRuntime::from_stores(CacheConfig::default(), StoreRouter::single(store.clone()));
        store.set_offline(true);
        assert!(runtime.health_check().await.is_err());
        store.set_offline(false);
        assert!(runtime.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_health_loop_stops_on_shutdown() {
        let config = CacheConfig {
            backend: CacheBackend::Memory,
            health: HealthCheckConfig {
                enabled: true,
                check_interval: Duration::from_millis(5),
            },
            ..CacheConfig::default()
        };
        let runtime = CacheRuntime::from_stores(config, StoreRouter::single(Arc::new(InMemoryStore::new())));

        let looping = runtime.clone();
        let handle = tokio::spawn(async move { looping.run_health_checks().await });

        sleep(Duration::from_millis(20)).await;
        runtime.shutdown();
        assert!(runtime.is_shut_down());

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("health loop should stop after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_health_loop_returns_immediately() {
        let mut runtime = CacheRuntime::in_memory();
        runtime.config.health.enabled = false;
        tokio::time::timeout(Duration::from_millis(100), runtime.run_health_checks())
            .await
            .unwrap();
    }
}
