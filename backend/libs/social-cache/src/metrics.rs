//! Cache metrics for observability

use crate::keys::CacheKey;
use prometheus::{CounterVec, Opts, Registry};
use std::sync::OnceLock;

static METRICS: OnceLock<CacheMetricsInner> = OnceLock::new();

struct CacheMetricsInner {
    hits: CounterVec,
    misses: CounterVec,
    writes: CounterVec,
    invalidations: CounterVec,
    errors: CounterVec,
    fallbacks: CounterVec,
    inconsistencies: CounterVec,
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> CounterVec {
    CounterVec::new(Opts::new(name, help), labels).expect("valid metric definition")
}

impl CacheMetricsInner {
    fn new() -> Self {
        Self {
            hits: counter_vec("social_cache_hits_total", "Total cache hits", &["namespace"]),
            misses: counter_vec(
                "social_cache_misses_total",
                "Total cache misses by reason",
                &["namespace", "reason"],
            ),
            writes: counter_vec(
                "social_cache_writes_total",
                "Total cache writes",
                &["namespace"],
            ),
            invalidations: counter_vec(
                "social_cache_invalidations_total",
                "Total feed version bumps",
                &["namespace"],
            ),
            errors: counter_vec(
                "social_cache_errors_total",
                "Total store errors downgraded to misses",
                &["namespace", "error_type"],
            ),
            fallbacks: counter_vec(
                "social_cache_fallbacks_total",
                "Reads served from the primary store",
                &["operation"],
            ),
            inconsistencies: counter_vec(
                "social_cache_inconsistencies_total",
                "Detected counter/state inconsistencies",
                &["kind"],
            ),
        }
    }

    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.hits.clone()))?;
        registry.register(Box::new(self.misses.clone()))?;
        registry.register(Box::new(self.writes.clone()))?;
        registry.register(Box::new(self.invalidations.clone()))?;
        registry.register(Box::new(self.errors.clone()))?;
        registry.register(Box::new(self.fallbacks.clone()))?;
        registry.register(Box::new(self.inconsistencies.clone()))?;
        Ok(())
    }
}

fn get_metrics() -> &'static CacheMetricsInner {
    METRICS.get_or_init(CacheMetricsInner::new)
}

fn namespace_label(key: &str) -> &str {
    CacheKey::namespace_of(key).unwrap_or("unknown")
}

/// Cache metrics wrapper
#[derive(Clone, Default)]
pub struct CacheMetrics;

impl CacheMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Register metrics with a Prometheus registry
    pub fn register(registry: &Registry) -> Result<(), prometheus::Error> {
        get_metrics().register(registry)
    }

    pub fn record_hit(&self, key: &str) {
        get_metrics()
            .hits
            .with_label_values(&[namespace_label(key)])
            .inc();
    }

    pub fn record_miss(&self, key: &str, reason: &str) {
        get_metrics()
            .misses
            .with_label_values(&[namespace_label(key), reason])
            .inc();
    }

    pub fn record_write(&self, key: &str) {
        get_metrics()
            .writes
            .with_label_values(&[namespace_label(key)])
            .inc();
    }

    pub fn record_invalidation(&self, key: &str) {
        get_metrics()
            .invalidations
            .with_label_values(&[namespace_label(key)])
            .inc();
    }

    pub fn record_error(&self, key: &str, error_type: &str) {
        get_metrics()
            .errors
            .with_label_values(&[namespace_label(key), error_type])
            .inc();
    }

    pub fn record_fallback(&self, operation: &str) {
        get_metrics()
            .fallbacks
            .with_label_values(&[operation])
            .inc();
    }

    pub fn record_inconsistency(&self, kind: &str) {
        get_metrics()
            .inconsistencies
            .with_label_values(&[kind])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_once() {
        let registry = Registry::new();
        CacheMetrics::register(&registry).unwrap();
        CacheMetrics::new().record_hit("feed:page:abc");
        CacheMetrics::new().record_inconsistency("counter_clamped");

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "social_cache_hits_total"));
        // Registering the same collectors twice is rejected by prometheus.
        assert!(CacheMetrics::register(&registry).is_err());
    }
}
