//! Prometheus metrics for token resolution

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, Histogram, HistogramOpts, IntCounter,
    IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Latency buckets for token resolution (seconds)
const RESOLVE_SECONDS_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
];

/// Resolver metrics registered in a resolver-owned registry
pub struct AclMetrics {
    registry: Registry,

    /// Identity lookups served from cache (Counter)
    pub token_cache_hit: IntCounter,

    /// Identity lookups that went to the authority (Counter)
    pub token_cache_miss: IntCounter,

    /// End-to-end token resolution latency (Histogram)
    pub resolve_token_seconds: Histogram,

    /// Resolutions answered by the down policy, per policy (Counter)
    pub down_policy_applied: IntCounterVec,
}

impl AclMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let token_cache_hit = register_int_counter_with_registry!(
            Opts::new("acl_token_cache_hit", "Token identity lookups served from cache"),
            registry
        )?;

        let token_cache_miss = register_int_counter_with_registry!(
            Opts::new("acl_token_cache_miss", "Token identity lookups fetched from the authority"),
            registry
        )?;

        let resolve_token_seconds = register_histogram_with_registry!(
            HistogramOpts::new("acl_resolve_token_seconds", "Time to resolve a token to an authorizer")
                .buckets(RESOLVE_SECONDS_BUCKETS.to_vec()),
            registry
        )?;

        let down_policy_applied = register_int_counter_vec_with_registry!(
            Opts::new("acl_down_policy_applied", "Resolutions answered by the down policy"),
            &["policy"],
            registry
        )?;

        Ok(Self {
            registry,
            token_cache_hit,
            token_cache_miss,
            resolve_token_seconds,
            down_policy_applied,
        })
    }

    pub fn record_resolve(&self, elapsed: Duration) {
        self.resolve_token_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn record_down_policy(&self, policy: &str) {
        self.down_policy_applied.with_label_values(&[policy]).inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let down_policy_applied = ["allow", "deny", "extend-cache", "async-cache"]
            .iter()
            .map(|policy| self.down_policy_applied.with_label_values(&[*policy]).get())
            .sum();

        MetricsSnapshot {
            token_cache_hits: self.token_cache_hit.get(),
            token_cache_misses: self.token_cache_miss.get(),
            resolutions: self.resolve_token_seconds.get_sample_count(),
            down_policy_applied,
        }
    }
}

impl std::fmt::Debug for AclMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub token_cache_hits: u64,
    pub token_cache_misses: u64,
    pub resolutions: u64,
    pub down_policy_applied: u64,
}

impl MetricsSnapshot {
    /// Calculate token cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.token_cache_hits + self.token_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.token_cache_hits as f64 / total as f64
        }
    }
}
