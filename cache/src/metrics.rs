use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for the [Cache](crate::Cache).
#[derive(Default)]
pub(crate) struct Metrics {
    /// Number of page lookups served from a ready page
    pub hits: Counter,
    /// Number of page lookups that created a page and faulted it
    pub misses: Counter,
    /// Number of page lookups that joined a fault already in flight
    pub coalesced: Counter,
    /// Number of fetches issued to the backend
    pub faults: Counter,
    /// Number of fetches that failed or were aborted
    pub fault_failures: Counter,
    /// Number of pages destroyed by eviction
    pub evictions: Counter,
    /// Number of pages destroyed because they were stale or invalidated
    pub invalidations: Counter,
    /// Number of pages currently resident
    pub pages: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "hits",
            "Number of page lookups served from a ready page",
            metrics.hits.clone(),
        );
        registry.register(
            "misses",
            "Number of page lookups that created a page and faulted it",
            metrics.misses.clone(),
        );
        registry.register(
            "coalesced",
            "Number of page lookups that joined a fault already in flight",
            metrics.coalesced.clone(),
        );
        registry.register(
            "faults",
            "Number of fetches issued to the backend",
            metrics.faults.clone(),
        );
        registry.register(
            "fault_failures",
            "Number of fetches that failed or were aborted",
            metrics.fault_failures.clone(),
        );
        registry.register(
            "evictions",
            "Number of pages destroyed by eviction",
            metrics.evictions.clone(),
        );
        registry.register(
            "invalidations",
            "Number of pages destroyed because they were stale or invalidated",
            metrics.invalidations.clone(),
        );
        registry.register(
            "pages",
            "Number of pages currently resident",
            metrics.pages.clone(),
        );
        metrics
    }
}
