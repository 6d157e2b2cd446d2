use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Instruments one service factory cache.
///
/// An unregistered default records into detached metrics, which keeps
/// instrumentation optional for embedded and test use.
#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    misses: Counter,
    evictions: Counter,
    size: Gauge,
    idle: Gauge,
}

impl CacheMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "misses",
            "Total number of cache lookups that built a new factory",
            metrics.misses.clone(),
        );
        reg.register(
            "evictions",
            "Total number of factories evicted from the cache",
            metrics.evictions.clone(),
        );
        reg.register(
            "size",
            "Number of cached service factories",
            metrics.size.clone(),
        );
        reg.register(
            "idle",
            "Number of cached service factories with no outstanding services",
            metrics.idle.clone(),
        );
        metrics
    }

    pub(crate) fn incr_miss(&self) {
        self.misses.inc();
    }

    pub(crate) fn incr_eviction(&self) {
        self.evictions.inc();
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.size.set(size as i64);
    }

    pub(crate) fn set_idle(&self, idle: usize) {
        self.idle.set(idle as i64);
    }

    pub fn misses(&self) -> u64 {
        self.misses.get()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.get()
    }

    pub fn size(&self) -> i64 {
        self.size.get()
    }

    pub fn idle(&self) -> i64 {
        self.idle.get()
    }
}
