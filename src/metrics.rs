use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Count of cache events since the cache was created
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.add(1);
    }

    /// Record `n` events at once, e.g. every chunk of a batched lookup.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Current level of some cache state, such as resident bytes
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Overwrite with a level recomputed from the index.
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-cache metrics for observability and testing
///
/// Each Cache instance has its own set of metrics, so tests can assert on
/// one cache without interference from others.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookups
    pub hits: Counter,
    pub misses: Counter,
    pub lookups: Counter, // Chunks resolved through LayoutOps::lookup

    // Encoding
    pub decodes: Counter,
    pub encodes: Counter,
    pub inserts: Counter, // Chunks handed to LayoutOps::insert

    // Direct transfers that skipped the chunk buffer
    pub bypass_reads: Counter,
    pub bypass_writes: Counter,

    // Eviction and flush
    pub evictions: Counter,
    pub evict_values: Counter, // Victims that only dropped their values
    pub flushes: Counter,      // Chunks persisted
    pub flush_failures: Counter,

    // Extent reconciliation
    pub deletes: Counter,
    pub erases: Counter,

    // Current state, recomputed whenever the index changes
    pub entries: Gauge,
    pub bytes_cached: Gauge,
    pub dirty_entries: Gauge,
}

impl CacheMetrics {
    /// Fraction of chunk accesses served by a resident entry, if any were made.
    pub fn hit_ratio(&self) -> Option<f64> {
        let hits = self.hits.value();
        let total = hits + self.misses.value();
        (total > 0).then(|| hits as f64 / total as f64)
    }
}
