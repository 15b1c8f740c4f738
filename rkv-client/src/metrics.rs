//! # Pool Metrics
//!
//! Provide lightweight counters and an acquire-wait histogram so callers can
//! watch pool saturation, connection churn and eviction rate.
//!
//! ## Design Principles
//! 1. **Observer Hook**: The pool reports events to an optional
//!    `PoolObserver`; every hook has an empty default.
//! 2. **Accumulator Pattern**: `PoolMetrics` aggregates events in atomics.
//! 3. **Fixed Buckets**: Histogram buckets live in a contiguous array.
//!
//! ## Notes
//! - Bucket boundaries are expressed in microseconds.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::ConnectionFailure;
use crate::pool::PoolStats;
use crate::transport::Endpoint;

/// Default acquire-wait bucket boundaries in microseconds.
pub const DEFAULT_WAIT_BUCKETS_US: [u64; 12] = [
    10, 50, 100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 2_000_000,
];

/// Receives pool events. All hooks default to no-ops.
pub trait PoolObserver: Send + Sync {
    /// A lease was handed out after waiting `waited`.
    fn on_acquire(&self, _waited: Duration) {}

    /// An acquire gave up at its deadline.
    fn on_acquire_timeout(&self) {}

    fn on_connection_created(&self, _endpoint: &Endpoint) {}

    fn on_connect_failed(&self, _endpoint: &Endpoint) {}

    /// A connection was removed from the registry after failing.
    fn on_eviction(&self, _endpoint: &Endpoint, _failure: &ConnectionFailure) {}

    /// Periodic statistics from the maintenance task.
    fn on_stats(&self, _stats: &PoolStats) {}
}

/// Observer that logs pool statistics with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn on_connection_created(&self, endpoint: &Endpoint) {
        debug!(endpoint = %endpoint, "pool connection created");
    }

    fn on_stats(&self, stats: &PoolStats) {
        info!(
            population = stats.population,
            creating = stats.creating,
            leased = stats.leased,
            held = stats.held,
            max = stats.max,
            "pool stats"
        );
    }
}

/// Snapshot of pool counters at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub acquires: u64,
    pub acquire_timeouts: u64,
    pub connections_created: u64,
    pub connect_failures: u64,
    pub evictions: u64,
    /// Population reported by the latest stats tick.
    pub population: usize,
    pub acquire_wait: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    pub samples: u64,
    pub sum_us: u64,
}

/// Thread-safe counters fed by the pool.
pub struct PoolMetrics {
    acquires: AtomicU64,
    acquire_timeouts: AtomicU64,
    connections_created: AtomicU64,
    connect_failures: AtomicU64,
    evictions: AtomicU64,
    population: AtomicUsize,
    acquire_wait: LatencyHistogram,
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::with_wait_buckets(DEFAULT_WAIT_BUCKETS_US.to_vec())
    }

    /// Creates metrics with custom acquire-wait boundaries (ascending µs).
    pub fn with_wait_buckets(bounds_us: Vec<u64>) -> Self {
        PoolMetrics {
            acquires: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
            connections_created: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            population: AtomicUsize::new(0),
            acquire_wait: LatencyHistogram::new(bounds_us),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acquires: self.acquires.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            population: self.population.load(Ordering::Relaxed),
            acquire_wait: self.acquire_wait.snapshot(),
        }
    }
}

impl PoolObserver for PoolMetrics {
    fn on_acquire(&self, waited: Duration) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        self.acquire_wait.record(waited);
    }

    fn on_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connection_created(&self, _endpoint: &Endpoint) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connect_failed(&self, _endpoint: &Endpoint) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn on_eviction(&self, _endpoint: &Endpoint, _failure: &ConnectionFailure) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn on_stats(&self, stats: &PoolStats) {
        self.population.store(stats.population, Ordering::Relaxed);
    }
}

/// Fixed-bucket latency histogram.
///
/// Linear bucket scan; the list is short and stays hot in cache.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with `bounds_us.len() + 1` buckets (last is overflow).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}
