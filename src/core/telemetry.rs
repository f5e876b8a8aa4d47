//! Cache telemetry and time source
//!
//! Counters are advisory: they are written from many request paths at once and
//! must never gate a request. Components receive a [`MetricsSink`] at
//! construction instead of touching global state, so tests can assert exact
//! counts without interference.

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Observable cache and purge events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// Store read served from the in-process tier
    MemoryHit,
    /// Store read served from the filesystem tier
    FilesystemHit,
    /// Store read served from the durable backend
    BackendHit,
    /// Store read found nothing in any tier
    StoreMiss,
    /// Caching client served a fresh entry
    FreshHit,
    /// Caching client served a stale entry inside its bounded window
    StaleServed,
    /// Conditional request answered with 304
    NotModified,
    /// Negative (404) response produced
    NegativeServed,
    /// Purge request accepted by the CDN
    PurgeSucceeded,
    /// Purge attempt failed and will be retried
    PurgeRetried,
    /// Purge retries exhausted; operator alert raised
    PurgeExhausted,
    /// Transient upstream failure retried
    UpstreamRetried,
    /// Consecutive upstream failures tripped the circuit breaker
    CircuitOpened,
    /// Fetch rejected without calling upstream while the breaker is open
    CircuitRejected,
}

/// Destination for telemetry events
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: CacheEvent);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: CacheEvent) {}
}

/// Point-in-time view of [`AtomicMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub filesystem_hits: u64,
    pub backend_hits: u64,
    pub store_misses: u64,
    pub fresh_hits: u64,
    pub stale_served: u64,
    pub not_modified: u64,
    pub negative_served: u64,
    pub purge_succeeded: u64,
    pub purge_retried: u64,
    pub purge_exhausted: u64,
    pub upstream_retried: u64,
    pub circuit_opened: u64,
    pub circuit_rejected: u64,
}

impl MetricsSnapshot {
    /// Share of store reads answered by any tier, as a percentage
    pub fn store_hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.filesystem_hits + self.backend_hits;
        let total = hits + self.store_misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

/// Lock-free counters, one cache line each
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    counters: [CachePadded<AtomicU64>; 14],
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(event: CacheEvent) -> usize {
        match event {
            CacheEvent::MemoryHit => 0,
            CacheEvent::FilesystemHit => 1,
            CacheEvent::BackendHit => 2,
            CacheEvent::StoreMiss => 3,
            CacheEvent::FreshHit => 4,
            CacheEvent::StaleServed => 5,
            CacheEvent::NotModified => 6,
            CacheEvent::NegativeServed => 7,
            CacheEvent::PurgeSucceeded => 8,
            CacheEvent::PurgeRetried => 9,
            CacheEvent::PurgeExhausted => 10,
            CacheEvent::UpstreamRetried => 11,
            CacheEvent::CircuitOpened => 12,
            CacheEvent::CircuitRejected => 13,
        }
    }

    pub fn count(&self, event: CacheEvent) -> u64 {
        self.counters[Self::slot(event)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.count(CacheEvent::MemoryHit),
            filesystem_hits: self.count(CacheEvent::FilesystemHit),
            backend_hits: self.count(CacheEvent::BackendHit),
            store_misses: self.count(CacheEvent::StoreMiss),
            fresh_hits: self.count(CacheEvent::FreshHit),
            stale_served: self.count(CacheEvent::StaleServed),
            not_modified: self.count(CacheEvent::NotModified),
            negative_served: self.count(CacheEvent::NegativeServed),
            purge_succeeded: self.count(CacheEvent::PurgeSucceeded),
            purge_retried: self.count(CacheEvent::PurgeRetried),
            purge_exhausted: self.count(CacheEvent::PurgeExhausted),
            upstream_retried: self.count(CacheEvent::UpstreamRetried),
            circuit_opened: self.count(CacheEvent::CircuitOpened),
            circuit_rejected: self.count(CacheEvent::CircuitRejected),
        }
    }
}

impl MetricsSink for AtomicMetrics {
    fn record(&self, event: CacheEvent) {
        self.counters[Self::slot(event)].fetch_add(1, Ordering::Relaxed);
    }
}

/// Monotonic time source for freshness bookkeeping
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Hand-advanced clock for deterministic freshness tests
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}
