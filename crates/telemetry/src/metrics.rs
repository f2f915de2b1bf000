//! In-process metrics for the session batch job.
//!
//! Counters are cumulative for the process lifetime. The scheduler logs a
//! snapshot after every pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &bound) in Self::BUCKET_BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Value exceeds all buckets, add to last
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the sessionizer.
#[derive(Debug, Default)]
pub struct Metrics {
    // Batch metrics
    pub projects_processed: Counter,
    pub projects_failed: Counter,
    pub users_processed: Counter,
    pub user_runs_failed: Counter,
    pub events_processed: Counter,

    // Session metrics
    pub sessions_created: Counter,
    pub sessions_continued: Counter,
    pub continuation_misses: Counter,
    pub channel_failures: Counter,

    // Property merge metrics
    pub user_properties_updated: Counter,
    pub merges_written: Counter,
    pub merges_skipped: Counter,

    // Latency histograms
    pub user_run_latency_ms: Histogram,
    pub project_run_latency_ms: Histogram,
    pub store_latency_ms: Histogram,

    // Gauges
    pub active_user_runs: Gauge,
    pub last_checkpoint: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub projects_processed: u64,
    pub projects_failed: u64,
    pub users_processed: u64,
    pub user_runs_failed: u64,
    pub events_processed: u64,
    pub sessions_created: u64,
    pub sessions_continued: u64,
    pub continuation_misses: u64,
    pub channel_failures: u64,
    pub user_properties_updated: u64,
    pub merges_written: u64,
    pub merges_skipped: u64,
    pub user_run_latency_mean_ms: f64,
    pub project_run_latency_mean_ms: f64,
    pub store_latency_mean_ms: f64,
    pub active_user_runs: u64,
    pub last_checkpoint: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            projects_processed: self.projects_processed.get(),
            projects_failed: self.projects_failed.get(),
            users_processed: self.users_processed.get(),
            user_runs_failed: self.user_runs_failed.get(),
            events_processed: self.events_processed.get(),
            sessions_created: self.sessions_created.get(),
            sessions_continued: self.sessions_continued.get(),
            continuation_misses: self.continuation_misses.get(),
            channel_failures: self.channel_failures.get(),
            user_properties_updated: self.user_properties_updated.get(),
            merges_written: self.merges_written.get(),
            merges_skipped: self.merges_skipped.get(),
            user_run_latency_mean_ms: self.user_run_latency_ms.mean(),
            project_run_latency_mean_ms: self.project_run_latency_ms.mean(),
            store_latency_mean_ms: self.store_latency_ms.mean(),
            active_user_runs: self.active_user_runs.get(),
            last_checkpoint: self.last_checkpoint.get(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
