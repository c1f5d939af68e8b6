//! Lightweight write-path metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can move both ways.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Create a gauge at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current value.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics of one merge-tree writer.
#[derive(Debug, Default)]
pub struct WriterMetrics {
    /// Records accepted by `write`.
    pub records_written: Counter,
    /// Buffer flushes that produced at least one file.
    pub flushes: Counter,
    /// Data files produced by flushes.
    pub files_flushed: Counter,
    /// Bytes in data files produced by flushes.
    pub bytes_flushed: Counter,
    /// Compaction results applied.
    pub compactions_applied: Counter,
    /// Compaction failures observed.
    pub compactions_failed: Counter,
    /// Current number of level-0 runs.
    pub level0_runs: Gauge,
}

impl WriterMetrics {
    /// Create fresh metrics behind a shared handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Point-in-time snapshot of all values.
    pub fn snapshot(&self) -> WriterMetricsSnapshot {
        WriterMetricsSnapshot {
            records_written: self.records_written.get(),
            flushes: self.flushes.get(),
            files_flushed: self.files_flushed.get(),
            bytes_flushed: self.bytes_flushed.get(),
            compactions_applied: self.compactions_applied.get(),
            compactions_failed: self.compactions_failed.get(),
            level0_runs: self.level0_runs.get(),
        }
    }
}

/// Frozen view of [`WriterMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterMetricsSnapshot {
    pub records_written: u64,
    pub flushes: u64,
    pub files_flushed: u64,
    pub bytes_flushed: u64,
    pub compactions_applied: u64,
    pub compactions_failed: u64,
    pub level0_runs: u64,
}
