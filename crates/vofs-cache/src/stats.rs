//! Lock-free activity counters for a [`Cache`](crate::Cache).
//!
//! ```
//! use vofs_cache::stats::CacheStats;
//!
//! let stats = CacheStats::new();
//! stats.record_open();
//! stats.record_backing_read();
//! stats.record_bytes_fetched(16384);
//!
//! let snap = stats.snapshot();
//! assert_eq!(snap.opens, 1);
//! assert_eq!(snap.bytes_fetched, 16384);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the cache, its handles and the flush workers.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Successful opens.
    pub opens: AtomicU64,
    /// Read tasks started against the backing store.
    pub backing_reads: AtomicU64,
    /// Bytes written into cache files by read tasks.
    pub bytes_fetched: AtomicU64,
    /// Flushes that uploaded successfully.
    pub flushes_completed: AtomicU64,
    /// Flushes that failed.
    pub flushes_failed: AtomicU64,
    /// Cache files removed by the eviction pass.
    pub evictions: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Successful opens.
    pub opens: u64,
    /// Read tasks started against the backing store.
    pub backing_reads: u64,
    /// Bytes written into cache files by read tasks.
    pub bytes_fetched: u64,
    /// Flushes that uploaded successfully.
    pub flushes_completed: u64,
    /// Flushes that failed.
    pub flushes_failed: u64,
    /// Cache files removed by the eviction pass.
    pub evictions: u64,
}

impl CacheStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open.
    #[inline]
    pub fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read task being started.
    #[inline]
    pub fn record_backing_read(&self) {
        self.backing_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes landing in a cache file.
    #[inline]
    pub fn record_bytes_fetched(&self, bytes: u64) {
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record the outcome of a flush.
    #[inline]
    pub fn record_flush(&self, success: bool) {
        if success {
            self.flushes_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.flushes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an evicted file.
    #[inline]
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            opens: self.opens.load(Ordering::Relaxed),
            backing_reads: self.backing_reads.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            flushes_completed: self.flushes_completed.load(Ordering::Relaxed),
            flushes_failed: self.flushes_failed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero.
    pub fn reset(&self) {
        self.opens.store(0, Ordering::Relaxed);
        self.backing_reads.store(0, Ordering::Relaxed);
        self.bytes_fetched.store(0, Ordering::Relaxed);
        self.flushes_completed.store(0, Ordering::Relaxed);
        self.flushes_failed.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}
