// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Engine-wide and per-handler-type counters.
//!
//! Thread-safe atomic counters in the style used for reliability-protocol
//! metrics elsewhere in this crate lineage: lock-free increments with
//! relaxed ordering, since consumers only need monotonic snapshots for
//! observability, never a total order across counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters for one message type's worker pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerMetricsSnapshot {
    pub active_workers: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub last_error_timestamp: Option<u64>,
}

/// Atomic counters backing [`HandlerMetricsSnapshot`] for one pool.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    last_error_timestamp: AtomicU64,
}

impl HandlerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_processed(&self) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failed(&self, now_ms: u64) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        self.last_error_timestamp.store(now_ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self, active_workers: usize) -> HandlerMetricsSnapshot {
        let last_error = self.last_error_timestamp.load(Ordering::Relaxed);
        HandlerMetricsSnapshot {
            active_workers,
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            last_error_timestamp: if last_error == 0 {
                None
            } else {
                Some(last_error)
            },
        }
    }
}

/// Engine-wide counters surfaced by the admin snapshot.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub enqueued: AtomicU64,
    pub acknowledged: AtomicU64,
    pub requeued: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub journal_errors: AtomicU64,
    pub snapshots_written: AtomicU64,
}

impl EngineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            journal_errors: self.journal_errors.load(Ordering::Relaxed),
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetricsSnapshot {
    pub enqueued: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub journal_errors: u64,
    pub snapshots_written: u64,
}
