//! Metrics for the receive pipeline
//!
//! Thread-safe atomic counters: totals for received/delivered traffic
//! and one counter per drop reason, so every silent drop is visible
//! somewhere. Cloning a [`DecapMetrics`] shares the underlying
//! counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::DropKind;

#[derive(Debug, Default)]
struct Inner {
    received: AtomicU64,
    delivered: AtomicU64,
    delivered_bytes: AtomicU64,
    suspended: AtomicU64,
    shed: AtomicU64,
    drops: [AtomicU64; DropKind::ALL.len()],
}

/// Shared pipeline counters
#[derive(Debug, Clone, Default)]
pub struct DecapMetrics {
    inner: Arc<Inner>,
}

impl DecapMetrics {
    /// Create a fresh set of counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a packet entering the pipeline
    pub fn record_received(&self) {
        self.inner.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a packet handed to IP input
    pub fn record_delivered(&self, bytes: usize) {
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        self.inner
            .delivered_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count a suspension for asynchronous work
    pub fn record_suspended(&self) {
        self.inner.suspended.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a packet shed by the in-flight cap
    pub fn record_shed(&self) {
        self.inner.shed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a drop by reason
    pub fn record_drop(&self, kind: DropKind) {
        self.inner.drops[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    /// Read one drop counter
    pub fn drop_count(&self, kind: DropKind) -> u64 {
        self.inner.drops[kind_index(kind)].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut drops = Vec::with_capacity(DropKind::ALL.len());
        let mut dropped_total = 0;
        for kind in DropKind::ALL {
            let n = self.drop_count(kind);
            dropped_total += n;
            drops.push((kind, n));
        }
        MetricsSnapshot {
            received: self.inner.received.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            delivered_bytes: self.inner.delivered_bytes.load(Ordering::Relaxed),
            suspended: self.inner.suspended.load(Ordering::Relaxed),
            shed: self.inner.shed.load(Ordering::Relaxed),
            dropped_total,
            drops,
        }
    }
}

fn kind_index(kind: DropKind) -> usize {
    DropKind::ALL
        .iter()
        .position(|k| *k == kind)
        .expect("DropKind::ALL covers every kind")
}

/// Plain-data snapshot of [`DecapMetrics`]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Packets entering the pipeline
    pub received: u64,
    /// Packets handed to IP input
    pub delivered: u64,
    /// Bytes handed to IP input
    pub delivered_bytes: u64,
    /// Suspensions for asynchronous work
    pub suspended: u64,
    /// Packets shed by the in-flight cap
    pub shed: u64,
    /// Sum of all drop counters
    pub dropped_total: u64,
    /// Per-reason drop counts
    pub drops: Vec<(DropKind, u64)>,
}
