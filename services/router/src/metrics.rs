//! Process-wide transfer counters.
//!
//! Every session and pending-request transition bumps one of these;
//! scraping/exporting is an external concern.  `snapshot` exists for
//! tests and for the shutdown log line.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub sync_requests: AtomicU64,
    pub stream_requests: AtomicU64,
    pub offload_requests: AtomicU64,
    pub requests_fulfilled: AtomicU64,
    pub requests_failed: AtomicU64,
    pub requests_timed_out: AtomicU64,
    pub requests_cancelled: AtomicU64,
    /// Pattern A payload bytes accepted.
    pub buffered_bytes_total: AtomicU64,
    /// Pattern B payload bytes relayed chunk by chunk.
    pub streamed_bytes_total: AtomicU64,
    pub chunks_relayed: AtomicU64,
    pub active_sessions: AtomicI64,
    pub active_streams: AtomicI64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sync_requests: u64,
    pub stream_requests: u64,
    pub offload_requests: u64,
    pub requests_fulfilled: u64,
    pub requests_failed: u64,
    pub requests_timed_out: u64,
    pub requests_cancelled: u64,
    pub buffered_bytes_total: u64,
    pub streamed_bytes_total: u64,
    pub chunks_relayed: u64,
    pub active_sessions: i64,
    pub active_streams: i64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sync_requests: self.sync_requests.load(Ordering::Relaxed),
            stream_requests: self.stream_requests.load(Ordering::Relaxed),
            offload_requests: self.offload_requests.load(Ordering::Relaxed),
            requests_fulfilled: self.requests_fulfilled.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            buffered_bytes_total: self.buffered_bytes_total.load(Ordering::Relaxed),
            streamed_bytes_total: self.streamed_bytes_total.load(Ordering::Relaxed),
            chunks_relayed: self.chunks_relayed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn gauge_add(gauge: &AtomicI64, delta: i64) {
        gauge.fetch_add(delta, Ordering::Relaxed);
    }
}
