// src/metrics.rs
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide counters. The live-connection count lives here and is only
/// touched through these methods; the reactor and workers share one instance.
#[derive(Default)]
pub struct ServerMetrics {
    active_conns: AtomicI64,
    total_requests: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn active_conns(&self) -> i64 {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}
