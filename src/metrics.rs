// src/metrics.rs
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Process-wide counters, updated lock-free from the loop and workers and
/// reported periodically by the server's reporter thread.
pub struct ServerMetrics {
    pub active_conns: AtomicUsize,
    pub total_requests: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
