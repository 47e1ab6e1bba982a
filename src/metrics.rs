use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Service counters. Handed around as an `Arc<Metrics>`; every component that
/// wants to count something gets the handle injected.
#[derive(Debug, Default)]
pub struct Metrics {
    clients_connected: AtomicI64,
    segments_created: AtomicU64,
    segments_deleted: AtomicU64,
    requests_served: AtomicU64,
    frames_dropped: AtomicU64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub clients_connected: i64,
    pub segments_created: u64,
    pub segments_deleted: u64,
    pub requests_served: u64,
    pub frames_dropped: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.clients_connected.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn segment_created(&self) {
        self.segments_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segment_deleted(&self) {
        self.segments_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            segments_created: self.segments_created.load(Ordering::Relaxed),
            segments_deleted: self.segments_deleted.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
