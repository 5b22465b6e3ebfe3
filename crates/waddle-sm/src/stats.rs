//! In-process statistics.
//!
//! Plain atomics the embedding server can read without an exporter.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct SessionManagerStats {
    packets: AtomicU64,
    auth_timeouts: AtomicU64,
    closed_connections: AtomicU64,
    stale_removed: AtomicU64,
    errors_synthesized: AtomicU64,
}

impl SessionManagerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_packets(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_auth_timeouts(&self) {
        self.auth_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_closed_connections(&self) {
        self.closed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stale_removed(&self, count: u64) {
        self.stale_removed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn inc_errors_synthesized(&self) {
        self.errors_synthesized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn auth_timeouts(&self) -> u64 {
        self.auth_timeouts.load(Ordering::Relaxed)
    }

    pub fn closed_connections(&self) -> u64 {
        self.closed_connections.load(Ordering::Relaxed)
    }

    pub fn stale_removed(&self) -> u64 {
        self.stale_removed.load(Ordering::Relaxed)
    }

    pub fn errors_synthesized(&self) -> u64 {
        self.errors_synthesized.load(Ordering::Relaxed)
    }
}

/// Queue statistics of one worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub queues: usize,
    pub queue_depth: usize,
    /// Items currently waiting
    pub queued: usize,
    /// Items executed so far
    pub processed: u64,
    /// Items refused because the queue was full
    pub dropped: u64,
}

/// Point-in-time view of the session manager.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub packets: u64,
    pub auth_timeouts: u64,
    pub closed_connections: u64,
    pub stale_removed: u64,
    pub errors_synthesized: u64,
    pub open_sessions: usize,
    pub open_connections: usize,
    pub max_sessions: usize,
    pub max_connections: usize,
    pub total_connections: usize,
    pub pools: Vec<PoolStats>,
}
