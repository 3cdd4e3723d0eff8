//! Per-worker runtime counters
//!
//! The forwarding engine owns these numbers; the manager only reads them
//! for INFO output and tombstone purging, and resets them when a node row
//! is reused.

use dashmap::DashMap;
use tracing::debug;

/// Counters for the worker serving one node
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    /// Times the worker was chosen for a request
    pub elected: u64,
    /// Bytes read from the worker
    pub read: u64,
    /// Bytes sent to the worker
    pub transferred: u64,
    /// Connections currently in use
    pub busy: u64,
    pub lbfactor: i64,
    pub in_error: bool,
    pub hot_standby: bool,
}

/// Statistics for every worker, keyed by node id
#[derive(Debug, Default)]
pub struct StatsBlock {
    workers: DashMap<usize, WorkerStats>,
}

impl StatsBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request routed to the worker
    pub fn record_elected(&self, node: usize) {
        self.workers.entry(node).or_default().elected += 1;
    }

    pub fn record_read(&self, node: usize, bytes: u64) {
        self.workers.entry(node).or_default().read += bytes;
    }

    pub fn record_transferred(&self, node: usize, bytes: u64) {
        self.workers.entry(node).or_default().transferred += bytes;
    }

    pub fn set_busy(&self, node: usize, busy: u64) {
        self.workers.entry(node).or_default().busy = busy;
    }

    pub fn set_lbfactor(&self, node: usize, lbfactor: i64) {
        let mut worker = self.workers.entry(node).or_default();
        worker.lbfactor = lbfactor;
        worker.in_error = false;
        worker.hot_standby = false;
    }

    pub fn set_in_error(&self, node: usize) {
        self.workers.entry(node).or_default().in_error = true;
    }

    pub fn set_hot_standby(&self, node: usize) {
        let mut worker = self.workers.entry(node).or_default();
        worker.hot_standby = true;
        worker.in_error = false;
    }

    /// Copy of the worker's counters; zeroes for unknown workers
    pub fn get(&self, node: usize) -> WorkerStats {
        self.workers
            .get(&node)
            .map(|w| w.value().clone())
            .unwrap_or_default()
    }

    pub fn busy(&self, node: usize) -> u64 {
        self.workers.get(&node).map(|w| w.busy).unwrap_or(0)
    }

    /// Forget the worker, e.g. when its node row is freed or handed to a new node
    pub fn reset(&self, node: usize) {
        if self.workers.remove(&node).is_some() {
            debug!(node, "Worker statistics reset");
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
