//! Topology version clock
//!
//! Writers bump the clock whenever the node, host or context tables change.
//! Readers keep their own [`VersionTracker`] and rebuild derived routing
//! state when the clock has moved since they last looked.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared monotonically increasing counter
#[derive(Debug, Default)]
pub struct VersionClock {
    value: AtomicU64,
}

/// On-disk form of the clock
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredVersion {
    pub version: u64,
}

impl VersionClock {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Only reachable through a node scope, so bumps are serialized by the node lock
    pub(crate) fn bump(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn restore(&self, version: u64) {
        self.value.store(version, Ordering::Release);
    }
}

/// Last version a reader has acted on
#[derive(Debug, Default, Clone, Copy)]
pub struct VersionTracker {
    last_seen: u64,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version to rebuild for, or `None` when nothing changed
    pub fn need_update(&self, clock: &VersionClock) -> Option<u64> {
        let current = clock.current();
        (current != self.last_seen).then_some(current)
    }

    pub fn mark_updated(&mut self, version: u64) {
        self.last_seen = version;
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }
}
