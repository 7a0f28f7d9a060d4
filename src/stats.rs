//! Install and fetch statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Result of a completed install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStats {
    /// Name of the populated cache.
    pub cache_name: String,
    /// Number of assets stored.
    pub assets: usize,
    /// Sum of stored body sizes in bytes.
    pub total_bytes: u64,
    /// Wall time from cache open to commit.
    pub elapsed: Duration,
}

/// Where fetch events were answered from.
#[derive(Debug, Default)]
pub struct FetchStats {
    network: AtomicU64,
    cache: AtomicU64,
    unresolved: AtomicU64,
    passthrough: AtomicU64,
}

/// Point-in-time copy of [`FetchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchCounts {
    /// Intercepted requests answered by the network.
    pub network: u64,
    /// Intercepted requests answered from a cache after a network failure.
    pub cache: u64,
    /// Intercepted requests that got neither.
    pub unresolved: u64,
    /// Requests not intercepted (outside scope, or worker not installed).
    pub passthrough: u64,
}

impl FetchCounts {
    /// Total number of intercepted requests.
    #[must_use]
    pub const fn intercepted(&self) -> u64 {
        self.network + self.cache + self.unresolved
    }
}

impl FetchStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_network(&self) {
        self.network.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache(&self) {
        self.cache.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unresolved(&self) {
        self.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_passthrough(&self) {
        self.passthrough.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters.
    #[must_use]
    pub fn snapshot(&self) -> FetchCounts {
        FetchCounts {
            network: self.network.load(Ordering::Relaxed),
            cache: self.cache.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
        }
    }
}
