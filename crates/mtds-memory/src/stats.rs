//! Allocator statistics and monitoring

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time view of an allocator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Upper bound on pool size
    pub capacity_bytes: usize,
    /// Bytes currently held by live memory objects
    pub leased_bytes: usize,
    /// Bytes parked in the idle list
    pub idle_bytes: usize,
    /// Number of parked buffers
    pub idle_buffers: usize,
    /// Fresh regions created
    pub allocations: u64,
    /// Leases served from the idle list
    pub reuses: u64,
    /// Leases refused for lack of room
    pub failures: u64,
    /// Regions handed back to the pool
    pub releases: u64,
    /// Time since the allocator was created
    pub uptime: Duration,
}

impl AllocatorStats {
    /// Fraction of the capacity in use, 0.0 - 1.0
    pub fn utilization(&self) -> f32 {
        if self.capacity_bytes == 0 {
            0.0
        } else {
            self.leased_bytes as f32 / self.capacity_bytes as f32
        }
    }

    /// Fraction of leases that avoided a fresh allocation
    pub fn reuse_ratio(&self) -> f32 {
        let total = self.allocations + self.reuses;
        if total == 0 {
            0.0
        } else {
            self.reuses as f32 / total as f32
        }
    }
}

/// Lock-free counters behind [`AllocatorStats`]
#[derive(Debug)]
pub struct AllocatorStatsTracker {
    allocations: AtomicU64,
    reuses: AtomicU64,
    failures: AtomicU64,
    releases: AtomicU64,
    start_time: Instant,
}

impl AllocatorStatsTracker {
    pub fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reuse(&self) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Combine counters with the pool's byte accounting
    pub fn snapshot(
        &self,
        capacity_bytes: usize,
        leased_bytes: usize,
        idle_bytes: usize,
        idle_buffers: usize,
    ) -> AllocatorStats {
        AllocatorStats {
            capacity_bytes,
            leased_bytes,
            idle_bytes,
            idle_buffers,
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            uptime: self.start_time.elapsed(),
        }
    }
}

impl Default for AllocatorStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}
