use std::sync::atomic::{AtomicU64, Ordering};

use crate::driver::Location;

/// Process-wide running totals of bytes currently backed by materialized
/// allocations, split by location. Each bucket is an independent counter, so
/// no cross-bucket lock is needed.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    device_bytes: AtomicU64,
    pinned_host_bytes: AtomicU64,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_alloc(&self, location: Location, size: u64) {
        self.bucket(location).fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_free(&self, location: Location, size: u64) {
        self.bucket(location).fetch_sub(size, Ordering::Relaxed);
    }

    pub fn device_bytes(&self) -> u64 {
        self.device_bytes.load(Ordering::Relaxed)
    }

    pub fn pinned_host_bytes(&self) -> u64 {
        self.pinned_host_bytes.load(Ordering::Relaxed)
    }

    fn bucket(&self, location: Location) -> &AtomicU64 {
        match location {
            Location::Device(_) => &self.device_bytes,
            Location::PinnedHost => &self.pinned_host_bytes,
        }
    }
}
