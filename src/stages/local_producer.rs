use std::sync::Arc;

use crate::capability::Producer;
use crate::counters::MemoryCounters;
use crate::driver::{AllocationProperties, DriverBackend};
use crate::error::VmmError;
use crate::handle::PhysicalHandle;

/// Produces a single physical allocation of a fixed size and location via a
/// `DriverBackend`, updating the process-wide memory counters on success.
pub struct LocalProducer {
    driver: Arc<dyn DriverBackend>,
    counters: Arc<MemoryCounters>,
    properties: AllocationProperties,
    size: u64,
    account: bool,
}

impl LocalProducer {
    pub fn new(
        driver: Arc<dyn DriverBackend>,
        counters: Arc<MemoryCounters>,
        properties: AllocationProperties,
        size: u64,
    ) -> Self {
        Self {
            driver,
            counters,
            properties,
            size,
            account: true,
        }
    }

    /// Skips the memory-counter update, for allocations tracked elsewhere.
    pub fn without_accounting(mut self) -> Self {
        self.account = false;
        self
    }
}

impl Producer for LocalProducer {
    fn produce(&mut self) -> Result<PhysicalHandle, VmmError> {
        let handle = self.driver.create_physical(self.properties, self.size)?;
        if self.account {
            self.counters
                .record_alloc(self.properties.location, self.size);
        }
        Ok(handle)
    }

    fn dispose(&mut self, handle: PhysicalHandle) -> Result<(), VmmError> {
        self.driver.release_physical(handle);
        if self.account {
            self.counters
                .record_free(self.properties.location, self.size);
        }
        Ok(())
    }
}
