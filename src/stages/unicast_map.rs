use std::sync::Arc;

use crate::capability::Stage;
use crate::driver::{AccessDescriptor, DriverBackend};
use crate::error::VmmError;
use crate::handle::PhysicalHandle;

/// Maps a physical handle into a single reserved virtual-address range and
/// grants one device access to it.
pub struct UnicastMapStage {
    driver: Arc<dyn DriverBackend>,
    virtual_address: u64,
    size: u64,
    access: AccessDescriptor,
}

impl UnicastMapStage {
    pub fn new(
        driver: Arc<dyn DriverBackend>,
        virtual_address: u64,
        size: u64,
        access: AccessDescriptor,
    ) -> Self {
        Self {
            driver,
            virtual_address,
            size,
            access,
        }
    }
}

impl Stage for UnicastMapStage {
    fn setup(&mut self, handle: PhysicalHandle) -> Result<(), VmmError> {
        self.driver.map(self.virtual_address, self.size, handle)?;
        if let Err(error) = self
            .driver
            .set_access(self.virtual_address, self.size, self.access)
        {
            // map succeeded but set_access didn't: undo the map before
            // propagating so this stage's own precondition (unmapped unless
            // fully set up) holds for whatever runs release() next.
            let _ = self.driver.unmap(self.virtual_address, self.size);
            return Err(error);
        }
        Ok(())
    }

    fn teardown(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
        self.driver.unmap(self.virtual_address, self.size)
    }

    fn name(&self) -> &'static str {
        "unicast_map"
    }
}
