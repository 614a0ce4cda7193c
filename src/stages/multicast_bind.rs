use std::sync::Arc;

use crate::capability::Stage;
use crate::driver::{DriverBackend, MulticastObject};
use crate::error::VmmError;
use crate::handle::PhysicalHandle;

/// Binds a physical handle into a device-group multicast object at a fixed
/// offset, for allocations shared across a set of peer devices.
pub struct MulticastBindStage {
    driver: Arc<dyn DriverBackend>,
    multicast_object: MulticastObject,
    bind_offset: u64,
    device: u32,
    size: u64,
}

impl MulticastBindStage {
    pub fn new(
        driver: Arc<dyn DriverBackend>,
        multicast_object: MulticastObject,
        bind_offset: u64,
        device: u32,
        size: u64,
    ) -> Self {
        Self {
            driver,
            multicast_object,
            bind_offset,
            device,
            size,
        }
    }
}

impl Stage for MulticastBindStage {
    fn setup(&mut self, handle: PhysicalHandle) -> Result<(), VmmError> {
        self.driver
            .multicast_bind(self.multicast_object, self.bind_offset, handle, 0, self.size)
    }

    fn teardown(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
        self.driver.multicast_unbind(
            self.multicast_object,
            self.device,
            self.bind_offset,
            self.size,
        )
    }

    fn name(&self) -> &'static str {
        "multicast_bind"
    }
}
