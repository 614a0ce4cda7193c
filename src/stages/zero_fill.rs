use std::sync::Arc;

use crate::capability::Stage;
use crate::driver::{DriverBackend, Stream};
use crate::error::VmmError;
use crate::handle::PhysicalHandle;

/// Fills a virtual-address range with a constant byte on every materialize
/// except the first, on the assumption that freshly produced physical memory
/// already reads as zero (or whatever the driver guarantees for new
/// allocations) and doesn't need to be re-stamped before it's ever been
/// written to.
pub struct ZeroFillStage {
    driver: Arc<dyn DriverBackend>,
    virtual_address: u64,
    size: u64,
    value: u8,
    stream: Stream,
    first_time: bool,
}

impl ZeroFillStage {
    pub fn new(
        driver: Arc<dyn DriverBackend>,
        virtual_address: u64,
        size: u64,
        value: u8,
        stream: Stream,
    ) -> Self {
        Self {
            driver,
            virtual_address,
            size,
            value,
            stream,
            first_time: true,
        }
    }
}

impl Stage for ZeroFillStage {
    fn setup(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
        if self.first_time {
            return Ok(());
        }
        self.driver
            .memset_async(self.virtual_address, self.size, self.value, self.stream)
    }

    fn teardown(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
        self.first_time = false;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "zero_fill"
    }
}
