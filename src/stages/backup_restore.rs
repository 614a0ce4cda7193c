use std::sync::Arc;

use crate::capability::Stage;
use crate::driver::{DeviceEvent, DriverBackend, HostBuffer, HostBufferKind, Stream};
use crate::error::VmmError;
use crate::handle::PhysicalHandle;

/// Copies an allocation's contents out to a host-resident buffer on
/// teardown and back in on setup, so the contents survive a release/
/// materialize cycle even though the physical memory backing them does not.
///
/// The two directions are intentionally asymmetric: `teardown` (save) waits
/// for the copy to land on the host before returning, since the physical
/// memory it read from is about to be unmapped and disposed of. `setup`
/// (restore) only orders the copy against the caller's stream — the
/// allocation's contents aren't observable until whatever the caller does
/// next also runs on that stream, so there's nothing to wait for yet.
pub struct BackupRestoreStage {
    driver: Arc<dyn DriverBackend>,
    virtual_address: u64,
    size: u64,
    kind: HostBufferKind,
    stream: Stream,
    on_demand: bool,
    backing: Option<HostBuffer>,
    event: DeviceEvent,
}

impl BackupRestoreStage {
    pub fn new(
        driver: Arc<dyn DriverBackend>,
        virtual_address: u64,
        size: u64,
        kind: HostBufferKind,
        stream: Stream,
        on_demand: bool,
    ) -> Self {
        let event = driver.new_event();
        Self {
            driver,
            virtual_address,
            size,
            kind,
            stream,
            on_demand,
            backing: None,
            event,
        }
    }
}

impl Stage for BackupRestoreStage {
    fn setup(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
        let backing = match self.backing {
            Some(backing) => backing,
            // nothing was ever saved (first materialize): nothing to restore.
            None => return Ok(()),
        };
        self.driver
            .memcpy_host_to_device(self.virtual_address, backing, self.size, self.stream)?;
        self.driver.event_record(self.event, self.stream)?;
        if self.on_demand {
            self.driver.free_host(backing);
            self.backing = None;
        }
        Ok(())
    }

    fn teardown(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
        let backing = match self.backing {
            Some(backing) => backing,
            None => {
                let backing = self.driver.allocate_host(self.size, self.kind)?;
                self.backing = Some(backing);
                backing
            }
        };
        self.driver
            .memcpy_device_to_host(backing, self.virtual_address, self.size, self.stream)?;
        self.driver.event_record(self.event, self.stream)?;
        self.driver.event_synchronize(self.event)
    }

    fn name(&self) -> &'static str {
        "backup_restore"
    }
}

impl Drop for BackupRestoreStage {
    fn drop(&mut self) {
        if let Some(backing) = self.backing.take() {
            self.driver.free_host(backing);
        }
    }
}
