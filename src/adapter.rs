use std::sync::{Arc, Mutex, OnceLock};

use crate::cohort::CohortManager;
use crate::counters::MemoryCounters;
use crate::driver::{AccessDescriptor, AllocationProperties, DriverBackend, HostBufferKind, Location, Stream};
use crate::error::VmmError;
use crate::stages::{BackupRestoreStage, LocalProducer, UnicastMapStage, ZeroFillStage};

/// What, if anything, an allocation does to preserve its contents across a
/// release/materialize cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Contents are not preserved; a fresh allocation is assumed clean.
    None,
    /// Re-zero the allocation on every materialize after the first.
    Memset,
    /// Copy contents out to ordinary host memory and back.
    Host,
    /// Copy contents out to pinned host memory, freed as soon as restored.
    HostPinned,
}

/// One entry on the process-wide adapter stack: which cohort manager,
/// backup policy, and stream a tensor library's allocator calls should
/// currently use.
#[derive(Clone)]
pub struct AdapterConfiguration {
    pub manager: Arc<CohortManager>,
    pub tag: String,
    pub backup_mode: BackupMode,
    pub backup_stream: Stream,
    pub page_size: u64,
}

impl AdapterConfiguration {
    pub fn new(
        manager: Arc<CohortManager>,
        tag: impl Into<String>,
        backup_mode: BackupMode,
        backup_stream: Stream,
        page_size: u64,
    ) -> Self {
        Self {
            manager,
            tag: tag.into(),
            backup_mode,
            backup_stream,
            page_size,
        }
    }
}

static ADAPTER_STACK: OnceLock<Mutex<Vec<AdapterConfiguration>>> = OnceLock::new();

fn stack() -> &'static Mutex<Vec<AdapterConfiguration>> {
    ADAPTER_STACK.get_or_init(|| Mutex::new(Vec::new()))
}

/// Pushes `config` onto the process-wide adapter stack, making it the
/// configuration `AllocatorAdapter` and the free-function `deallocate` see
/// until a matching `pop_adapter`.
pub fn push_adapter(config: AdapterConfiguration) {
    stack().lock().unwrap().push(config);
}

/// Pops the most recently pushed configuration. Errors if the stack is
/// already empty — every push must have a matching pop.
pub fn pop_adapter() -> Result<AdapterConfiguration, VmmError> {
    stack().lock().unwrap().pop().ok_or(VmmError::UnknownAdapterPop)
}

/// Reads, without popping, the configuration currently in effect.
pub fn current_adapter() -> Result<AdapterConfiguration, VmmError> {
    stack()
        .lock()
        .unwrap()
        .last()
        .cloned()
        .ok_or(VmmError::EmptyAdapterStack)
}

/// The tensor-library-facing allocation surface: builds and registers a
/// `ManagedAllocation` from whatever configuration is currently pushed, and
/// hands back a plain virtual address.
pub struct AllocatorAdapter {
    driver: Arc<dyn DriverBackend>,
    counters: Arc<MemoryCounters>,
}

impl AllocatorAdapter {
    pub fn new(driver: Arc<dyn DriverBackend>, counters: Arc<MemoryCounters>) -> Self {
        Self { driver, counters }
    }

    /// Reserves a virtual-address range, materializes physical backing for
    /// it with a pipeline built from the current adapter configuration, and
    /// returns the address. On any failure the reservation is released and
    /// nothing is left registered.
    pub fn allocate(&self, bytes: u64, device: u32) -> Result<u64, VmmError> {
        if bytes == 0 {
            return Err(VmmError::ZeroSizeAllocation);
        }
        let config = current_adapter()?;
        let properties = AllocationProperties { location: Location::Device(device) };
        let granularity = self.driver.granularity_of(properties);
        let alignment = granularity.max(config.page_size);
        let rounded = round_up(bytes, alignment);

        let address = self.driver.reserve_virtual_address(rounded, alignment)?;

        let producer = Box::new(LocalProducer::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.counters),
            properties,
            rounded,
        ));

        let access = AccessDescriptor { device, read_write: true };
        let mut stages: Vec<Box<dyn crate::capability::Stage>> = vec![Box::new(
            UnicastMapStage::new(Arc::clone(&self.driver), address, rounded, access),
        )];

        match config.backup_mode {
            BackupMode::None => {}
            BackupMode::Memset => {
                stages.push(Box::new(ZeroFillStage::new(
                    Arc::clone(&self.driver),
                    address,
                    rounded,
                    0,
                    config.backup_stream,
                )));
            }
            BackupMode::Host => {
                stages.push(Box::new(BackupRestoreStage::new(
                    Arc::clone(&self.driver),
                    address,
                    rounded,
                    HostBufferKind::Host,
                    config.backup_stream,
                    false,
                )));
            }
            BackupMode::HostPinned => {
                stages.push(Box::new(BackupRestoreStage::new(
                    Arc::clone(&self.driver),
                    address,
                    rounded,
                    HostBufferKind::HostPinned,
                    config.backup_stream,
                    true,
                )));
            }
        }

        if let Err(error) = config
            .manager
            .add_and_materialize(address, config.tag.clone(), producer, stages)
        {
            self.driver.release_virtual_address(address, rounded);
            return Err(error);
        }

        Ok(address)
    }

    /// Releases and unregisters the allocation at `ptr`, reading the manager
    /// to use from the current adapter configuration.
    pub fn deallocate(&self, ptr: u64, _bytes: u64) -> Result<(), VmmError> {
        let config = current_adapter()?;
        drop(config.manager.remove(ptr));
        Ok(())
    }
}

/// Free-function escape hatch for callers (e.g. a tensor library's custom
/// allocator callback) that don't hold onto an `AllocatorAdapter` value and
/// instead rely entirely on the process-wide adapter stack.
pub fn deallocate(ptr: u64, _bytes: u64) -> Result<(), VmmError> {
    let config = current_adapter()?;
    drop(config.manager.remove(ptr));
    Ok(())
}

fn round_up(value: u64, alignment: u64) -> u64 {
    let misalignment = value % alignment;
    if misalignment == 0 {
        value
    } else {
        value + (alignment - misalignment)
    }
}
