//! Reversible virtual-memory manager for GPU allocations.
//!
//! Virtual-address reservation is decoupled from physical backing: an
//! allocation can be released (backing freed, address kept) and later
//! re-materialized (backing re-acquired, contents restored per its
//! configured policy) without the caller ever seeing the address change.
//! See `ManagedAllocation` for the per-allocation state machine and
//! `CohortManager` for grouping allocations under a shared tag so a whole
//! group can be released or materialized as one operation.

pub mod adapter;
pub mod allocation;
pub mod backends;
pub mod capability;
pub mod cohort;
pub mod counters;
pub mod driver;
pub mod error;
pub mod handle;
pub mod stages;

mod memory;

pub use adapter::{AdapterConfiguration, AllocatorAdapter, BackupMode};
pub use allocation::{ManagedAllocation, Status};
pub use capability::{Producer, Stage};
pub use cohort::CohortManager;
pub use counters::MemoryCounters;
pub use driver::{
    AccessDescriptor, AllocationProperties, DeviceEvent, DriverBackend, HostBuffer,
    HostBufferKind, Location, MulticastObject, Stream,
};
pub use error::VmmError;
pub use handle::PhysicalHandle;
