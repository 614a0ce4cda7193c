use crate::error::VmmError;
use crate::handle::PhysicalHandle;

/// Where a physical allocation should reside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Device(u32),
    PinnedHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationProperties {
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessDescriptor {
    pub device: u32,
    pub read_write: bool,
}

/// Opaque handle to a driver-level multicast (device-group) object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulticastObject(pub u64);

/// Opaque ordering token for asynchronous driver work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream(pub u64);

/// Opaque handle used to order a host wait against prior stream work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceEvent(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostBufferKind {
    Host,
    HostPinned,
}

/// Opaque handle to a host-resident staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostBuffer(pub u64);

/// Groups the driver-level primitives the allocation pipeline needs, so
/// producers and stages are generic over which concrete GPU API backs them.
///
/// Every method here is synchronous from the caller's perspective: calls that
/// enqueue device-side work (the `*_async` ones, plus `map`/`unmap`) may
/// return before that work has completed, but the call itself does not block
/// beyond submitting it. Ordering between such calls on the same `Stream` is
/// the backend's responsibility; ordering relative to a different stream
/// requires `event_record`/`event_synchronize`.
pub trait DriverBackend: Send + Sync {
    fn reserve_virtual_address(&self, size: u64, alignment: u64) -> Result<u64, VmmError>;
    fn release_virtual_address(&self, address: u64, size: u64);

    fn create_physical(
        &self,
        properties: AllocationProperties,
        size: u64,
    ) -> Result<PhysicalHandle, VmmError>;
    fn release_physical(&self, handle: PhysicalHandle);

    fn map(&self, address: u64, size: u64, handle: PhysicalHandle) -> Result<(), VmmError>;
    fn unmap(&self, address: u64, size: u64) -> Result<(), VmmError>;
    fn set_access(
        &self,
        address: u64,
        size: u64,
        descriptor: AccessDescriptor,
    ) -> Result<(), VmmError>;

    fn multicast_bind(
        &self,
        mc: MulticastObject,
        mc_offset: u64,
        handle: PhysicalHandle,
        mem_offset: u64,
        size: u64,
    ) -> Result<(), VmmError>;
    fn multicast_unbind(
        &self,
        mc: MulticastObject,
        device: u32,
        offset: u64,
        size: u64,
    ) -> Result<(), VmmError>;

    fn memset_async(
        &self,
        address: u64,
        size: u64,
        value: u8,
        stream: Stream,
    ) -> Result<(), VmmError>;
    fn memcpy_device_to_host(
        &self,
        dst: HostBuffer,
        src_address: u64,
        size: u64,
        stream: Stream,
    ) -> Result<(), VmmError>;
    fn memcpy_host_to_device(
        &self,
        dst_address: u64,
        src: HostBuffer,
        size: u64,
        stream: Stream,
    ) -> Result<(), VmmError>;

    fn new_event(&self) -> DeviceEvent;
    fn event_record(&self, event: DeviceEvent, stream: Stream) -> Result<(), VmmError>;
    fn event_synchronize(&self, event: DeviceEvent) -> Result<(), VmmError>;

    fn allocate_host(&self, size: u64, kind: HostBufferKind) -> Result<HostBuffer, VmmError>;
    fn free_host(&self, buffer: HostBuffer);

    fn granularity_of(&self, properties: AllocationProperties) -> u64;
    fn page_size(&self) -> u64;
}
