use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::driver::{
    AccessDescriptor, AllocationProperties, DeviceEvent, DriverBackend, HostBuffer,
    HostBufferKind, MulticastObject, Stream,
};
use crate::error::VmmError;
use crate::handle::PhysicalHandle;

const BASE_VIRTUAL_ADDRESS: u64 = 0x7f00_0000_0000;
const DEFAULT_ALIGNMENT: u64 = 4096;

/// Schedules `error` to be returned the `at_call`-th time `op` is invoked on a
/// `FakeBackend`, counting from 1. Used to drive deterministic rollback
/// scenarios in tests without touching real hardware.
#[derive(Debug, Clone)]
pub struct FaultSpec {
    pub op: &'static str,
    pub at_call: u32,
    pub error: VmmError,
}

impl FaultSpec {
    pub fn new(op: &'static str, at_call: u32, error: VmmError) -> Self {
        Self { op, at_call, error }
    }
}

struct Mapping {
    handle_raw: u64,
    size: u64,
}

#[derive(Default)]
struct State {
    next_vaddr: u64,
    next_handle: u64,
    next_host_buffer: u64,
    next_event: u64,
    physical: HashMap<u64, Vec<u8>>,
    mappings: BTreeMap<u64, Mapping>,
    host_buffers: HashMap<u64, Vec<u8>>,
    events: HashMap<u64, bool>,
    call_counts: HashMap<&'static str, u32>,
    faults: Vec<FaultSpec>,
}

/// In-memory `DriverBackend` with no real GPU dependency.
///
/// Virtual addresses, physical handles, host buffers, and events are all
/// modeled with plain collections behind one mutex. "Async" operations run
/// eagerly — there's no real device scheduling to model — which is why
/// `event_synchronize` only `debug_assert!`s that its event was recorded
/// rather than actually waiting on anything.
pub struct FakeBackend {
    state: Mutex<State>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                next_vaddr: BASE_VIRTUAL_ADDRESS,
                next_handle: 1,
                next_host_buffer: 1,
                next_event: 1,
                ..Default::default()
            }),
        }
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_fault(&self, spec: FaultSpec) {
        self.state.lock().unwrap().faults.push(spec);
    }

    fn maybe_fail(state: &mut State, op: &'static str) -> Result<(), VmmError> {
        let count = state.call_counts.entry(op).or_insert(0);
        *count += 1;
        let count = *count;
        if let Some(pos) = state.faults.iter().position(|f| f.op == op && f.at_call == count) {
            return Err(state.faults.remove(pos).error);
        }
        Ok(())
    }

    fn resolve(state: &State, address: u64, len: u64) -> (u64, u64) {
        let (&base, mapping) = state
            .mappings
            .range(..=address)
            .next_back()
            .expect("address not mapped");
        assert!(
            address + len <= base + mapping.size,
            "access out of mapped range"
        );
        (mapping.handle_raw, address - base)
    }

    /// Writes `data` through the fake pointer `address`, panicking if the
    /// range isn't currently mapped — a test-only convenience so scenarios
    /// can assert on an allocation's contents the way they'd dereference a
    /// real pointer.
    pub fn write(&self, address: u64, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let (handle_raw, offset) = Self::resolve(&state, address, data.len() as u64);
        let buffer = state.physical.get_mut(&handle_raw).expect("handle vanished");
        buffer[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, address: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let (handle_raw, offset) = Self::resolve(&state, address, len as u64);
        let buffer = state.physical.get(&handle_raw).expect("handle vanished");
        buffer[offset as usize..offset as usize + len].to_vec()
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    let misalignment = value % alignment;
    if misalignment == 0 {
        value
    } else {
        value + (alignment - misalignment)
    }
}

impl DriverBackend for FakeBackend {
    fn reserve_virtual_address(&self, size: u64, alignment: u64) -> Result<u64, VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "reserve_virtual_address")?;
        let aligned = align_up(state.next_vaddr, alignment.max(1));
        state.next_vaddr = aligned + size;
        Ok(aligned)
    }

    fn release_virtual_address(&self, _address: u64, _size: u64) {}

    fn create_physical(
        &self,
        properties: AllocationProperties,
        size: u64,
    ) -> Result<PhysicalHandle, VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "create_physical")?;
        let _ = properties;
        let raw = state.next_handle;
        state.next_handle += 1;
        state.physical.insert(raw, vec![0u8; size as usize]);
        Ok(PhysicalHandle::new(raw))
    }

    fn release_physical(&self, handle: PhysicalHandle) {
        self.state.lock().unwrap().physical.remove(&handle.raw());
    }

    fn map(&self, address: u64, size: u64, handle: PhysicalHandle) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "map")?;
        state
            .mappings
            .insert(address, Mapping { handle_raw: handle.raw(), size });
        Ok(())
    }

    fn unmap(&self, address: u64, size: u64) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "unmap")?;
        let _ = size;
        state.mappings.remove(&address);
        Ok(())
    }

    fn set_access(
        &self,
        _address: u64,
        _size: u64,
        _descriptor: AccessDescriptor,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "set_access")
    }

    fn multicast_bind(
        &self,
        _mc: MulticastObject,
        _mc_offset: u64,
        _handle: PhysicalHandle,
        _mem_offset: u64,
        _size: u64,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "multicast_bind")
    }

    fn multicast_unbind(
        &self,
        _mc: MulticastObject,
        _device: u32,
        _offset: u64,
        _size: u64,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "multicast_unbind")
    }

    fn memset_async(
        &self,
        address: u64,
        size: u64,
        value: u8,
        _stream: Stream,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "memset_async")?;
        let (handle_raw, offset) = Self::resolve(&state, address, size);
        let buffer = state.physical.get_mut(&handle_raw).expect("handle vanished");
        buffer[offset as usize..offset as usize + size as usize].fill(value);
        Ok(())
    }

    fn memcpy_device_to_host(
        &self,
        dst: HostBuffer,
        src_address: u64,
        size: u64,
        _stream: Stream,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "memcpy_device_to_host")?;
        let (handle_raw, offset) = Self::resolve(&state, src_address, size);
        let data = {
            let buffer = state.physical.get(&handle_raw).expect("handle vanished");
            buffer[offset as usize..offset as usize + size as usize].to_vec()
        };
        state.host_buffers.insert(dst.0, data);
        Ok(())
    }

    fn memcpy_host_to_device(
        &self,
        dst_address: u64,
        src: HostBuffer,
        size: u64,
        _stream: Stream,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "memcpy_host_to_device")?;
        let data = state
            .host_buffers
            .get(&src.0)
            .expect("host buffer vanished")
            .clone();
        let (handle_raw, offset) = Self::resolve(&state, dst_address, size);
        let buffer = state.physical.get_mut(&handle_raw).expect("handle vanished");
        buffer[offset as usize..offset as usize + size as usize].copy_from_slice(&data);
        Ok(())
    }

    fn new_event(&self) -> DeviceEvent {
        let mut state = self.state.lock().unwrap();
        let id = state.next_event;
        state.next_event += 1;
        DeviceEvent(id)
    }

    fn event_record(&self, event: DeviceEvent, _stream: Stream) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "event_record")?;
        state.events.insert(event.0, true);
        Ok(())
    }

    fn event_synchronize(&self, event: DeviceEvent) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "event_synchronize")?;
        debug_assert!(
            state.events.get(&event.0).copied().unwrap_or(false),
            "synchronized on an event that was never recorded"
        );
        Ok(())
    }

    fn allocate_host(&self, size: u64, _kind: HostBufferKind) -> Result<HostBuffer, VmmError> {
        let mut state = self.state.lock().unwrap();
        Self::maybe_fail(&mut state, "allocate_host")?;
        let id = state.next_host_buffer;
        state.next_host_buffer += 1;
        state.host_buffers.insert(id, vec![0u8; size as usize]);
        Ok(HostBuffer(id))
    }

    fn free_host(&self, buffer: HostBuffer) {
        self.state.lock().unwrap().host_buffers.remove(&buffer.0);
    }

    fn granularity_of(&self, _properties: AllocationProperties) -> u64 {
        DEFAULT_ALIGNMENT
    }

    fn page_size(&self) -> u64 {
        DEFAULT_ALIGNMENT
    }
}
