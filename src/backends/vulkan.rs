//! A `DriverBackend` over Vulkan.
//!
//! Vulkan has no exact analogue of the CUDA virtual-memory-management API
//! this crate's capability surface is modeled on, so a few liberties are
//! taken, each noted where it matters:
//!
//! - A "virtual address" is a sparse-binding-capable `vk::Buffer`, created
//!   once by `reserve_virtual_address` and rebound to different
//!   `vk::DeviceMemory` objects by `map`/`unmap` via `vkQueueBindSparse`.
//!   This is what `VK_KHR_sparse_binding` is for: a stable resource whose
//!   backing memory can change without recreating the resource.
//! - `set_access` has no Vulkan counterpart (descriptor/queue-family
//!   ownership governs access instead) and is a no-op.
//! - `multicast_bind`/`multicast_unbind` require `VK_KHR_device_group` peer
//!   memory and aren't wired up here; they report `VmmError::Unsupported`.
//! - Every `Stream` token maps to the same internal queue — this backend
//!   does not model multiple independent hardware queues. Each "async" call
//!   allocates a one-shot command buffer, submits it, and waits on a fence
//!   before returning, so it is in fact synchronous; genuinely overlapping
//!   GPU work would need the caller's own command buffer and queue instead.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use ash::version::DeviceV1_0;
use ash::{vk, Device};

use crate::driver::{
    AccessDescriptor, AllocationProperties, DeviceEvent, DriverBackend, HostBuffer,
    HostBufferKind, Location, MulticastObject, Stream,
};
use crate::error::VmmError;
use crate::handle::PhysicalHandle;
use crate::memory::{find_memory_type, DedicatedMapping};

const BASE_ADDRESS: u64 = 0x1_0000_0000;

struct Reservation {
    buffer: vk::Buffer,
    size: vk::DeviceSize,
}

struct VulkanState {
    next_address: u64,
    reservations: BTreeMap<u64, Reservation>,
    physical: HashMap<u64, vk::DeviceMemory>,
    next_handle: u64,
    host_buffers: HashMap<u64, DedicatedMapping<[u8]>>,
    next_host_buffer: u64,
    events: HashMap<u64, vk::Fence>,
    next_event: u64,
    command_pool: vk::CommandPool,
}

pub struct VulkanBackend {
    device: Arc<Device>,
    queue: vk::Queue,
    mem_props: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: vk::DeviceSize,
    state: Mutex<VulkanState>,
}

impl VulkanBackend {
    pub fn new(
        device: Arc<Device>,
        queue: vk::Queue,
        queue_family: u32,
        mem_props: vk::PhysicalDeviceMemoryProperties,
        non_coherent_atom_size: vk::DeviceSize,
    ) -> Result<Self, VmmError> {
        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(queue_family)
                    .flags(
                        vk::CommandPoolCreateFlags::TRANSIENT
                            | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    ),
                None,
            )
        }
        .map_err(|e| VmmError::ProducerFailure(format!("vkCreateCommandPool failed: {e:?}")))?;

        Ok(Self {
            device,
            queue,
            mem_props,
            non_coherent_atom_size,
            state: Mutex::new(VulkanState {
                next_address: BASE_ADDRESS,
                reservations: BTreeMap::new(),
                physical: HashMap::new(),
                next_handle: 1,
                host_buffers: HashMap::new(),
                next_host_buffer: 1,
                events: HashMap::new(),
                next_event: 1,
                command_pool,
            }),
        })
    }

    fn buffer_and_offset(
        &self,
        state: &VulkanState,
        address: u64,
    ) -> Result<(vk::Buffer, vk::DeviceSize), VmmError> {
        let (&base, reservation) = state
            .reservations
            .range(..=address)
            .next_back()
            .ok_or(VmmError::Unsupported("address not reserved"))?;
        if address >= base + reservation.size {
            return Err(VmmError::Unsupported("address outside reserved range"));
        }
        Ok((reservation.buffer, address - base))
    }

    fn run_one_shot(
        &self,
        state: &mut VulkanState,
        record: impl FnOnce(&Device, vk::CommandBuffer),
    ) -> Result<(), VmmError> {
        let cmd = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(state.command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        }
        .map_err(|e| VmmError::ProducerFailure(format!("vkAllocateCommandBuffers failed: {e:?}")))?
        [0];

        unsafe {
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )
        }
        .map_err(|e| VmmError::ProducerFailure(format!("vkBeginCommandBuffer failed: {e:?}")))?;

        record(&self.device, cmd);

        let result = unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| VmmError::ProducerFailure(format!("vkEndCommandBuffer failed: {e:?}")))
            .and_then(|()| {
                let fence = unsafe {
                    self.device
                        .create_fence(&vk::FenceCreateInfo::default(), None)
                }
                .map_err(|e| {
                    VmmError::ProducerFailure(format!("vkCreateFence failed: {e:?}"))
                })?;
                let submit = vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&cmd));
                let submitted = unsafe {
                    self.device
                        .queue_submit(self.queue, &[submit.build()], fence)
                        .and_then(|()| self.device.wait_for_fences(&[fence], true, !0))
                };
                unsafe { self.device.destroy_fence(fence, None) };
                submitted.map_err(|e| {
                    VmmError::ProducerFailure(format!("one-shot command submission failed: {e:?}"))
                })
            });

        unsafe {
            self.device
                .free_command_buffers(state.command_pool, &[cmd]);
        }

        result
    }
}

impl DriverBackend for VulkanBackend {
    fn reserve_virtual_address(&self, size: u64, alignment: u64) -> Result<u64, VmmError> {
        let mut state = self.state.lock().unwrap();
        let buffer = unsafe {
            self.device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(size)
                    .usage(
                        vk::BufferUsageFlags::STORAGE_BUFFER
                            | vk::BufferUsageFlags::TRANSFER_SRC
                            | vk::BufferUsageFlags::TRANSFER_DST,
                    )
                    .flags(
                        vk::BufferCreateFlags::SPARSE_BINDING
                            | vk::BufferCreateFlags::SPARSE_RESIDENCY,
                    )
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            )
        }
        .map_err(|e| VmmError::ProducerFailure(format!("vkCreateBuffer (sparse) failed: {e:?}")))?;

        let address = align_up(state.next_address, alignment.max(1));
        state.next_address = address + size;
        state
            .reservations
            .insert(address, Reservation { buffer, size });
        Ok(address)
    }

    fn release_virtual_address(&self, address: u64, _size: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(reservation) = state.reservations.remove(&address) {
            unsafe { self.device.destroy_buffer(reservation.buffer, None) };
        }
    }

    fn create_physical(
        &self,
        properties: AllocationProperties,
        size: u64,
    ) -> Result<PhysicalHandle, VmmError> {
        let flags = match properties.location {
            Location::Device(_) => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Location::PinnedHost => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let ty = find_memory_type(&self.mem_props, !0u32, flags)
            .ok_or_else(|| VmmError::ProducerFailure("no matching Vulkan memory type".into()))?;
        let memory = unsafe {
            self.device.allocate_memory(
                &vk::MemoryAllocateInfo::builder()
                    .allocation_size(size)
                    .memory_type_index(ty),
                None,
            )
        }
        .map_err(|e| VmmError::ProducerFailure(format!("vkAllocateMemory failed: {e:?}")))?;

        let mut state = self.state.lock().unwrap();
        let raw = state.next_handle;
        state.next_handle += 1;
        state.physical.insert(raw, memory);
        Ok(PhysicalHandle::new(raw))
    }

    fn release_physical(&self, handle: PhysicalHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(memory) = state.physical.remove(&handle.raw()) {
            unsafe { self.device.free_memory(memory, None) };
        }
    }

    fn map(&self, address: u64, size: u64, handle: PhysicalHandle) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        let memory = *state
            .physical
            .get(&handle.raw())
            .ok_or(VmmError::Unsupported("unknown physical handle"))?;
        let buffer = state
            .reservations
            .get(&address)
            .ok_or(VmmError::Unsupported("address not reserved"))?
            .buffer;

        let bind = vk::SparseMemoryBind {
            resource_offset: 0,
            size,
            memory,
            memory_offset: 0,
            flags: vk::SparseMemoryBindFlags::empty(),
        };
        let buffer_bind = vk::SparseBufferMemoryBindInfo::builder()
            .buffer(buffer)
            .binds(std::slice::from_ref(&bind));
        let bind_info =
            vk::BindSparseInfo::builder().buffer_binds(std::slice::from_ref(&buffer_bind));
        unsafe {
            self.device
                .queue_bind_sparse(self.queue, &[bind_info.build()], vk::Fence::null())
        }
        .map_err(|e| VmmError::StageSetupFailure {
            stage_index: 0,
            message: format!("vkQueueBindSparse (map) failed: {e:?}"),
        })
    }

    fn unmap(&self, address: u64, size: u64) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        let buffer = state
            .reservations
            .get(&address)
            .ok_or(VmmError::Unsupported("address not reserved"))?
            .buffer;

        let bind = vk::SparseMemoryBind {
            resource_offset: 0,
            size,
            memory: vk::DeviceMemory::null(),
            memory_offset: 0,
            flags: vk::SparseMemoryBindFlags::empty(),
        };
        let buffer_bind = vk::SparseBufferMemoryBindInfo::builder()
            .buffer(buffer)
            .binds(std::slice::from_ref(&bind));
        let bind_info =
            vk::BindSparseInfo::builder().buffer_binds(std::slice::from_ref(&buffer_bind));
        unsafe {
            self.device
                .queue_bind_sparse(self.queue, &[bind_info.build()], vk::Fence::null())
        }
        .map_err(|e| VmmError::StageTeardownFailure {
            stage_index: 0,
            message: format!("vkQueueBindSparse (unmap) failed: {e:?}"),
        })
    }

    fn set_access(
        &self,
        _address: u64,
        _size: u64,
        _descriptor: AccessDescriptor,
    ) -> Result<(), VmmError> {
        Ok(())
    }

    fn multicast_bind(
        &self,
        _mc: MulticastObject,
        _mc_offset: u64,
        _handle: PhysicalHandle,
        _mem_offset: u64,
        _size: u64,
    ) -> Result<(), VmmError> {
        Err(VmmError::Unsupported(
            "multicast bind requires VK_KHR_device_group peer memory",
        ))
    }

    fn multicast_unbind(
        &self,
        _mc: MulticastObject,
        _device: u32,
        _offset: u64,
        _size: u64,
    ) -> Result<(), VmmError> {
        Err(VmmError::Unsupported(
            "multicast unbind requires VK_KHR_device_group peer memory",
        ))
    }

    fn memset_async(
        &self,
        address: u64,
        size: u64,
        value: u8,
        _stream: Stream,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        let (buffer, offset) = self.buffer_and_offset(&state, address)?;
        let word = u32::from_ne_bytes([value; 4]);
        self.run_one_shot(&mut state, |device, cmd| unsafe {
            device.cmd_fill_buffer(cmd, buffer, offset, size, word);
        })
    }

    fn memcpy_device_to_host(
        &self,
        dst: HostBuffer,
        src_address: u64,
        size: u64,
        _stream: Stream,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        let (src_buffer, offset) = self.buffer_and_offset(&state, src_address)?;
        let dst_buffer = state
            .host_buffers
            .get(&dst.0)
            .ok_or(VmmError::Unsupported("unknown host buffer"))?
            .buffer();
        self.run_one_shot(&mut state, |device, cmd| unsafe {
            device.cmd_copy_buffer(
                cmd,
                src_buffer,
                dst_buffer,
                &[vk::BufferCopy { src_offset: offset, dst_offset: 0, size }],
            );
        })
    }

    fn memcpy_host_to_device(
        &self,
        dst_address: u64,
        src: HostBuffer,
        size: u64,
        _stream: Stream,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        let (dst_buffer, offset) = self.buffer_and_offset(&state, dst_address)?;
        let src_buffer = state
            .host_buffers
            .get(&src.0)
            .ok_or(VmmError::Unsupported("unknown host buffer"))?
            .buffer();
        self.run_one_shot(&mut state, |device, cmd| unsafe {
            device.cmd_copy_buffer(
                cmd,
                src_buffer,
                dst_buffer,
                &[vk::BufferCopy { src_offset: 0, dst_offset: offset, size }],
            );
        })
    }

    fn new_event(&self) -> DeviceEvent {
        let mut state = self.state.lock().unwrap();
        let id = state.next_event;
        state.next_event += 1;
        DeviceEvent(id)
    }

    fn event_record(&self, event: DeviceEvent, _stream: Stream) -> Result<(), VmmError> {
        let mut state = self.state.lock().unwrap();
        // Every call above already runs to completion before returning, so
        // recording only needs to remember that this id has been reached.
        let fence = unsafe {
            self.device.create_fence(
                &vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED),
                None,
            )
        }
        .map_err(|e| VmmError::ProducerFailure(format!("vkCreateFence failed: {e:?}")))?;
        if let Some(old) = state.events.insert(event.0, fence) {
            unsafe { self.device.destroy_fence(old, None) };
        }
        Ok(())
    }

    fn event_synchronize(&self, event: DeviceEvent) -> Result<(), VmmError> {
        let state = self.state.lock().unwrap();
        let fence = *state
            .events
            .get(&event.0)
            .ok_or(VmmError::Unsupported("event never recorded"))?;
        unsafe { self.device.wait_for_fences(&[fence], true, !0) }
            .map_err(|e| VmmError::ProducerFailure(format!("vkWaitForFences failed: {e:?}")))
    }

    fn allocate_host(&self, size: u64, _kind: HostBufferKind) -> Result<HostBuffer, VmmError> {
        let mapping = unsafe {
            DedicatedMapping::<[std::mem::MaybeUninit<u8>]>::uninit_array(
                &self.device,
                self.non_coherent_atom_size,
                &self.mem_props,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                size as usize,
            )
        }
        .map_err(|e| VmmError::ProducerFailure(format!("host buffer allocation failed: {e:?}")))?;
        let mapping = unsafe { mapping.assume_init() };
        let mut state = self.state.lock().unwrap();
        let id = state.next_host_buffer;
        state.next_host_buffer += 1;
        state.host_buffers.insert(id, mapping);
        Ok(HostBuffer(id))
    }

    fn free_host(&self, buffer: HostBuffer) {
        let mut state = self.state.lock().unwrap();
        if let Some(mut mapping) = state.host_buffers.remove(&buffer.0) {
            unsafe { mapping.destroy(&self.device) };
        }
    }

    fn granularity_of(&self, _properties: AllocationProperties) -> u64 {
        self.non_coherent_atom_size.max(1)
    }

    fn page_size(&self) -> u64 {
        4096
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        for (_, fence) in state.events.drain() {
            unsafe { self.device.destroy_fence(fence, None) };
        }
        for (_, mut mapping) in state.host_buffers.drain() {
            unsafe { mapping.destroy(&self.device) };
        }
        for (_, memory) in state.physical.drain() {
            unsafe { self.device.free_memory(memory, None) };
        }
        for (_, reservation) in std::mem::take(&mut state.reservations) {
            unsafe { self.device.destroy_buffer(reservation.buffer, None) };
        }
        unsafe { self.device.destroy_command_pool(state.command_pool, None) };
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
