//! Primitive synchronous allocation helpers

use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};

use ash::version::DeviceV1_0;
use ash::{vk, Device};

/// Failure constructing or mapping a `DedicatedBuffer`.
#[derive(Debug)]
pub enum MemoryError {
    Vulkan(vk::Result),
    NoMatchingMemoryType,
}

impl From<vk::Result> for MemoryError {
    fn from(e: vk::Result) -> Self {
        MemoryError::Vulkan(e)
    }
}

/// A buffer accessible directly by the host
pub struct DedicatedMapping<T: ?Sized> {
    buffer: DedicatedBuffer,
    ptr: NonNull<T>,
}

impl<T> DedicatedMapping<[MaybeUninit<T>]> {
    /// Create a mapped buffer sized to hold `size` elements of `T`, uninitialized.
    ///
    /// # Safety
    ///
    /// `props` must be from `device`, and `T`'s alignment must not be greater than the physical
    /// device's `minMemoryMapAlignment`.
    pub unsafe fn uninit_array(
        device: &Device,
        non_coherent_atom_size: vk::DeviceSize,
        props: &vk::PhysicalDeviceMemoryProperties,
        usage: vk::BufferUsageFlags,
        size: usize,
    ) -> Result<Self, MemoryError> {
        let mut buffer = DedicatedBuffer::new(
            device,
            props,
            &vk::BufferCreateInfo::builder()
                .size(align(
                    (size * mem::size_of::<T>()) as vk::DeviceSize,
                    non_coherent_atom_size,
                ))
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE),
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;
        let mapped = match device.map_memory(
            buffer.memory,
            0,
            (size * mem::size_of::<T>()) as _,
            vk::MemoryMapFlags::default(),
        ) {
            Ok(p) => p,
            Err(e) => {
                buffer.destroy(device);
                return Err(e.into());
            }
        };
        let ptr = std::slice::from_raw_parts_mut(mapped as *mut _, size).into();
        Ok(Self { buffer, ptr })
    }

    pub unsafe fn assume_init(self) -> DedicatedMapping<[T]> {
        DedicatedMapping {
            buffer: self.buffer,
            ptr: NonNull::new_unchecked(self.ptr.as_ptr() as *mut [T]),
        }
    }
}

impl<T: ?Sized> DedicatedMapping<T> {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.handle
    }

    pub unsafe fn destroy(&mut self, device: &Device) {
        ptr::drop_in_place(self.ptr.as_ptr());
        self.buffer.destroy(device);
    }
}

unsafe impl<T: ?Sized> Send for DedicatedMapping<T> {}
unsafe impl<T: ?Sized> Sync for DedicatedMapping<T> {}

impl<T: ?Sized> std::ops::Deref for DedicatedMapping<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ?Sized> std::ops::DerefMut for DedicatedMapping<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

/// A buffer with its own memory allocation
#[derive(Copy, Clone)]
pub struct DedicatedBuffer {
    pub memory: vk::DeviceMemory,
    pub handle: vk::Buffer,
}

impl DedicatedBuffer {
    pub unsafe fn new(
        device: &Device,
        props: &vk::PhysicalDeviceMemoryProperties,
        info: &vk::BufferCreateInfo,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Self, MemoryError> {
        let handle = device.create_buffer(info, None)?;
        let reqs = device.get_buffer_memory_requirements(handle);
        let memory_ty = match find_memory_type(props, reqs.memory_type_bits, flags) {
            Some(ty) => ty,
            None => {
                device.destroy_buffer(handle, None);
                return Err(MemoryError::NoMatchingMemoryType);
            }
        };
        let memory = match device.allocate_memory(
            &vk::MemoryAllocateInfo::builder()
                .allocation_size(reqs.size)
                .memory_type_index(memory_ty)
                .push_next(&mut vk::MemoryDedicatedAllocateInfo::builder().buffer(handle)),
            None,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(handle, None);
                return Err(e.into());
            }
        };
        if let Err(e) = device.bind_buffer_memory(handle, memory, 0) {
            device.destroy_buffer(handle, None);
            device.free_memory(memory, None);
            return Err(e.into());
        }
        Ok(Self { handle, memory })
    }

    pub unsafe fn destroy(&mut self, device: &Device) {
        device.destroy_buffer(self.handle, None);
        device.free_memory(self.memory, None);
    }
}

pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    for i in 0..props.memory_type_count {
        if type_bits & (1 << i) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(flags)
        {
            return Some(i);
        }
    }
    None
}

/// Round `offset` up to the next multiple of `alignment`
pub fn align(offset: u64, alignment: u64) -> u64 {
    let misalignment = offset % alignment;
    let padding = if misalignment == 0 {
        0
    } else {
        alignment - misalignment
    };
    offset + padding
}
