//! Vulkan buffer allocation.
//!
//! One `VkDeviceMemory` per buffer, typed by usage class. Host-visible
//! buffers are mapped for their whole lifetime.

use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use kestrel_core::{DeviceKind, EngineError, Result};

use super::context::GpuDevice;
use super::ffi::*;
use crate::memory::{Buffer, MemoryAllocator, MemoryUsage, NativeHandle};

/// Hands out buffers on one logical device. Every buffer keeps the device
/// alive until it is released.
pub struct VulkanAllocator {
    device: Arc<GpuDevice>,
}

impl VulkanAllocator {
    pub(crate) fn new(device: Arc<GpuDevice>) -> Self {
        Self { device }
    }
}

/// Memory property flags wanted for a usage class, most preferred first.
fn wanted_properties(usage: MemoryUsage) -> &'static [u32] {
    const VISIBLE: u32 = VK_MEMORY_PROPERTY_HOST_VISIBLE_BIT;
    match usage {
        MemoryUsage::DeviceLocal => &[VK_MEMORY_PROPERTY_DEVICE_LOCAL_BIT, 0],
        MemoryUsage::HostVisibleCoherent => &[VISIBLE | VK_MEMORY_PROPERTY_HOST_COHERENT_BIT],
        // mapped memory is never flushed or invalidated, so it must stay coherent
        MemoryUsage::HostVisibleCached => &[
            VISIBLE | VK_MEMORY_PROPERTY_HOST_COHERENT_BIT | VK_MEMORY_PROPERTY_HOST_CACHED_BIT,
            VISIBLE | VK_MEMORY_PROPERTY_HOST_COHERENT_BIT,
        ],
    }
}

/// Index of the first memory type allowed by `type_bits` that has all of
/// the wanted property flags, trying each preference in order.
pub(crate) fn find_memory_type(
    props: &VkPhysicalDeviceMemoryProperties,
    type_bits: u32,
    usage: MemoryUsage,
) -> Option<u32> {
    let count = (props.memory_type_count as usize).min(props.memory_types.len());
    wanted_properties(usage).iter().find_map(|&wanted| {
        (0..count).find_map(|i| {
            let allowed = type_bits & (1 << i) != 0;
            let flags = props.memory_types[i].property_flags;
            (allowed && flags & wanted == wanted).then_some(i as u32)
        })
    })
}

impl MemoryAllocator for VulkanAllocator {
    fn device(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    fn allocate(&self, size: usize, usage: MemoryUsage) -> Result<Buffer> {
        let dev = &*self.device;
        let api = dev.api;
        let alloc_err = |reason: String| EngineError::AllocationFailed { device: DeviceKind::Gpu, size, reason };

        let buffer_info = VkBufferCreateInfo {
            s_type: VK_STRUCTURE_TYPE_BUFFER_CREATE_INFO,
            p_next: ptr::null(),
            flags: 0,
            // zero-sized buffers are invalid in Vulkan
            size: size.max(1) as VkDeviceSize,
            usage: VK_BUFFER_USAGE_STORAGE_BUFFER_BIT
                | VK_BUFFER_USAGE_TRANSFER_DST_BIT
                | VK_BUFFER_USAGE_TRANSFER_SRC_BIT,
            sharing_mode: VK_SHARING_MODE_EXCLUSIVE,
            queue_family_index_count: 0,
            p_queue_family_indices: ptr::null(),
        };
        let mut buffer: VkBuffer = VK_NULL_HANDLE;
        let code = unsafe { (api.create_buffer)(dev.device, &buffer_info, ptr::null(), &mut buffer) };
        if code != VK_SUCCESS {
            return Err(alloc_err(format!("vkCreateBuffer returned {code}")));
        }

        let mut reqs = VkMemoryRequirements::default();
        unsafe { (api.get_buffer_memory_requirements)(dev.device, buffer, &mut reqs) };

        let Some(type_index) = find_memory_type(&dev.memory_properties, reqs.memory_type_bits, usage) else {
            unsafe { (api.destroy_buffer)(dev.device, buffer, ptr::null()) };
            return Err(alloc_err(format!("no memory type for {usage:?}")));
        };

        let alloc_info = VkMemoryAllocateInfo {
            s_type: VK_STRUCTURE_TYPE_MEMORY_ALLOCATE_INFO,
            p_next: ptr::null(),
            allocation_size: reqs.size,
            memory_type_index: type_index,
        };
        let mut memory: VkDeviceMemory = VK_NULL_HANDLE;
        let code = unsafe { (api.allocate_memory)(dev.device, &alloc_info, ptr::null(), &mut memory) };
        if code != VK_SUCCESS {
            unsafe { (api.destroy_buffer)(dev.device, buffer, ptr::null()) };
            return Err(alloc_err(format!("vkAllocateMemory returned {code}")));
        }

        let free_both = || unsafe {
            (api.destroy_buffer)(dev.device, buffer, ptr::null());
            (api.free_memory)(dev.device, memory, ptr::null());
        };

        let code = unsafe { (api.bind_buffer_memory)(dev.device, buffer, memory, 0) };
        if code != VK_SUCCESS {
            free_both();
            return Err(alloc_err(format!("vkBindBufferMemory returned {code}")));
        }

        let mut mapped = None;
        if usage.is_host_visible() {
            let mut data: *mut c_void = ptr::null_mut();
            let code = unsafe { (api.map_memory)(dev.device, memory, 0, VK_WHOLE_SIZE, 0, &mut data) };
            if code != VK_SUCCESS {
                free_both();
                return Err(alloc_err(format!("vkMapMemory returned {code}")));
            }
            mapped = NonNull::new(data.cast::<u8>());
        }

        let owner = Arc::clone(&self.device);
        let release = Box::new(move |_: &NativeHandle, mapped: Option<NonNull<u8>>, _: usize| {
            let api = owner.api;
            unsafe {
                if mapped.is_some() {
                    (api.unmap_memory)(owner.device, memory);
                }
                (api.destroy_buffer)(owner.device, buffer, ptr::null());
                (api.free_memory)(owner.device, memory, ptr::null());
            }
        });

        tracing::trace!(size, ?usage, type_index, "vulkan buffer allocated");
        Ok(unsafe {
            Buffer::from_raw_parts(DeviceKind::Gpu, NativeHandle::Vulkan { buffer, memory }, mapped, size, release)
        })
    }
}
