//! Runtime-loaded Vulkan entry points via dlopen.
//!
//! Only the compute subset the runtime needs: instance/device bring-up,
//! buffer + memory management and fenced queue submission. The Android
//! loader exports every core 1.0 symbol, so no `vkGet*ProcAddr` walk is needed.

use std::ffi::{c_char, c_void};
use std::sync::OnceLock;

use libloading::Library;

use kestrel_core::{DeviceKind, EngineError};

// ---------------------------------------------------------------------------
// Handles, results, flags
// ---------------------------------------------------------------------------

pub type VkResult = i32;
pub const VK_SUCCESS: VkResult = 0;

pub type VkInstance = *mut c_void;
pub type VkPhysicalDevice = *mut c_void;
pub type VkDevice = *mut c_void;
pub type VkQueue = *mut c_void;
pub type VkCommandBuffer = *mut c_void;

// Non-dispatchable handles are 64-bit on every ABI.
pub type VkBuffer = u64;
pub type VkDeviceMemory = u64;
pub type VkCommandPool = u64;
pub type VkFence = u64;
pub type VkDeviceSize = u64;

pub const VK_NULL_HANDLE: u64 = 0;
pub const VK_WHOLE_SIZE: u64 = !0;

pub const VK_STRUCTURE_TYPE_APPLICATION_INFO: u32 = 0;
pub const VK_STRUCTURE_TYPE_INSTANCE_CREATE_INFO: u32 = 1;
pub const VK_STRUCTURE_TYPE_DEVICE_QUEUE_CREATE_INFO: u32 = 2;
pub const VK_STRUCTURE_TYPE_DEVICE_CREATE_INFO: u32 = 3;
pub const VK_STRUCTURE_TYPE_SUBMIT_INFO: u32 = 4;
pub const VK_STRUCTURE_TYPE_MEMORY_ALLOCATE_INFO: u32 = 5;
pub const VK_STRUCTURE_TYPE_FENCE_CREATE_INFO: u32 = 8;
pub const VK_STRUCTURE_TYPE_BUFFER_CREATE_INFO: u32 = 12;
pub const VK_STRUCTURE_TYPE_COMMAND_POOL_CREATE_INFO: u32 = 39;
pub const VK_STRUCTURE_TYPE_COMMAND_BUFFER_ALLOCATE_INFO: u32 = 40;
pub const VK_STRUCTURE_TYPE_COMMAND_BUFFER_BEGIN_INFO: u32 = 42;

pub const VK_QUEUE_COMPUTE_BIT: u32 = 0x2;

pub const VK_MEMORY_PROPERTY_DEVICE_LOCAL_BIT: u32 = 0x1;
pub const VK_MEMORY_PROPERTY_HOST_VISIBLE_BIT: u32 = 0x2;
pub const VK_MEMORY_PROPERTY_HOST_COHERENT_BIT: u32 = 0x4;
pub const VK_MEMORY_PROPERTY_HOST_CACHED_BIT: u32 = 0x8;

pub const VK_BUFFER_USAGE_TRANSFER_SRC_BIT: u32 = 0x1;
pub const VK_BUFFER_USAGE_TRANSFER_DST_BIT: u32 = 0x2;
pub const VK_BUFFER_USAGE_STORAGE_BUFFER_BIT: u32 = 0x20;

pub const VK_SHARING_MODE_EXCLUSIVE: u32 = 0;
pub const VK_COMMAND_BUFFER_LEVEL_PRIMARY: u32 = 0;
pub const VK_COMMAND_POOL_CREATE_RESET_COMMAND_BUFFER_BIT: u32 = 0x2;
pub const VK_COMMAND_BUFFER_USAGE_ONE_TIME_SUBMIT_BIT: u32 = 0x1;

pub const fn vk_make_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 22) | (minor << 12) | patch
}

pub const VK_API_VERSION_1_1: u32 = vk_make_version(1, 1, 0);

// ---------------------------------------------------------------------------
// Structures
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct VkApplicationInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub p_application_name: *const c_char,
    pub application_version: u32,
    pub p_engine_name: *const c_char,
    pub engine_version: u32,
    pub api_version: u32,
}

#[repr(C)]
pub struct VkInstanceCreateInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub flags: u32,
    pub p_application_info: *const VkApplicationInfo,
    pub enabled_layer_count: u32,
    pub pp_enabled_layer_names: *const *const c_char,
    pub enabled_extension_count: u32,
    pub pp_enabled_extension_names: *const *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VkExtent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VkQueueFamilyProperties {
    pub queue_flags: u32,
    pub queue_count: u32,
    pub timestamp_valid_bits: u32,
    pub min_image_transfer_granularity: VkExtent3D,
}

#[repr(C)]
pub struct VkDeviceQueueCreateInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub flags: u32,
    pub queue_family_index: u32,
    pub queue_count: u32,
    pub p_queue_priorities: *const f32,
}

#[repr(C)]
pub struct VkDeviceCreateInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub flags: u32,
    pub queue_create_info_count: u32,
    pub p_queue_create_infos: *const VkDeviceQueueCreateInfo,
    pub enabled_layer_count: u32,
    pub pp_enabled_layer_names: *const *const c_char,
    pub enabled_extension_count: u32,
    pub pp_enabled_extension_names: *const *const c_char,
    pub p_enabled_features: *const c_void,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VkMemoryType {
    pub property_flags: u32,
    pub heap_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VkMemoryHeap {
    pub size: VkDeviceSize,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VkPhysicalDeviceMemoryProperties {
    pub memory_type_count: u32,
    pub memory_types: [VkMemoryType; 32],
    pub memory_heap_count: u32,
    pub memory_heaps: [VkMemoryHeap; 16],
}

impl Default for VkPhysicalDeviceMemoryProperties {
    fn default() -> Self {
        Self {
            memory_type_count: 0,
            memory_types: [VkMemoryType::default(); 32],
            memory_heap_count: 0,
            memory_heaps: [VkMemoryHeap::default(); 16],
        }
    }
}

#[repr(C)]
pub struct VkBufferCreateInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub flags: u32,
    pub size: VkDeviceSize,
    pub usage: u32,
    pub sharing_mode: u32,
    pub queue_family_index_count: u32,
    pub p_queue_family_indices: *const u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VkMemoryRequirements {
    pub size: VkDeviceSize,
    pub alignment: VkDeviceSize,
    pub memory_type_bits: u32,
}

#[repr(C)]
pub struct VkMemoryAllocateInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub allocation_size: VkDeviceSize,
    pub memory_type_index: u32,
}

#[repr(C)]
pub struct VkCommandPoolCreateInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub flags: u32,
    pub queue_family_index: u32,
}

#[repr(C)]
pub struct VkCommandBufferAllocateInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub command_pool: VkCommandPool,
    pub level: u32,
    pub command_buffer_count: u32,
}

#[repr(C)]
pub struct VkCommandBufferBeginInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub flags: u32,
    pub p_inheritance_info: *const c_void,
}

#[repr(C)]
pub struct VkSubmitInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub wait_semaphore_count: u32,
    pub p_wait_semaphores: *const u64,
    pub p_wait_dst_stage_mask: *const u32,
    pub command_buffer_count: u32,
    pub p_command_buffers: *const VkCommandBuffer,
    pub signal_semaphore_count: u32,
    pub p_signal_semaphores: *const u64,
}

#[repr(C)]
pub struct VkFenceCreateInfo {
    pub s_type: u32,
    pub p_next: *const c_void,
    pub flags: u32,
}

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

type FnCreateInstance = unsafe extern "C" fn(*const VkInstanceCreateInfo, *const c_void, *mut VkInstance) -> VkResult;
type FnDestroyInstance = unsafe extern "C" fn(VkInstance, *const c_void);
type FnEnumeratePhysicalDevices = unsafe extern "C" fn(VkInstance, *mut u32, *mut VkPhysicalDevice) -> VkResult;
type FnGetQueueFamilyProperties = unsafe extern "C" fn(VkPhysicalDevice, *mut u32, *mut VkQueueFamilyProperties);
type FnGetMemoryProperties = unsafe extern "C" fn(VkPhysicalDevice, *mut VkPhysicalDeviceMemoryProperties);
type FnCreateDevice =
    unsafe extern "C" fn(VkPhysicalDevice, *const VkDeviceCreateInfo, *const c_void, *mut VkDevice) -> VkResult;
type FnDestroyDevice = unsafe extern "C" fn(VkDevice, *const c_void);
type FnGetDeviceQueue = unsafe extern "C" fn(VkDevice, u32, u32, *mut VkQueue);
type FnDeviceWaitIdle = unsafe extern "C" fn(VkDevice) -> VkResult;
type FnCreateBuffer = unsafe extern "C" fn(VkDevice, *const VkBufferCreateInfo, *const c_void, *mut VkBuffer) -> VkResult;
type FnDestroyBuffer = unsafe extern "C" fn(VkDevice, VkBuffer, *const c_void);
type FnGetBufferMemoryRequirements = unsafe extern "C" fn(VkDevice, VkBuffer, *mut VkMemoryRequirements);
type FnAllocateMemory =
    unsafe extern "C" fn(VkDevice, *const VkMemoryAllocateInfo, *const c_void, *mut VkDeviceMemory) -> VkResult;
type FnFreeMemory = unsafe extern "C" fn(VkDevice, VkDeviceMemory, *const c_void);
type FnBindBufferMemory = unsafe extern "C" fn(VkDevice, VkBuffer, VkDeviceMemory, VkDeviceSize) -> VkResult;
type FnMapMemory =
    unsafe extern "C" fn(VkDevice, VkDeviceMemory, VkDeviceSize, VkDeviceSize, u32, *mut *mut c_void) -> VkResult;
type FnUnmapMemory = unsafe extern "C" fn(VkDevice, VkDeviceMemory);
type FnCreateCommandPool =
    unsafe extern "C" fn(VkDevice, *const VkCommandPoolCreateInfo, *const c_void, *mut VkCommandPool) -> VkResult;
type FnDestroyCommandPool = unsafe extern "C" fn(VkDevice, VkCommandPool, *const c_void);
type FnAllocateCommandBuffers =
    unsafe extern "C" fn(VkDevice, *const VkCommandBufferAllocateInfo, *mut VkCommandBuffer) -> VkResult;
type FnFreeCommandBuffers = unsafe extern "C" fn(VkDevice, VkCommandPool, u32, *const VkCommandBuffer);
type FnBeginCommandBuffer = unsafe extern "C" fn(VkCommandBuffer, *const VkCommandBufferBeginInfo) -> VkResult;
type FnEndCommandBuffer = unsafe extern "C" fn(VkCommandBuffer) -> VkResult;
type FnQueueSubmit = unsafe extern "C" fn(VkQueue, u32, *const VkSubmitInfo, VkFence) -> VkResult;
type FnCreateFence = unsafe extern "C" fn(VkDevice, *const VkFenceCreateInfo, *const c_void, *mut VkFence) -> VkResult;
type FnDestroyFence = unsafe extern "C" fn(VkDevice, VkFence, *const c_void);
type FnWaitForFences = unsafe extern "C" fn(VkDevice, u32, *const VkFence, u32, u64) -> VkResult;
type FnCmdDispatch = unsafe extern "C" fn(VkCommandBuffer, u32, u32, u32);

// ---------------------------------------------------------------------------
// Loaded API
// ---------------------------------------------------------------------------

pub struct VulkanApi {
    _lib: Library,
    pub create_instance: FnCreateInstance,
    pub destroy_instance: FnDestroyInstance,
    pub enumerate_physical_devices: FnEnumeratePhysicalDevices,
    pub get_queue_family_properties: FnGetQueueFamilyProperties,
    pub get_memory_properties: FnGetMemoryProperties,
    pub create_device: FnCreateDevice,
    pub destroy_device: FnDestroyDevice,
    pub get_device_queue: FnGetDeviceQueue,
    pub device_wait_idle: FnDeviceWaitIdle,
    pub create_buffer: FnCreateBuffer,
    pub destroy_buffer: FnDestroyBuffer,
    pub get_buffer_memory_requirements: FnGetBufferMemoryRequirements,
    pub allocate_memory: FnAllocateMemory,
    pub free_memory: FnFreeMemory,
    pub bind_buffer_memory: FnBindBufferMemory,
    pub map_memory: FnMapMemory,
    pub unmap_memory: FnUnmapMemory,
    pub create_command_pool: FnCreateCommandPool,
    pub destroy_command_pool: FnDestroyCommandPool,
    pub allocate_command_buffers: FnAllocateCommandBuffers,
    pub free_command_buffers: FnFreeCommandBuffers,
    pub begin_command_buffer: FnBeginCommandBuffer,
    pub end_command_buffer: FnEndCommandBuffer,
    pub queue_submit: FnQueueSubmit,
    pub create_fence: FnCreateFence,
    pub destroy_fence: FnDestroyFence,
    pub wait_for_fences: FnWaitForFences,
    pub cmd_dispatch: FnCmdDispatch,
}

// Safety: the loaded function pointers are process-global; Vulkan's external
// synchronization rules are upheld by the callers (queue access is locked).
unsafe impl Send for VulkanApi {}
unsafe impl Sync for VulkanApi {}

static VULKAN_API: OnceLock<Option<VulkanApi>> = OnceLock::new();

impl VulkanApi {
    fn try_load() -> Option<Self> {
        let lib = unsafe { Library::new("libvulkan.so.1").or_else(|_| Library::new("libvulkan.so")) }.ok()?;
        unsafe {
            let api = VulkanApi {
                create_instance: *lib.get::<FnCreateInstance>(b"vkCreateInstance\0").ok()?,
                destroy_instance: *lib.get::<FnDestroyInstance>(b"vkDestroyInstance\0").ok()?,
                enumerate_physical_devices: *lib
                    .get::<FnEnumeratePhysicalDevices>(b"vkEnumeratePhysicalDevices\0")
                    .ok()?,
                get_queue_family_properties: *lib
                    .get::<FnGetQueueFamilyProperties>(b"vkGetPhysicalDeviceQueueFamilyProperties\0")
                    .ok()?,
                get_memory_properties: *lib
                    .get::<FnGetMemoryProperties>(b"vkGetPhysicalDeviceMemoryProperties\0")
                    .ok()?,
                create_device: *lib.get::<FnCreateDevice>(b"vkCreateDevice\0").ok()?,
                destroy_device: *lib.get::<FnDestroyDevice>(b"vkDestroyDevice\0").ok()?,
                get_device_queue: *lib.get::<FnGetDeviceQueue>(b"vkGetDeviceQueue\0").ok()?,
                device_wait_idle: *lib.get::<FnDeviceWaitIdle>(b"vkDeviceWaitIdle\0").ok()?,
                create_buffer: *lib.get::<FnCreateBuffer>(b"vkCreateBuffer\0").ok()?,
                destroy_buffer: *lib.get::<FnDestroyBuffer>(b"vkDestroyBuffer\0").ok()?,
                get_buffer_memory_requirements: *lib
                    .get::<FnGetBufferMemoryRequirements>(b"vkGetBufferMemoryRequirements\0")
                    .ok()?,
                allocate_memory: *lib.get::<FnAllocateMemory>(b"vkAllocateMemory\0").ok()?,
                free_memory: *lib.get::<FnFreeMemory>(b"vkFreeMemory\0").ok()?,
                bind_buffer_memory: *lib.get::<FnBindBufferMemory>(b"vkBindBufferMemory\0").ok()?,
                map_memory: *lib.get::<FnMapMemory>(b"vkMapMemory\0").ok()?,
                unmap_memory: *lib.get::<FnUnmapMemory>(b"vkUnmapMemory\0").ok()?,
                create_command_pool: *lib.get::<FnCreateCommandPool>(b"vkCreateCommandPool\0").ok()?,
                destroy_command_pool: *lib.get::<FnDestroyCommandPool>(b"vkDestroyCommandPool\0").ok()?,
                allocate_command_buffers: *lib
                    .get::<FnAllocateCommandBuffers>(b"vkAllocateCommandBuffers\0")
                    .ok()?,
                free_command_buffers: *lib.get::<FnFreeCommandBuffers>(b"vkFreeCommandBuffers\0").ok()?,
                begin_command_buffer: *lib.get::<FnBeginCommandBuffer>(b"vkBeginCommandBuffer\0").ok()?,
                end_command_buffer: *lib.get::<FnEndCommandBuffer>(b"vkEndCommandBuffer\0").ok()?,
                queue_submit: *lib.get::<FnQueueSubmit>(b"vkQueueSubmit\0").ok()?,
                create_fence: *lib.get::<FnCreateFence>(b"vkCreateFence\0").ok()?,
                destroy_fence: *lib.get::<FnDestroyFence>(b"vkDestroyFence\0").ok()?,
                wait_for_fences: *lib.get::<FnWaitForFences>(b"vkWaitForFences\0").ok()?,
                cmd_dispatch: *lib.get::<FnCmdDispatch>(b"vkCmdDispatch\0").ok()?,
                _lib: lib,
            };
            Some(api)
        }
    }
}

/// Get the runtime-loaded Vulkan API. Returns None if no loader is installed.
pub fn vulkan_api() -> Option<&'static VulkanApi> {
    VULKAN_API.get_or_init(VulkanApi::try_load).as_ref()
}

/// Check a Vulkan return code.
pub fn check_vk(code: VkResult, call: &'static str) -> Result<(), EngineError> {
    if code == VK_SUCCESS {
        Ok(())
    } else {
        Err(EngineError::Driver { device: DeviceKind::Gpu, call, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_packing() {
        assert_eq!(VK_API_VERSION_1_1, 0x0040_1000);
        assert_eq!(vk_make_version(1, 0, 0), 1 << 22);
    }

    #[test]
    fn test_check_vk() {
        assert!(check_vk(VK_SUCCESS, "vkCreateInstance").is_ok());
        let err = check_vk(-3, "vkCreateDevice").unwrap_err();
        assert_eq!(err.kind(), kestrel_core::ErrorKind::Execution);
    }

    #[test]
    fn test_memory_properties_layout() {
        // 4 + 32 * 8 + 4 + 16 * 16
        assert_eq!(std::mem::size_of::<VkPhysicalDeviceMemoryProperties>(), 520);
    }
}
