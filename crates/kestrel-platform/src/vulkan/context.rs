//! Vulkan device bring-up and fenced compute submission.

use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use kestrel_core::{DeviceKind, EngineError, Result};

use super::ffi::*;
use super::memory::VulkanAllocator;
use crate::probe::GpuCapabilities;

struct Submission {
    queue: VkQueue,
    command_pool: VkCommandPool,
}

/// Driver objects of one logical device. Destroyed when the last
/// [`GpuContext`] clone or outstanding GPU buffer lets go of it.
pub(crate) struct GpuDevice {
    pub(crate) api: &'static VulkanApi,
    instance: VkInstance,
    pub(crate) device: VkDevice,
    pub(crate) memory_properties: VkPhysicalDeviceMemoryProperties,
    queue_family: u32,
    // Queues and command pools require external synchronization.
    submission: Mutex<Submission>,
}

// Safety: Vulkan dispatchable handles may be used from any thread; the
// externally synchronized ones sit behind `submission`.
unsafe impl Send for GpuDevice {}
unsafe impl Sync for GpuDevice {}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        let api = self.api;
        let submission = self.submission.get_mut();
        unsafe {
            (api.device_wait_idle)(self.device);
            (api.destroy_command_pool)(self.device, submission.command_pool, ptr::null());
            (api.destroy_device)(self.device, ptr::null());
            (api.destroy_instance)(self.instance, ptr::null());
        }
        info!("vulkan gpu context shut down");
    }
}

/// Handle to the GPU's logical device and compute queue.
#[derive(Clone)]
pub struct GpuContext {
    device: Arc<GpuDevice>,
}

impl GpuContext {
    /// Create an instance, pick the first physical device with a compute
    /// queue, and open a logical device on it.
    pub fn new(caps: &GpuCapabilities) -> Result<Self> {
        let api = vulkan_api().ok_or(EngineError::DriverUnavailable { library: "libvulkan.so" })?;
        let instance = create_instance(api).map_err(init_error)?;

        // From here on, failures must destroy the instance.
        let built = (|| -> Result<GpuDevice> {
            let (physical, queue_family) = select_physical_device(api, instance)?;
            let mut memory_properties = VkPhysicalDeviceMemoryProperties::default();
            unsafe { (api.get_memory_properties)(physical, &mut memory_properties) };

            let device = create_logical_device(api, physical, queue_family)?;
            let mut queue: VkQueue = ptr::null_mut();
            unsafe { (api.get_device_queue)(device, queue_family, 0, &mut queue) };

            let pool_info = VkCommandPoolCreateInfo {
                s_type: VK_STRUCTURE_TYPE_COMMAND_POOL_CREATE_INFO,
                p_next: ptr::null(),
                flags: VK_COMMAND_POOL_CREATE_RESET_COMMAND_BUFFER_BIT,
                queue_family_index: queue_family,
            };
            let mut command_pool: VkCommandPool = VK_NULL_HANDLE;
            if let Err(e) = check_vk(
                unsafe { (api.create_command_pool)(device, &pool_info, ptr::null(), &mut command_pool) },
                "vkCreateCommandPool",
            ) {
                unsafe { (api.destroy_device)(device, ptr::null()) };
                return Err(e);
            }

            Ok(GpuDevice {
                api,
                instance,
                device,
                memory_properties,
                queue_family,
                submission: Mutex::new(Submission { queue, command_pool }),
            })
        })();

        let device = match built {
            Ok(device) => device,
            Err(e) => {
                unsafe { (api.destroy_instance)(instance, ptr::null()) };
                return Err(init_error(e));
            }
        };

        info!(
            gpu = caps.name,
            queue_family = device.queue_family,
            memory_types = device.memory_properties.memory_type_count,
            "vulkan gpu context initialized"
        );
        Ok(Self { device: Arc::new(device) })
    }

    /// Allocator handing out buffers on this device.
    pub fn allocator(&self) -> VulkanAllocator {
        VulkanAllocator::new(Arc::clone(&self.device))
    }

    pub fn queue_family_index(&self) -> u32 {
        self.device.queue_family
    }

    /// Record one command buffer, submit it to the compute queue and block
    /// until the fence signals.
    pub fn submit_and_wait(&self, record: impl FnOnce(&CommandRecorder) -> Result<()>) -> Result<()> {
        let dev = &*self.device;
        let api = dev.api;
        let submission = dev.submission.lock();

        let alloc_info = VkCommandBufferAllocateInfo {
            s_type: VK_STRUCTURE_TYPE_COMMAND_BUFFER_ALLOCATE_INFO,
            p_next: ptr::null(),
            command_pool: submission.command_pool,
            level: VK_COMMAND_BUFFER_LEVEL_PRIMARY,
            command_buffer_count: 1,
        };
        let mut cmd: VkCommandBuffer = ptr::null_mut();
        check_vk(
            unsafe { (api.allocate_command_buffers)(dev.device, &alloc_info, &mut cmd) },
            "vkAllocateCommandBuffers",
        )?;

        let mut fence: VkFence = VK_NULL_HANDLE;
        let result = (|| -> Result<()> {
            let begin = VkCommandBufferBeginInfo {
                s_type: VK_STRUCTURE_TYPE_COMMAND_BUFFER_BEGIN_INFO,
                p_next: ptr::null(),
                flags: VK_COMMAND_BUFFER_USAGE_ONE_TIME_SUBMIT_BIT,
                p_inheritance_info: ptr::null(),
            };
            check_vk(unsafe { (api.begin_command_buffer)(cmd, &begin) }, "vkBeginCommandBuffer")?;
            record(&CommandRecorder { api, cmd })?;
            check_vk(unsafe { (api.end_command_buffer)(cmd) }, "vkEndCommandBuffer")?;

            let fence_info = VkFenceCreateInfo {
                s_type: VK_STRUCTURE_TYPE_FENCE_CREATE_INFO,
                p_next: ptr::null(),
                flags: 0,
            };
            check_vk(
                unsafe { (api.create_fence)(dev.device, &fence_info, ptr::null(), &mut fence) },
                "vkCreateFence",
            )?;

            let submit = VkSubmitInfo {
                s_type: VK_STRUCTURE_TYPE_SUBMIT_INFO,
                p_next: ptr::null(),
                wait_semaphore_count: 0,
                p_wait_semaphores: ptr::null(),
                p_wait_dst_stage_mask: ptr::null(),
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                signal_semaphore_count: 0,
                p_signal_semaphores: ptr::null(),
            };
            check_vk(unsafe { (api.queue_submit)(submission.queue, 1, &submit, fence) }, "vkQueueSubmit")?;
            check_vk(
                unsafe { (api.wait_for_fences)(dev.device, 1, &fence, 1, u64::MAX) },
                "vkWaitForFences",
            )
        })();

        unsafe {
            if fence != VK_NULL_HANDLE {
                (api.destroy_fence)(dev.device, fence, ptr::null());
            }
            (api.free_command_buffers)(dev.device, submission.command_pool, 1, &cmd);
        }
        debug!(ok = result.is_ok(), "gpu submission complete");
        result
    }
}

/// Command buffer in the recording state, handed to GPU kernels.
pub struct CommandRecorder {
    api: &'static VulkanApi,
    cmd: VkCommandBuffer,
}

impl CommandRecorder {
    /// Raw command buffer for kernels that bind their own pipelines.
    pub fn raw(&self) -> *mut c_void {
        self.cmd
    }

    pub fn api(&self) -> &'static VulkanApi {
        self.api
    }

    /// Record a compute dispatch with the currently bound pipeline.
    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        unsafe { (self.api.cmd_dispatch)(self.cmd, x, y, z) };
    }
}

fn init_error(e: EngineError) -> EngineError {
    match e {
        EngineError::DeviceInit { .. } => e,
        other => EngineError::DeviceInit { device: DeviceKind::Gpu, reason: other.to_string() },
    }
}

fn create_instance(api: &VulkanApi) -> Result<VkInstance> {
    let app_info = VkApplicationInfo {
        s_type: VK_STRUCTURE_TYPE_APPLICATION_INFO,
        p_next: ptr::null(),
        p_application_name: b"kestrel\0".as_ptr().cast(),
        application_version: vk_make_version(0, 1, 0),
        p_engine_name: b"kestrel-runtime\0".as_ptr().cast(),
        engine_version: vk_make_version(0, 1, 0),
        api_version: VK_API_VERSION_1_1,
    };
    let create_info = VkInstanceCreateInfo {
        s_type: VK_STRUCTURE_TYPE_INSTANCE_CREATE_INFO,
        p_next: ptr::null(),
        flags: 0,
        p_application_info: &app_info,
        enabled_layer_count: 0,
        pp_enabled_layer_names: ptr::null(),
        enabled_extension_count: 0,
        pp_enabled_extension_names: ptr::null(),
    };
    let mut instance: VkInstance = ptr::null_mut();
    check_vk(
        unsafe { (api.create_instance)(&create_info, ptr::null(), &mut instance) },
        "vkCreateInstance",
    )?;
    Ok(instance)
}

fn select_physical_device(api: &VulkanApi, instance: VkInstance) -> Result<(VkPhysicalDevice, u32)> {
    let mut count = 0u32;
    check_vk(
        unsafe { (api.enumerate_physical_devices)(instance, &mut count, ptr::null_mut()) },
        "vkEnumeratePhysicalDevices",
    )?;
    let mut devices: Vec<VkPhysicalDevice> = vec![ptr::null_mut(); count as usize];
    check_vk(
        unsafe { (api.enumerate_physical_devices)(instance, &mut count, devices.as_mut_ptr()) },
        "vkEnumeratePhysicalDevices",
    )?;
    devices.truncate(count as usize);

    for physical in devices {
        let mut family_count = 0u32;
        unsafe { (api.get_queue_family_properties)(physical, &mut family_count, ptr::null_mut()) };
        let mut families = vec![VkQueueFamilyProperties::default(); family_count as usize];
        unsafe { (api.get_queue_family_properties)(physical, &mut family_count, families.as_mut_ptr()) };

        if let Some(index) = families
            .iter()
            .take(family_count as usize)
            .position(|f| f.queue_flags & VK_QUEUE_COMPUTE_BIT != 0)
        {
            return Ok((physical, index as u32));
        }
    }

    Err(EngineError::DeviceInit {
        device: DeviceKind::Gpu,
        reason: "no physical device with a compute queue".into(),
    })
}

fn create_logical_device(api: &VulkanApi, physical: VkPhysicalDevice, queue_family: u32) -> Result<VkDevice> {
    let priority = 1.0f32;
    let queue_info = VkDeviceQueueCreateInfo {
        s_type: VK_STRUCTURE_TYPE_DEVICE_QUEUE_CREATE_INFO,
        p_next: ptr::null(),
        flags: 0,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: &priority,
    };
    let create_info = VkDeviceCreateInfo {
        s_type: VK_STRUCTURE_TYPE_DEVICE_CREATE_INFO,
        p_next: ptr::null(),
        flags: 0,
        queue_create_info_count: 1,
        p_queue_create_infos: &queue_info,
        enabled_layer_count: 0,
        pp_enabled_layer_names: ptr::null(),
        enabled_extension_count: 0,
        pp_enabled_extension_names: ptr::null(),
        p_enabled_features: ptr::null(),
    };
    let mut device: VkDevice = ptr::null_mut();
    check_vk(
        unsafe { (api.create_device)(physical, &create_info, ptr::null(), &mut device) },
        "vkCreateDevice",
    )?;
    Ok(device)
}
