//! GPU backend over Vulkan compute.
//!
//! The loader is opened at runtime (see `ffi.rs`), so hosts without Vulkan
//! simply report the GPU as unavailable.

pub mod context;
pub mod ffi;
pub mod memory;

pub use context::{CommandRecorder, GpuContext};
pub use memory::VulkanAllocator;

/// Whether a Vulkan loader could be opened.
pub fn is_vulkan_available() -> bool {
    ffi::vulkan_api().is_some()
}
