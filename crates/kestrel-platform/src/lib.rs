//! # kestrel-platform
//!
//! Hardware access layer for the Kestrel runtime.
//!
//! Provides:
//! - `HardwareProber`: one-shot capability snapshot of the SoC
//! - `DeviceManager`: activation of the requested compute devices
//! - `MemoryAllocator` / `Buffer`: the allocation contract with exactly-once release
//! - CPU (heap), GPU (Vulkan) and NPU (NNAPI shared memory) allocators
//! - `PlatformBackend`: allocator registry, device contexts and memory budgets
//! - `testing`: counting allocator doubles for driverless hosts

pub mod backend;
pub mod cpu;
pub mod device_manager;
pub mod memory;
pub mod nnapi;
pub mod probe;
pub mod testing;
pub mod vulkan;

pub use backend::PlatformBackend;
pub use cpu::CpuAllocator;
pub use device_manager::{Device, DeviceConfig, DeviceManager};
pub use memory::{Buffer, MemoryAllocator, MemoryUsage, NativeHandle};
pub use nnapi::{NpuContext, NpuGraph};
pub use probe::{Capabilities, CapabilitySnapshot, HardwareProber};
pub use vulkan::{CommandRecorder, GpuContext};
