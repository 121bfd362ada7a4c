//! One-shot hardware capability probe.
//!
//! Topology and throughput figures are the fixed facts of the target chip.
//! Accelerator presence is decided by whether the driver library loads, so
//! the same binary degrades to CPU-only on hosts without Vulkan or NNAPI.

use std::sync::OnceLock;

use kestrel_core::constants;
use kestrel_core::DeviceKind;

use crate::{nnapi, vulkan};

#[derive(Debug, Clone, PartialEq)]
pub struct CpuCapabilities {
    pub architecture: &'static str,
    pub big_cores: usize,
    pub little_cores: usize,
    pub total_cores: usize,
    pub l1_cache_bytes: usize,
    pub l2_cache_bytes: usize,
    pub cache_line_bytes: usize,
    pub neon: bool,
    pub total_memory_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuCapabilities {
    pub name: &'static str,
    pub compute_units: u32,
    pub workgroup_size: u32,
    pub supports_fp16: bool,
    /// Vulkan loader present; required to activate the GPU.
    pub supports_vulkan: bool,
    /// Unified memory SoC: the GPU has no memory of its own.
    pub dedicated_memory_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NpuCapabilities {
    pub driver_version: &'static str,
    /// NNAPI runtime present; required to activate the NPU.
    pub is_available: bool,
    pub tops: f32,
    pub supports_int8: bool,
    pub supports_int16: bool,
    pub batch_size: u32,
}

/// Capability record of one device, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Capabilities {
    Cpu(CpuCapabilities),
    Gpu(GpuCapabilities),
    Npu(NpuCapabilities),
}

impl Capabilities {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Capabilities::Cpu(_) => DeviceKind::Cpu,
            Capabilities::Gpu(_) => DeviceKind::Gpu,
            Capabilities::Npu(_) => DeviceKind::Npu,
        }
    }

    /// Whether the device can be activated.
    pub fn is_usable(&self) -> bool {
        match self {
            Capabilities::Cpu(_) => true,
            Capabilities::Gpu(gpu) => gpu.supports_vulkan,
            Capabilities::Npu(npu) => npu.is_available,
        }
    }
}

/// Everything the probe learned, one record per compute device.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilitySnapshot {
    pub cpu: CpuCapabilities,
    pub gpu: GpuCapabilities,
    pub npu: NpuCapabilities,
}

impl CapabilitySnapshot {
    /// Chip facts with accelerator availability set explicitly.
    pub fn with_accelerators(gpu: bool, npu: bool) -> Self {
        Self {
            cpu: CpuCapabilities {
                architecture: constants::CPU_ARCHITECTURE,
                big_cores: constants::BIG_CORE_COUNT,
                little_cores: constants::LITTLE_CORE_COUNT,
                total_cores: constants::TOTAL_CPU_CORES,
                l1_cache_bytes: constants::L1_CACHE_SIZE,
                l2_cache_bytes: constants::L2_CACHE_SIZE,
                cache_line_bytes: constants::CACHE_LINE_SIZE,
                neon: cfg!(target_arch = "aarch64"),
                total_memory_bytes: 0,
            },
            gpu: GpuCapabilities {
                name: constants::GPU_NAME,
                compute_units: constants::GPU_COMPUTE_UNITS,
                workgroup_size: constants::GPU_WORKGROUP_SIZE,
                supports_fp16: true,
                supports_vulkan: gpu,
                dedicated_memory_bytes: 0,
            },
            npu: NpuCapabilities {
                driver_version: constants::NPU_DRIVER,
                is_available: npu,
                tops: constants::NPU_TOPS,
                supports_int8: true,
                supports_int16: true,
                batch_size: constants::NPU_BATCH_SIZE,
            },
        }
    }

    /// Snapshot of a machine with only the CPU usable.
    pub fn cpu_only() -> Self {
        Self::with_accelerators(false, false)
    }

    /// Capability record for a compute device; `None` for `Shared`.
    pub fn capabilities(&self, kind: DeviceKind) -> Option<Capabilities> {
        match kind {
            DeviceKind::Cpu => Some(Capabilities::Cpu(self.cpu.clone())),
            DeviceKind::Gpu => Some(Capabilities::Gpu(self.gpu.clone())),
            DeviceKind::Npu => Some(Capabilities::Npu(self.npu.clone())),
            DeviceKind::Shared => None,
        }
    }
}

static SNAPSHOT: OnceLock<CapabilitySnapshot> = OnceLock::new();

pub struct HardwareProber;

impl HardwareProber {
    /// Probe once per process; later calls return the same snapshot.
    pub fn probe() -> &'static CapabilitySnapshot {
        SNAPSHOT.get_or_init(Self::detect)
    }

    /// Build a fresh snapshot without caching it.
    pub fn detect() -> CapabilitySnapshot {
        let mut snapshot = CapabilitySnapshot::with_accelerators(
            vulkan::ffi::vulkan_api().is_some(),
            nnapi::ffi::nnapi_api().is_some(),
        );
        snapshot.cpu.total_memory_bytes = total_memory_bytes();
        tracing::debug!(
            gpu = snapshot.gpu.supports_vulkan,
            npu = snapshot.npu.is_available,
            memory_mb = snapshot.cpu.total_memory_bytes / (1024 * 1024),
            "hardware probed"
        );
        snapshot
    }
}

fn total_memory_bytes() -> u64 {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::new().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    sys.total_memory()
}
