//! Unified allocation facade over the per-device backends.
//!
//! The backend owns the GPU/NPU contexts brought up for the active devices
//! and routes every allocation to the allocator registered for the target
//! device kind. Optional per-device budgets cap the live bytes handed out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use kestrel_core::{DeviceKind, EngineError, Result};

use crate::cpu::CpuAllocator;
use crate::device_manager::{DeviceConfig, DeviceManager};
use crate::memory::{Buffer, MemoryAllocator, MemoryUsage};
use crate::nnapi::NpuContext;
use crate::probe::Capabilities;
use crate::vulkan::GpuContext;

/// Live-byte accounting for one device.
#[derive(Debug)]
struct Budget {
    limit: usize,
    used: AtomicUsize,
}

impl Budget {
    fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
struct Registry {
    allocators: HashMap<DeviceKind, Arc<dyn MemoryAllocator>>,
    gpu: Option<GpuContext>,
    npu: Option<NpuContext>,
    active: Vec<DeviceKind>,
    budgets: HashMap<DeviceKind, Arc<Budget>>,
}

pub struct PlatformBackend {
    inner: Mutex<Registry>,
}

impl PlatformBackend {
    /// Bring up contexts and allocators for the manager's active devices.
    ///
    /// The CPU allocator is always registered. A GPU or NPU whose context
    /// fails to come up is dropped with a warning; if no compute device
    /// survives, initialization fails.
    pub fn initialize(devices: &DeviceManager, configs: &[DeviceConfig]) -> Result<Self> {
        let mut reg = Registry::default();
        reg.allocators.insert(DeviceKind::Cpu, Arc::new(CpuAllocator::new()));

        for device in devices.active_devices() {
            match device.capabilities() {
                Capabilities::Cpu(_) => reg.active.push(DeviceKind::Cpu),
                Capabilities::Gpu(caps) => match GpuContext::new(caps) {
                    Ok(ctx) => {
                        reg.allocators.insert(DeviceKind::Gpu, Arc::new(ctx.allocator()));
                        reg.gpu = Some(ctx);
                        reg.active.push(DeviceKind::Gpu);
                    }
                    Err(e) => warn!(error = %e, "gpu context unavailable, continuing without it"),
                },
                Capabilities::Npu(caps) => match NpuContext::new(caps) {
                    Ok(ctx) => {
                        reg.allocators.insert(DeviceKind::Npu, Arc::new(ctx.allocator()));
                        reg.npu = Some(ctx);
                        reg.active.push(DeviceKind::Npu);
                    }
                    Err(e) => warn!(error = %e, "npu context unavailable, continuing without it"),
                },
            }
        }

        if reg.active.is_empty() {
            return Err(EngineError::NoActiveDevices);
        }

        let backend = Self { inner: Mutex::new(reg) };
        for config in configs.iter().filter(|c| c.enabled) {
            backend.set_budget(config.kind, config.budget_bytes());
        }
        info!(active = ?backend.active_kinds(), "platform backend initialized");
        Ok(backend)
    }

    /// Backend over caller-supplied allocators, with no driver contexts.
    /// Every compute kind among them counts as active.
    pub fn from_allocators(allocators: impl IntoIterator<Item = Arc<dyn MemoryAllocator>>) -> Self {
        let backend = Self { inner: Mutex::new(Registry::default()) };
        for allocator in allocators {
            backend.register_allocator(allocator);
        }
        backend
    }

    /// Install (or replace) the allocator for its device kind.
    pub fn register_allocator(&self, allocator: Arc<dyn MemoryAllocator>) {
        let kind = allocator.device();
        let mut reg = self.inner.lock();
        reg.allocators.insert(kind, allocator);
        if kind.is_compute() && !reg.active.contains(&kind) {
            reg.active.push(kind);
            reg.active.sort_by_key(|k| k.id());
        }
        debug!(device = %kind, "allocator registered");
    }

    /// Cap the live bytes handed out for `kind`; `None` removes the cap.
    pub fn set_budget(&self, kind: DeviceKind, bytes: Option<usize>) {
        let mut reg = self.inner.lock();
        match bytes {
            Some(limit) => {
                reg.budgets.insert(kind, Arc::new(Budget { limit, used: AtomicUsize::new(0) }));
            }
            None => {
                reg.budgets.remove(&kind);
            }
        }
    }

    /// Bytes still available under the budget for `kind`, `None` if uncapped.
    pub fn remaining_budget(&self, kind: DeviceKind) -> Option<usize> {
        self.inner.lock().budgets.get(&kind).map(|b| b.remaining())
    }

    /// Allocator serving `kind`. `Shared` falls back to the CPU allocator
    /// when nothing sharing-capable is registered.
    pub fn allocator_for(&self, kind: DeviceKind) -> Option<Arc<dyn MemoryAllocator>> {
        Self::resolve(&self.inner.lock(), kind)
    }

    fn resolve(reg: &Registry, kind: DeviceKind) -> Option<Arc<dyn MemoryAllocator>> {
        reg.allocators
            .get(&kind)
            .or_else(|| match kind {
                DeviceKind::Shared => reg.allocators.get(&DeviceKind::Cpu),
                _ => None,
            })
            .cloned()
    }

    /// Allocate `size` bytes on `kind`, charging the device budget.
    pub fn allocate(&self, size: usize, kind: DeviceKind, usage: MemoryUsage) -> Result<Buffer> {
        let reg = self.inner.lock();
        let allocator = Self::resolve(&reg, kind).ok_or(EngineError::NoAllocator(kind))?;
        let charged = allocator.device();

        let Some(budget) = reg.budgets.get(&charged).cloned() else {
            return allocator.allocate(size, usage);
        };
        let remaining = budget.remaining();
        if size > remaining {
            return Err(EngineError::BudgetExceeded { device: charged, requested: size, remaining });
        }

        let buffer = allocator.allocate(size, usage)?;
        budget.used.fetch_add(size, Ordering::SeqCst);
        Ok(buffer.on_release(move || {
            budget.used.fetch_sub(size, Ordering::SeqCst);
        }))
    }

    pub fn gpu_context(&self) -> Option<GpuContext> {
        self.inner.lock().gpu.clone()
    }

    pub fn npu_context(&self) -> Option<NpuContext> {
        self.inner.lock().npu.clone()
    }

    pub fn is_active(&self, kind: DeviceKind) -> bool {
        self.inner.lock().active.contains(&kind)
    }

    /// Active compute kinds in CPU, GPU, NPU order.
    pub fn active_kinds(&self) -> Vec<DeviceKind> {
        self.inner.lock().active.clone()
    }

    /// Release contexts and allocators: GPU, then NPU, then CPU.
    ///
    /// Buffers still alive keep their device context until they drop. Safe
    /// to call repeatedly.
    pub fn shutdown(&self) {
        let mut reg = self.inner.lock();
        if reg.allocators.is_empty() && reg.active.is_empty() {
            return;
        }

        reg.allocators.remove(&DeviceKind::Gpu);
        if reg.gpu.take().is_some() {
            debug!("gpu context released");
        }
        reg.allocators.remove(&DeviceKind::Npu);
        if reg.npu.take().is_some() {
            debug!("npu context released");
        }
        reg.allocators.remove(&DeviceKind::Cpu);
        reg.allocators.clear();
        reg.active.clear();
        reg.budgets.clear();
        info!("platform backend shut down");
    }
}

impl std::fmt::Debug for PlatformBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reg = self.inner.lock();
        f.debug_struct("PlatformBackend")
            .field("active", &reg.active)
            .field("gpu", &reg.gpu.is_some())
            .field("npu", &reg.npu.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::CapabilitySnapshot;
    use crate::testing::CountingAllocator;
    use kestrel_core::ErrorKind;

    fn counting(kind: DeviceKind) -> (Arc<dyn MemoryAllocator>, Arc<crate::testing::AllocationCounters>) {
        let alloc = CountingAllocator::new(kind);
        let counters = alloc.counters();
        (Arc::new(alloc), counters)
    }

    #[test]
    fn test_initialize_cpu_only() {
        let mut dm = DeviceManager::new();
        let configs: Vec<_> = DeviceKind::COMPUTE.into_iter().map(DeviceConfig::new).collect();
        dm.initialize(&configs, &CapabilitySnapshot::cpu_only()).unwrap();

        let backend = PlatformBackend::initialize(&dm, &configs).unwrap();
        assert_eq!(backend.active_kinds(), vec![DeviceKind::Cpu]);
        assert!(backend.gpu_context().is_none());
        assert!(backend.npu_context().is_none());
        assert!(backend.allocator_for(DeviceKind::Cpu).is_some());
        assert!(backend.allocator_for(DeviceKind::Gpu).is_none());
    }

    #[test]
    fn test_routes_by_device() {
        let (gpu, gpu_counters) = counting(DeviceKind::Gpu);
        let (npu, npu_counters) = counting(DeviceKind::Npu);
        let backend = PlatformBackend::from_allocators([gpu, npu, Arc::new(CpuAllocator::new()) as _]);
        assert_eq!(backend.active_kinds(), vec![DeviceKind::Cpu, DeviceKind::Gpu, DeviceKind::Npu]);

        let g = backend.allocate(64, DeviceKind::Gpu, MemoryUsage::DeviceLocal).unwrap();
        let n = backend.allocate(64, DeviceKind::Npu, MemoryUsage::HostVisibleCoherent).unwrap();
        assert_eq!(g.device(), DeviceKind::Gpu);
        assert_eq!(n.device(), DeviceKind::Npu);
        assert_eq!(gpu_counters.live(), 1);
        assert_eq!(npu_counters.live(), 1);
        drop((g, n));
        assert_eq!(gpu_counters.live(), 0);
        assert_eq!(npu_counters.live(), 0);
    }

    #[test]
    fn test_shared_falls_back_to_cpu() {
        let backend = PlatformBackend::from_allocators([Arc::new(CpuAllocator::new()) as Arc<dyn MemoryAllocator>]);
        let buf = backend.allocate(16, DeviceKind::Shared, MemoryUsage::HostVisibleCoherent).unwrap();
        assert_eq!(buf.device(), DeviceKind::Cpu);
        assert!(!backend.is_active(DeviceKind::Shared));
    }

    #[test]
    fn test_missing_allocator() {
        let backend = PlatformBackend::from_allocators([Arc::new(CpuAllocator::new()) as Arc<dyn MemoryAllocator>]);
        let err = backend.allocate(16, DeviceKind::Npu, MemoryUsage::HostVisibleCoherent).unwrap_err();
        assert!(matches!(err, EngineError::NoAllocator(DeviceKind::Npu)));
        assert_eq!(err.kind(), ErrorKind::Allocation);
    }

    #[test]
    fn test_budget_enforced_and_credited() {
        let (gpu, _) = counting(DeviceKind::Gpu);
        let backend = PlatformBackend::from_allocators([gpu]);
        backend.set_budget(DeviceKind::Gpu, Some(100));

        let a = backend.allocate(60, DeviceKind::Gpu, MemoryUsage::DeviceLocal).unwrap();
        assert_eq!(backend.remaining_budget(DeviceKind::Gpu), Some(40));
        let err = backend.allocate(60, DeviceKind::Gpu, MemoryUsage::DeviceLocal).unwrap_err();
        match err {
            EngineError::BudgetExceeded { requested, remaining, .. } => {
                assert_eq!(requested, 60);
                assert_eq!(remaining, 40);
            }
            other => panic!("unexpected {other:?}"),
        }

        drop(a);
        assert_eq!(backend.remaining_budget(DeviceKind::Gpu), Some(100));
        backend.allocate(100, DeviceKind::Gpu, MemoryUsage::DeviceLocal).unwrap();
    }

    #[test]
    fn test_budget_from_config() {
        let mut dm = DeviceManager::new();
        let configs = [DeviceConfig::new(DeviceKind::Cpu).with_budget_mb(1)];
        dm.initialize(&configs, &CapabilitySnapshot::cpu_only()).unwrap();
        let backend = PlatformBackend::initialize(&dm, &configs).unwrap();
        assert_eq!(backend.remaining_budget(DeviceKind::Cpu), Some(1024 * 1024));
        assert!(backend.allocate(2 * 1024 * 1024, DeviceKind::Cpu, MemoryUsage::HostVisibleCoherent).is_err());
    }

    #[test]
    fn test_shutdown_idempotent_and_buffers_outlive_it() {
        let (cpu, counters) = counting(DeviceKind::Cpu);
        let backend = PlatformBackend::from_allocators([cpu]);
        let buf = backend.allocate(32, DeviceKind::Cpu, MemoryUsage::HostVisibleCoherent).unwrap();

        backend.shutdown();
        backend.shutdown();
        assert!(backend.active_kinds().is_empty());
        assert!(backend.allocator_for(DeviceKind::Cpu).is_none());

        assert_eq!(counters.live(), 1);
        drop(buf);
        assert_eq!(counters.live(), 0);
    }
}
