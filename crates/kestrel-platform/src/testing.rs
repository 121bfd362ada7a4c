//! Host-backed allocator doubles that count allocate/release calls.
//!
//! Lets code above the platform layer exercise GPU/NPU placement on
//! machines without the drivers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kestrel_core::constants::DEFAULT_MEMORY_ALIGNMENT;
use kestrel_core::{DeviceKind, EngineError, Result};

use crate::cpu::host_buffer;
use crate::memory::{Buffer, MemoryAllocator, MemoryUsage};

/// Allocation counters shared between an allocator and its buffers.
#[derive(Debug, Default)]
pub struct AllocationCounters {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl AllocationCounters {
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Buffers handed out and not yet released.
    pub fn live(&self) -> usize {
        self.allocated() - self.released()
    }
}

/// Host memory reported as belonging to any device kind.
#[derive(Debug)]
pub struct CountingAllocator {
    device: DeviceKind,
    counters: Arc<AllocationCounters>,
    fail_after: Option<usize>,
}

impl CountingAllocator {
    pub fn new(device: DeviceKind) -> Self {
        Self { device, counters: Arc::default(), fail_after: None }
    }

    /// Fail every allocation after the first `n`.
    pub fn failing_after(device: DeviceKind, n: usize) -> Self {
        Self { device, counters: Arc::default(), fail_after: Some(n) }
    }

    pub fn counters(&self) -> Arc<AllocationCounters> {
        Arc::clone(&self.counters)
    }
}

impl MemoryAllocator for CountingAllocator {
    fn device(&self) -> DeviceKind {
        self.device
    }

    fn allocate(&self, size: usize, _usage: MemoryUsage) -> Result<Buffer> {
        if let Some(limit) = self.fail_after {
            if self.counters.allocated() >= limit {
                return Err(EngineError::AllocationFailed {
                    device: self.device,
                    size,
                    reason: "injected failure".into(),
                });
            }
        }
        let buffer = host_buffer(self.device, size, DEFAULT_MEMORY_ALIGNMENT)?;
        self.counters.allocated.fetch_add(1, Ordering::SeqCst);
        let counters = Arc::clone(&self.counters);
        Ok(buffer.on_release(move || {
            counters.released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_device() {
        for device in DeviceKind::COMPUTE {
            let alloc = CountingAllocator::new(device);
            let counters = alloc.counters();
            let a = alloc.allocate(32, MemoryUsage::DeviceLocal).unwrap();
            let b = alloc.allocate(32, MemoryUsage::HostVisibleCached).unwrap();
            assert_eq!(a.device(), device);
            assert_eq!(counters.live(), 2);
            drop(a);
            b.release();
            assert_eq!(counters.allocated(), 2);
            assert_eq!(counters.released(), 2);
        }
    }

    #[test]
    fn test_injected_failure() {
        let alloc = CountingAllocator::failing_after(DeviceKind::Npu, 1);
        let _first = alloc.allocate(8, MemoryUsage::HostVisibleCoherent).unwrap();
        assert!(alloc.allocate(8, MemoryUsage::HostVisibleCoherent).is_err());
        assert_eq!(alloc.counters().allocated(), 1);
    }
}
