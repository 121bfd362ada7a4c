//! Host heap allocator.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use kestrel_core::constants::DEFAULT_MEMORY_ALIGNMENT;
use kestrel_core::{DeviceKind, EngineError, Result};

use crate::memory::{Buffer, MemoryAllocator, MemoryUsage, NativeHandle};

/// Aligned, zeroed host memory. Every usage class maps to the same heap.
#[derive(Debug, Clone)]
pub struct CpuAllocator {
    alignment: usize,
}

impl CpuAllocator {
    pub fn new() -> Self {
        Self { alignment: DEFAULT_MEMORY_ALIGNMENT }
    }

    /// Use a custom alignment (must be a power of two).
    pub fn with_alignment(alignment: usize) -> Self {
        Self { alignment }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

impl Default for CpuAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAllocator for CpuAllocator {
    fn device(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn allocate(&self, size: usize, _usage: MemoryUsage) -> Result<Buffer> {
        host_buffer(DeviceKind::Cpu, size, self.alignment)
    }
}

/// Allocate zeroed host memory and tag it with `device`.
pub(crate) fn host_buffer(device: DeviceKind, size: usize, alignment: usize) -> Result<Buffer> {
    if size == 0 {
        let release = Box::new(|_: &NativeHandle, _: Option<NonNull<u8>>, _: usize| {});
        return Ok(unsafe {
            Buffer::from_raw_parts(device, NativeHandle::Host, Some(NonNull::dangling()), 0, release)
        });
    }

    let layout = Layout::from_size_align(size, alignment).map_err(|e| EngineError::AllocationFailed {
        device,
        size,
        reason: e.to_string(),
    })?;
    let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| EngineError::AllocationFailed {
        device,
        size,
        reason: "host heap exhausted".into(),
    })?;

    let release = Box::new(move |_: &NativeHandle, mapped: Option<NonNull<u8>>, _: usize| {
        if let Some(p) = mapped {
            unsafe { dealloc(p.as_ptr(), layout) };
        }
    });
    Ok(unsafe { Buffer::from_raw_parts(device, NativeHandle::Host, Some(ptr), size, release) })
}
