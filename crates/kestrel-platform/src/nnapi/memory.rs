//! Shared-memory allocation for the NPU.
//!
//! Each buffer is an `ASharedMemory` region, mapped into the process for
//! host access and wrapped in an `ANeuralNetworksMemory` so executions can
//! bind it without copies.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use kestrel_core::{DeviceKind, EngineError, Result};

use super::context::NpuRuntime;
use super::ffi::*;
use crate::memory::{Buffer, MemoryAllocator, MemoryUsage, NativeHandle};

pub struct NpuAllocator {
    runtime: Arc<NpuRuntime>,
}

impl NpuAllocator {
    pub(crate) fn new(runtime: Arc<NpuRuntime>) -> Self {
        Self { runtime }
    }
}

impl MemoryAllocator for NpuAllocator {
    fn device(&self) -> DeviceKind {
        DeviceKind::Npu
    }

    // Shared memory is always host-mapped; the usage class has no effect.
    fn allocate(&self, size: usize, _usage: MemoryUsage) -> Result<Buffer> {
        let api = self.runtime.api;
        let alloc_err = |reason: String| EngineError::AllocationFailed { device: DeviceKind::Npu, size, reason };
        let len = size.max(1);

        let fd = unsafe { (api.shared_memory_create)(ptr::null(), len) };
        if fd < 0 {
            return Err(alloc_err("ASharedMemory_create failed".into()));
        }

        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let addr = unsafe { libc::mmap(ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
        if addr == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(alloc_err("mmap of shared memory failed".into()));
        }

        let mut memory: NnMemory = ptr::null_mut();
        let code = unsafe { (api.memory_create_from_fd)(len, prot, fd, 0, &mut memory) };
        if code != ANEURALNETWORKS_NO_ERROR {
            unsafe {
                libc::munmap(addr, len);
                libc::close(fd);
            }
            return Err(alloc_err(format!("ANeuralNetworksMemory_createFromFd returned {code}")));
        }

        let owner = Arc::clone(&self.runtime);
        let release = Box::new(move |handle: &NativeHandle, mapped: Option<NonNull<u8>>, _: usize| {
            if let NativeHandle::SharedMemory { fd, memory } = *handle {
                unsafe {
                    (owner.api.memory_free)(memory as NnMemory);
                    if let Some(p) = mapped {
                        libc::munmap(p.as_ptr().cast(), len);
                    }
                    libc::close(fd);
                }
            }
        });

        tracing::trace!(size, fd, "npu shared memory allocated");
        Ok(unsafe {
            Buffer::from_raw_parts(
                DeviceKind::Npu,
                NativeHandle::SharedMemory { fd, memory: memory as usize },
                NonNull::new(addr.cast::<u8>()),
                size,
                release,
            )
        })
    }
}
