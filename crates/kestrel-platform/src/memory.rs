//! The allocation contract shared by every device backend.
//!
//! An allocator hands out [`Buffer`]s. Each buffer carries the release action
//! of the allocator that produced it and runs it exactly once, when the
//! buffer is dropped or explicitly released.

use std::fmt;
use std::ptr::NonNull;

use kestrel_core::{DeviceKind, Result};

/// How a buffer's memory will be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryUsage {
    /// Accelerator-only memory; no host mapping
    DeviceLocal,
    /// Host-mapped, writes visible without explicit flushes
    #[default]
    HostVisibleCoherent,
    /// Host-mapped, cached for host reads
    HostVisibleCached,
}

impl MemoryUsage {
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryUsage::DeviceLocal)
    }
}

/// Driver-level identity of a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHandle {
    /// Plain host heap memory; the mapped pointer is the allocation.
    Host,
    /// `VkBuffer` bound to a `VkDeviceMemory`.
    Vulkan { buffer: u64, memory: u64 },
    /// Shared-memory fd wrapped in an `ANeuralNetworksMemory`.
    SharedMemory { fd: i32, memory: usize },
    /// Backend-defined handle.
    Opaque(u64),
}

/// Action that returns a buffer's memory to its allocator.
pub type ReleaseFn = Box<dyn FnOnce(&NativeHandle, Option<NonNull<u8>>, usize) + Send + Sync>;

/// A block of device memory, exclusively owned.
pub struct Buffer {
    device: DeviceKind,
    handle: NativeHandle,
    mapped: Option<NonNull<u8>>,
    size: usize,
    release: Option<ReleaseFn>,
}

// The mapped pointer is uniquely owned by this buffer; access goes through
// &self / &mut self.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Assemble a buffer from an allocator's raw parts.
    ///
    /// # Safety
    /// When `mapped` is set it must point to at least `size` bytes that are
    /// readable and writable until `release` runs, and nothing else may
    /// access them while the buffer is alive.
    pub unsafe fn from_raw_parts(
        device: DeviceKind,
        handle: NativeHandle,
        mapped: Option<NonNull<u8>>,
        size: usize,
        release: ReleaseFn,
    ) -> Self {
        Self { device, handle, mapped, size, release: Some(release) }
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the memory is mapped into the host address space.
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Raw host pointer, if mapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Host view of the contents, if mapped.
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.mapped
            .map(|p| unsafe { std::slice::from_raw_parts(p.as_ptr(), self.size) })
    }

    /// Mutable host view of the contents, if mapped.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        self.mapped
            .map(|p| unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), self.size) })
    }

    /// Run `hook` after the allocator's own release action.
    pub fn on_release(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        if let Some(inner) = self.release.take() {
            self.release = Some(Box::new(move |handle, mapped, size| {
                inner(handle, mapped, size);
                hook();
            }));
        }
        self
    }

    /// Return the memory to its allocator now.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release(&self.handle, self.mapped.take(), self.size);
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("device", &self.device)
            .field("handle", &self.handle)
            .field("mapped", &self.mapped.is_some())
            .field("size", &self.size)
            .finish()
    }
}

/// One device's allocation backend.
pub trait MemoryAllocator: Send + Sync {
    /// Device kind whose memory this allocator hands out.
    fn device(&self) -> DeviceKind;

    /// Allocate `size` bytes. Failures are reported, never retried.
    fn allocate(&self, size: usize, usage: MemoryUsage) -> Result<Buffer>;
}
