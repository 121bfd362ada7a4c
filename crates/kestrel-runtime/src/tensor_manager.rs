//! Sizes tensors and places them on the requested device.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use kestrel_core::{DType, DeviceKind, EngineError, Result, Shape, TensorLayout};
use kestrel_platform::{MemoryUsage, PlatformBackend};

use crate::tensor::Tensor;

pub struct TensorManager {
    backend: Arc<PlatformBackend>,
    create_lock: Mutex<()>,
}

impl TensorManager {
    pub fn new(backend: Arc<PlatformBackend>) -> Self {
        Self { backend, create_lock: Mutex::new(()) }
    }

    pub fn backend(&self) -> &Arc<PlatformBackend> {
        &self.backend
    }

    /// Allocate a tensor on `device`.
    ///
    /// `Cpu` and `Shared` resolve through the backend's host fallback; `Gpu`
    /// and `Npu` need their own allocator and never fall back.
    pub fn create_tensor(
        &self,
        name: &str,
        shape: Shape,
        dtype: DType,
        device: DeviceKind,
        layout: TensorLayout,
        usage: MemoryUsage,
    ) -> Result<Tensor> {
        let _guard = self.create_lock.lock();

        let numel = shape.numel();
        let size = dtype.storage_bytes(numel);
        if numel > 0 && size == 0 {
            return Err(EngineError::ZeroSized { name: name.to_string(), numel });
        }

        let buffer = self.backend.allocate(size, device, usage)?;
        debug!(tensor = name, %shape, %dtype, device = %buffer.device(), bytes = size, "tensor created");
        Ok(Tensor::from_buffer(name, shape, dtype, layout, buffer))
    }

    /// Host-visible dense F32 tensor on the CPU.
    pub fn create_host_f32(&self, name: &str, shape: Shape) -> Result<Tensor> {
        self.create_tensor(name, shape, DType::F32, DeviceKind::Cpu, TensorLayout::Dense, MemoryUsage::HostVisibleCoherent)
    }
}
