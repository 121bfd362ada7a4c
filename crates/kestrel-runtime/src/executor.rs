//! Per-device layer executors.
//!
//! Every dispatch is synchronous: it returns once the device has finished.

use std::sync::Arc;

use tracing::trace;

use kestrel_core::{DeviceKind, Result};
use kestrel_platform::{GpuContext, NpuContext};

use crate::kernels::{dispatch_dtype, CpuKernel, GpuKernel, KernelRegistry, NpuKernel};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Whole prompt in one pass.
    Prefill,
    /// One generated position.
    Decode,
}

/// What a dispatch is computing.
#[derive(Debug, Clone, Copy)]
pub struct Step<'a> {
    pub phase: Phase,
    /// Sequence position of the first token in `tokens`.
    pub position: usize,
    pub tokens: &'a [u32],
    /// Transformer layer the dispatched entry belongs to.
    pub layer: Option<usize>,
}

/// Runs one table entry on a device.
pub trait LayerExecutor: Send + Sync {
    fn device(&self) -> DeviceKind;
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [&mut Tensor], step: &Step<'_>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// CPU
// ---------------------------------------------------------------------------

pub struct CpuExecutor {
    kernels: KernelRegistry,
}

impl CpuExecutor {
    pub fn new(kernels: KernelRegistry) -> Self {
        Self { kernels }
    }

    fn kernel_for(&self, inputs: &[&Tensor]) -> Option<&Arc<dyn CpuKernel>> {
        dispatch_dtype(inputs).and_then(|dtype| self.kernels.cpu(dtype))
    }
}

impl LayerExecutor for CpuExecutor {
    fn device(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn execute(&self, inputs: &[&Tensor], outputs: &mut [&mut Tensor], step: &Step<'_>) -> Result<()> {
        match self.kernel_for(inputs) {
            Some(kernel) => kernel.run(inputs, outputs, step),
            None => {
                trace!(dtype = ?dispatch_dtype(inputs), "no cpu kernel registered, skipping");
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GPU
// ---------------------------------------------------------------------------

pub struct GpuExecutor {
    context: GpuContext,
    kernel: Option<Arc<dyn GpuKernel>>,
}

impl GpuExecutor {
    pub fn new(context: GpuContext, kernels: &KernelRegistry) -> Self {
        Self { context, kernel: kernels.gpu().cloned() }
    }
}

impl LayerExecutor for GpuExecutor {
    fn device(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    /// Record into a fresh command buffer, submit with a fence and wait.
    /// Without a kernel the submission is empty.
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [&mut Tensor], step: &Step<'_>) -> Result<()> {
        let kernel = self.kernel.as_deref();
        if kernel.is_none() {
            trace!("no gpu kernel registered, submitting empty command buffer");
        }
        self.context.submit_and_wait(|recorder| match kernel {
            Some(k) => k.record(recorder, inputs, outputs, step),
            None => Ok(()),
        })
    }
}

// ---------------------------------------------------------------------------
// NPU
// ---------------------------------------------------------------------------

pub struct NpuExecutor {
    context: NpuContext,
    kernels: KernelRegistry,
}

impl NpuExecutor {
    pub fn new(context: NpuContext, kernels: KernelRegistry) -> Self {
        Self { context, kernels }
    }

    fn kernel_for(&self, inputs: &[&Tensor]) -> Option<&Arc<dyn NpuKernel>> {
        dispatch_dtype(inputs).and_then(|dtype| self.kernels.npu(dtype))
    }
}

impl LayerExecutor for NpuExecutor {
    fn device(&self) -> DeviceKind {
        DeviceKind::Npu
    }

    /// Build, compile (fast single answer), execute and wait on the event.
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [&mut Tensor], step: &Step<'_>) -> Result<()> {
        let Some(kernel) = self.kernel_for(inputs) else {
            trace!(dtype = ?dispatch_dtype(inputs), "no npu kernel registered, skipping");
            return Ok(());
        };
        self.context.run(|graph| kernel.build(graph, inputs, outputs, step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::MatMulF32;
    use crate::tensor_manager::TensorManager;
    use kestrel_core::{DType, EngineError, ErrorKind, Shape};
    use kestrel_platform::{CpuAllocator, MemoryAllocator, PlatformBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    impl CpuKernel for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&self, _: &[&Tensor], _: &mut [&mut Tensor], _: &Step<'_>) -> Result<()> {
            Err(EngineError::Kernel("boom".into()))
        }
    }

    #[derive(Default)]
    struct Recording {
        calls: AtomicUsize,
    }

    impl CpuKernel for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn run(&self, _: &[&Tensor], outputs: &mut [&mut Tensor], step: &Step<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(step.phase, Phase::Decode);
            assert_eq!(outputs.len(), 1);
            Ok(())
        }
    }

    fn tm() -> TensorManager {
        let backend = PlatformBackend::from_allocators([Arc::new(CpuAllocator::new()) as Arc<dyn MemoryAllocator>]);
        TensorManager::new(Arc::new(backend))
    }

    const STEP: Step<'static> = Step { phase: Phase::Decode, position: 3, tokens: &[7], layer: Some(0) };

    #[test]
    fn test_cpu_without_kernel_is_noop() {
        let tm = tm();
        let a = tm.create_host_f32("a", Shape::new(&[1, 2])).unwrap();
        let mut out = tm.create_host_f32("out", Shape::new(&[1, 2])).unwrap();
        let exec = CpuExecutor::new(KernelRegistry::new());
        assert_eq!(exec.device(), DeviceKind::Cpu);
        exec.execute(&[&a, &a], &mut [&mut out], &STEP).unwrap();
    }

    #[test]
    fn test_cpu_dispatches_by_dtype() {
        let tm = tm();
        let a = tm.create_host_f32("a", Shape::new(&[1, 2])).unwrap();
        let mut out = tm.create_host_f32("out", Shape::new(&[1, 2])).unwrap();

        let recording = Arc::new(Recording::default());
        let mut reg = KernelRegistry::new();
        reg.register_cpu(DType::F32, recording.clone());
        reg.register_cpu(DType::F16, Arc::new(Failing));
        CpuExecutor::new(reg).execute(&[&a, &a], &mut [&mut out], &STEP).unwrap();
        assert_eq!(recording.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kernel_failure_surfaces() {
        let tm = tm();
        let a = tm.create_host_f32("a", Shape::new(&[1, 2])).unwrap();
        let mut out = tm.create_host_f32("out", Shape::new(&[1, 2])).unwrap();
        let mut reg = KernelRegistry::new();
        reg.register_cpu(DType::F32, Arc::new(Failing));
        let err = CpuExecutor::new(reg).execute(&[&a, &a], &mut [&mut out], &STEP).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_cpu_runs_reference_matmul() {
        let tm = tm();
        let mut a = tm.create_host_f32("a", Shape::new(&[1, 2])).unwrap();
        a.as_f32_mut().unwrap().copy_from_slice(&[1.0, 1.0]);
        let mut w = tm.create_host_f32("w", Shape::new(&[2, 2])).unwrap();
        w.as_f32_mut().unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = tm.create_host_f32("out", Shape::new(&[1, 2])).unwrap();

        let mut reg = KernelRegistry::new();
        reg.register_cpu(DType::F32, Arc::new(MatMulF32));
        CpuExecutor::new(reg).execute(&[&a, &w], &mut [&mut out], &STEP).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[4.0, 6.0]);
    }
}
