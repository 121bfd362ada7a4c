//! Pluggable numeric kernels.
//!
//! Executors own no math. They look up a kernel here and hand it the
//! layer's tensors; with nothing registered the dispatch is a no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kestrel_core::{DType, EngineError, Result};
use kestrel_platform::{CommandRecorder, NpuGraph};

use crate::executor::Step;
use crate::tensor::Tensor;

/// Host kernel for one weight dtype.
pub trait CpuKernel: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, inputs: &[&Tensor], outputs: &mut [&mut Tensor], step: &Step<'_>) -> Result<()>;
}

/// Records compute work into a Vulkan command buffer.
pub trait GpuKernel: Send + Sync {
    fn name(&self) -> &str;
    fn record(
        &self,
        recorder: &CommandRecorder,
        inputs: &[&Tensor],
        outputs: &mut [&mut Tensor],
        step: &Step<'_>,
    ) -> Result<()>;
}

/// Describes a layer as an NNAPI graph.
pub trait NpuKernel: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, graph: &mut NpuGraph, inputs: &[&Tensor], outputs: &mut [&mut Tensor], step: &Step<'_>) -> Result<()>;
}

/// Kernels available to the executors, copied in at scheduler construction.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    cpu: HashMap<DType, Arc<dyn CpuKernel>>,
    gpu: Option<Arc<dyn GpuKernel>>,
    npu: HashMap<DType, Arc<dyn NpuKernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_cpu(&mut self, dtype: DType, kernel: Arc<dyn CpuKernel>) {
        self.cpu.insert(dtype, kernel);
    }

    pub fn register_gpu(&mut self, kernel: Arc<dyn GpuKernel>) {
        self.gpu = Some(kernel);
    }

    pub fn register_npu(&mut self, dtype: DType, kernel: Arc<dyn NpuKernel>) {
        self.npu.insert(dtype, kernel);
    }

    pub fn cpu(&self, dtype: DType) -> Option<&Arc<dyn CpuKernel>> {
        self.cpu.get(&dtype)
    }

    pub fn gpu(&self) -> Option<&Arc<dyn GpuKernel>> {
        self.gpu.as_ref()
    }

    pub fn npu(&self, dtype: DType) -> Option<&Arc<dyn NpuKernel>> {
        self.npu.get(&dtype)
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("cpu", &self.cpu.keys().collect::<Vec<_>>())
            .field("gpu", &self.gpu.as_ref().map(|k| k.name().to_string()))
            .field("npu", &self.npu.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Dtype a layer dispatches on: that of its first input (the activation).
pub fn dispatch_dtype(inputs: &[&Tensor]) -> Option<DType> {
    inputs.first().map(|t| t.dtype())
}

// ---------------------------------------------------------------------------
// Reference CPU kernel
// ---------------------------------------------------------------------------

/// Row-major F32 matmul: `out[m, ..n] = act[m, ..k] × weight[k, n]`.
///
/// Activations and outputs may be wider than `k`/`n` (the pipeline's
/// workspace is sized for the widest layer); rows are strided by their own
/// width and the unused tail of each output row is zeroed. Weights that are
/// not 2-D F32 pass the activation through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatMulF32;

impl CpuKernel for MatMulF32 {
    fn name(&self) -> &str {
        "matmul_f32"
    }

    fn run(&self, inputs: &[&Tensor], outputs: &mut [&mut Tensor], _step: &Step<'_>) -> Result<()> {
        let [act, weight, ..] = inputs else {
            return Err(EngineError::Kernel("matmul_f32 needs an activation and a weight".into()));
        };
        let Some(out) = outputs.first_mut() else {
            return Err(EngineError::Kernel("matmul_f32 needs an output".into()));
        };
        let out: &mut Tensor = out;

        let (rows, act_width) = matrix_dims(act)?;
        let (out_rows, out_width) = matrix_dims(out)?;
        if out_rows < rows {
            return Err(EngineError::Kernel(format!("output has {out_rows} rows, activation has {rows}")));
        }
        let a = f32_view(act)?;

        let w_dims = weight.shape().dims();
        if w_dims.len() != 2 || weight.dtype() != DType::F32 {
            let copy = act_width.min(out_width);
            let o = f32_view_mut(out)?;
            for r in 0..rows {
                let dst = &mut o[r * out_width..(r + 1) * out_width];
                dst.fill(0.0);
                dst[..copy].copy_from_slice(&a[r * act_width..r * act_width + copy]);
            }
            return Ok(());
        }

        let (k, n) = (w_dims[0], w_dims[1]);
        if k > act_width || n > out_width {
            return Err(EngineError::Kernel(format!(
                "weight '{}' is [{k}, {n}], activation width {act_width}, output width {out_width}",
                weight.name()
            )));
        }
        let w = f32_view(weight)?;
        let o = f32_view_mut(out)?;
        for r in 0..rows {
            let a_row = &a[r * act_width..r * act_width + k];
            let o_row = &mut o[r * out_width..(r + 1) * out_width];
            o_row.fill(0.0);
            for (i, &av) in a_row.iter().enumerate() {
                if av == 0.0 {
                    continue;
                }
                let w_row = &w[i * n..(i + 1) * n];
                for (ov, &wv) in o_row[..n].iter_mut().zip(w_row) {
                    *ov += av * wv;
                }
            }
        }
        Ok(())
    }
}

/// (rows, row width) of a tensor seen as a matrix; 1-D is a single row.
fn matrix_dims(t: &Tensor) -> Result<(usize, usize)> {
    match t.shape().dims() {
        [n] => Ok((1, *n)),
        [rows, width] => Ok((*rows, *width)),
        dims => Err(EngineError::Kernel(format!("tensor '{}' is {}-D, expected a matrix", t.name(), dims.len()))),
    }
}

fn f32_view(t: &Tensor) -> Result<&[f32]> {
    t.as_f32()
        .ok_or_else(|| EngineError::Kernel(format!("tensor '{}' is not a host-visible f32 tensor", t.name())))
}

fn f32_view_mut(t: &mut Tensor) -> Result<&mut [f32]> {
    let name = t.name().to_string();
    t.as_f32_mut()
        .ok_or_else(|| EngineError::Kernel(format!("tensor '{name}' is not a host-visible f32 tensor")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Phase;
    use crate::tensor_manager::TensorManager;
    use kestrel_core::{ErrorKind, Shape};
    use kestrel_platform::{CpuAllocator, MemoryAllocator, PlatformBackend};

    fn tm() -> TensorManager {
        let backend = PlatformBackend::from_allocators([Arc::new(CpuAllocator::new()) as Arc<dyn MemoryAllocator>]);
        TensorManager::new(Arc::new(backend))
    }

    fn quantized(tm: &TensorManager, dims: &[usize]) -> Tensor {
        tm.create_tensor(
            "q",
            Shape::new(dims),
            DType::QInt8,
            kestrel_core::DeviceKind::Cpu,
            kestrel_core::TensorLayout::Dense,
            kestrel_platform::MemoryUsage::HostVisibleCoherent,
        )
        .unwrap()
    }

    fn filled(tm: &TensorManager, name: &str, dims: &[usize], data: &[f32]) -> Tensor {
        let mut t = tm.create_host_f32(name, Shape::new(dims)).unwrap();
        t.as_f32_mut().unwrap()[..data.len()].copy_from_slice(data);
        t
    }

    fn step() -> Step<'static> {
        Step { phase: Phase::Prefill, position: 0, tokens: &[1, 2], layer: None }
    }

    #[test]
    fn test_matmul_exact() {
        let tm = tm();
        // [2, 3] x [3, 2]
        let a = filled(&tm, "a", &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let w = filled(&tm, "w", &[3, 2], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let mut out = tm.create_host_f32("out", Shape::new(&[2, 2])).unwrap();
        MatMulF32.run(&[&a, &w], &mut [&mut out], &step()).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_strided_workspace() {
        let tm = tm();
        // activation rows are 4 wide, only the first 2 columns feed the weight
        let a = filled(&tm, "a", &[1, 4], &[1.0, 2.0, 99.0, 99.0]);
        let w = filled(&tm, "w", &[2, 1], &[3.0, 4.0]);
        let mut out = filled(&tm, "out", &[1, 4], &[5.0, 5.0, 5.0, 5.0]);
        MatMulF32.run(&[&a, &w], &mut [&mut out], &step()).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[11.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_non_matrix_weight_passes_through() {
        let tm = tm();
        let a = filled(&tm, "a", &[1, 3], &[1.0, 2.0, 3.0]);
        let norm = filled(&tm, "norm", &[3], &[0.5, 0.5, 0.5]);
        let mut out = tm.create_host_f32("out", Shape::new(&[1, 3])).unwrap();
        MatMulF32.run(&[&a, &norm], &mut [&mut out], &step()).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_matmul_shape_errors() {
        let tm = tm();
        let a = filled(&tm, "a", &[1, 2], &[1.0, 2.0]);
        let w = filled(&tm, "w", &[3, 2], &[0.0; 6]);
        let mut out = tm.create_host_f32("out", Shape::new(&[1, 2])).unwrap();
        let err = MatMulF32.run(&[&a, &w], &mut [&mut out], &step()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(MatMulF32.run(&[&a], &mut [&mut out], &step()).is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let mut reg = KernelRegistry::new();
        assert!(reg.cpu(DType::F32).is_none());
        reg.register_cpu(DType::F32, Arc::new(MatMulF32));
        assert_eq!(reg.cpu(DType::F32).unwrap().name(), "matmul_f32");
        assert!(reg.cpu(DType::F16).is_none());
        assert!(reg.gpu().is_none());
        assert!(reg.npu(DType::F32).is_none());
    }

    #[test]
    fn test_dispatch_dtype_follows_activation() {
        let tm = tm();
        let a = filled(&tm, "a", &[1], &[0.0]);
        let q = quantized(&tm, &[4]);
        assert_eq!(dispatch_dtype(&[&a, &q]), Some(DType::F32));
        assert_eq!(dispatch_dtype(&[&q, &a]), Some(DType::QInt8));
        assert_eq!(dispatch_dtype(&[&a]), Some(DType::F32));
        assert_eq!(dispatch_dtype(&[]), None);
    }

    #[test]
    fn test_matmul_passes_through_quantized_weight() {
        let tm = tm();
        let a = filled(&tm, "a", &[1, 2], &[3.0, 4.0]);
        let q = quantized(&tm, &[2, 2]);
        let mut out = tm.create_host_f32("out", Shape::new(&[1, 3])).unwrap();
        MatMulF32.run(&[&a, &q], &mut [&mut out], &step()).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[3.0, 4.0, 0.0]);
    }
}
