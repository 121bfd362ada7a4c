use std::fmt;

use half::{bf16, f16};

use kestrel_core::{DType, DeviceKind, EngineError, Result, Shape, TensorLayout};
use kestrel_platform::Buffer;

/// A named, shaped, typed view over one device buffer.
///
/// Identity (name, shape, dtype, layout) is fixed at creation; only the
/// buffer contents change. The tensor owns its buffer, so dropping the
/// tensor returns the memory to the allocator that produced it.
pub struct Tensor {
    name: String,
    shape: Shape,
    dtype: DType,
    layout: TensorLayout,
    buffer: Buffer,
}

impl Tensor {
    /// Wrap an already allocated buffer.
    pub fn from_buffer(name: impl Into<String>, shape: Shape, dtype: DType, layout: TensorLayout, buffer: Buffer) -> Self {
        Self { name: name.into(), shape, dtype, layout, buffer }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn device(&self) -> DeviceKind {
        self.buffer.device()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Bytes of the backing buffer.
    pub fn size_in_bytes(&self) -> usize {
        self.buffer.size()
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    pub fn is_host_visible(&self) -> bool {
        self.buffer.is_mapped()
    }

    // =========================================================================
    // Host access
    // =========================================================================

    /// Raw contents. Fails for buffers that are not host-mapped.
    pub fn data(&self) -> Result<&[u8]> {
        self.buffer.as_slice().ok_or_else(|| EngineError::Unmapped { name: self.name.clone() })
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match self.buffer.as_mut_slice() {
            Some(bytes) => Ok(bytes),
            None => Err(EngineError::Unmapped { name: self.name.clone() }),
        }
    }

    /// F32 view of the contents. `None` for other dtypes or unmapped buffers.
    pub fn as_f32(&self) -> Option<&[f32]> {
        if self.dtype != DType::F32 {
            return None;
        }
        bytemuck::try_cast_slice(self.buffer.as_slice()?).ok()
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        if self.dtype != DType::F32 {
            return None;
        }
        bytemuck::try_cast_slice_mut(self.buffer.as_mut_slice()?).ok()
    }

    /// Contents widened to f32. Supports F32, F16 and BF16.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        let bytes = self.buffer.as_slice()?;
        let n = self.numel();
        match self.dtype {
            DType::F32 => bytemuck::try_cast_slice::<u8, f32>(bytes).ok().map(|s| s[..n].to_vec()),
            DType::F16 => bytemuck::try_cast_slice::<u8, f16>(bytes)
                .ok()
                .map(|s| s[..n].iter().map(|v| v.to_f32()).collect()),
            DType::BF16 => bytemuck::try_cast_slice::<u8, bf16>(bytes)
                .ok()
                .map(|s| s[..n].iter().map(|v| v.to_f32()).collect()),
            _ => None,
        }
    }

    /// Zero the contents.
    pub fn fill_zero(&mut self) -> Result<()> {
        self.data_mut()?.fill(0);
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor({}, shape={}, dtype={}, device={}, layout={:?})",
            self.name,
            self.shape,
            self.dtype,
            self.device(),
            self.layout
        )
    }
}
