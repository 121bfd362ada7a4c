//! Builder for one-shot NNAPI graphs.
//!
//! A kernel describes its operation with operands and bindings; the context
//! then compiles, executes and waits on it (see `NpuContext::run`).

use std::ffi::c_void;
use std::ptr::NonNull;

use kestrel_core::{DType, EngineError, Result};

use super::ffi::*;
use crate::memory::{Buffer, NativeHandle};

/// Operand description: element type, dimensions and quantization.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub code: i32,
    pub dims: Vec<u32>,
    pub scale: f32,
    pub zero_point: i32,
}

impl Operand {
    pub fn tensor(code: i32, dims: &[usize]) -> Self {
        Self { code, dims: dims.iter().map(|&d| d as u32).collect(), scale: 0.0, zero_point: 0 }
    }

    /// Tensor operand for a runtime dtype; quantized types take `scale`.
    pub fn for_dtype(dtype: DType, dims: &[usize], scale: f32, zero_point: i32) -> Result<Self> {
        let code = match dtype {
            DType::F32 => ANEURALNETWORKS_TENSOR_FLOAT32,
            DType::F16 => ANEURALNETWORKS_TENSOR_FLOAT16,
            DType::U8 => ANEURALNETWORKS_TENSOR_QUANT8_ASYMM,
            DType::QInt8 | DType::I8 => ANEURALNETWORKS_TENSOR_QUANT8_SYMM,
            DType::QInt16 => ANEURALNETWORKS_TENSOR_QUANT16_SYMM,
            other => return Err(EngineError::Kernel(format!("{other} has no NNAPI operand type"))),
        };
        let mut op = Self::tensor(code, dims);
        if dtype.is_quantized() || matches!(dtype, DType::U8 | DType::I8) {
            op.scale = scale;
            op.zero_point = zero_point;
        }
        Ok(op)
    }

    pub fn scalar_i32() -> Self {
        Self { code: ANEURALNETWORKS_INT32, dims: Vec::new(), scale: 0.0, zero_point: 0 }
    }

    fn raw(&self) -> ANeuralNetworksOperandType {
        ANeuralNetworksOperandType {
            type_: self.code,
            dimension_count: self.dims.len() as u32,
            dimensions: if self.dims.is_empty() { std::ptr::null() } else { self.dims.as_ptr() },
            scale: self.scale,
            zero_point: self.zero_point,
        }
    }
}

/// Where an execution reads an input from or writes an output to.
#[derive(Debug, Clone, Copy)]
pub enum Binding {
    /// NNAPI memory object (NPU shared-memory buffers).
    Memory { memory: usize, length: usize },
    /// Host pointer (CPU buffers); valid for the duration of the run.
    Host { ptr: NonNull<u8>, length: usize },
}

impl Binding {
    /// Bind a buffer as an execution input.
    pub fn input(buffer: &Buffer) -> Result<Self> {
        Self::of(buffer)
    }

    /// Bind a buffer as an execution output.
    pub fn output(buffer: &mut Buffer) -> Result<Self> {
        Self::of(buffer)
    }

    fn of(buffer: &Buffer) -> Result<Self> {
        match (buffer.handle(), buffer.mapped_ptr()) {
            (NativeHandle::SharedMemory { memory, .. }, _) => {
                Ok(Binding::Memory { memory: *memory, length: buffer.size() })
            }
            (_, Some(ptr)) => Ok(Binding::Host { ptr, length: buffer.size() }),
            _ => Err(EngineError::Kernel(format!("{} buffer cannot be bound to the npu", buffer.device()))),
        }
    }
}

/// An NNAPI model under construction.
pub struct NpuGraph {
    api: &'static NnApi,
    pub(crate) model: NnModel,
    operands: Vec<Operand>,
    pub(crate) inputs: Vec<(u32, Binding)>,
    pub(crate) outputs: Vec<(u32, Binding)>,
}

impl NpuGraph {
    pub(crate) fn new(api: &'static NnApi) -> Result<Self> {
        let mut model: NnModel = std::ptr::null_mut();
        check_nn(unsafe { (api.model_create)(&mut model) }, "ANeuralNetworksModel_create")?;
        Ok(Self { api, model, operands: Vec::new(), inputs: Vec::new(), outputs: Vec::new() })
    }

    /// Add an operand, returning its index.
    pub fn add_operand(&mut self, operand: Operand) -> Result<u32> {
        let raw = operand.raw();
        check_nn(
            unsafe { (self.api.model_add_operand)(self.model, &raw) },
            "ANeuralNetworksModel_addOperand",
        )?;
        self.operands.push(operand);
        Ok(self.operands.len() as u32 - 1)
    }

    /// Add a constant INT32 scalar (activation codes and the like).
    pub fn add_scalar_i32(&mut self, value: i32) -> Result<u32> {
        let index = self.add_operand(Operand::scalar_i32())?;
        check_nn(
            unsafe {
                (self.api.model_set_operand_value)(
                    self.model,
                    index as i32,
                    (&value as *const i32).cast::<c_void>(),
                    std::mem::size_of::<i32>(),
                )
            },
            "ANeuralNetworksModel_setOperandValue",
        )?;
        Ok(index)
    }

    /// Make an operand a constant backed by an NPU buffer (weights).
    pub fn set_constant(&mut self, index: u32, buffer: &Buffer) -> Result<()> {
        let NativeHandle::SharedMemory { memory, .. } = *buffer.handle() else {
            return Err(EngineError::Kernel("npu constants must live in npu memory".into()));
        };
        check_nn(
            unsafe {
                (self.api.model_set_operand_value_from_memory)(
                    self.model,
                    index as i32,
                    memory as NnMemory,
                    0,
                    buffer.size(),
                )
            },
            "ANeuralNetworksModel_setOperandValueFromMemory",
        )
    }

    pub fn add_operation(&mut self, op: i32, inputs: &[u32], outputs: &[u32]) -> Result<()> {
        check_nn(
            unsafe {
                (self.api.model_add_operation)(
                    self.model,
                    op,
                    inputs.len() as u32,
                    inputs.as_ptr(),
                    outputs.len() as u32,
                    outputs.as_ptr(),
                )
            },
            "ANeuralNetworksModel_addOperation",
        )
    }

    /// Declare `index` a graph input fed from `binding`.
    pub fn bind_input(&mut self, index: u32, binding: Binding) {
        self.inputs.push((index, binding));
    }

    /// Declare `index` a graph output written to `binding`.
    pub fn bind_output(&mut self, index: u32, binding: Binding) {
        self.outputs.push((index, binding));
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub(crate) fn finish(&mut self) -> Result<()> {
        let inputs: Vec<u32> = self.inputs.iter().map(|(i, _)| *i).collect();
        let outputs: Vec<u32> = self.outputs.iter().map(|(i, _)| *i).collect();
        if outputs.is_empty() {
            return Err(EngineError::Kernel("npu graph has no outputs".into()));
        }
        check_nn(
            unsafe {
                (self.api.model_identify_inputs_and_outputs)(
                    self.model,
                    inputs.len() as u32,
                    inputs.as_ptr(),
                    outputs.len() as u32,
                    outputs.as_ptr(),
                )
            },
            "ANeuralNetworksModel_identifyInputsAndOutputs",
        )?;
        check_nn(unsafe { (self.api.model_finish)(self.model) }, "ANeuralNetworksModel_finish")
    }
}

impl Drop for NpuGraph {
    fn drop(&mut self) {
        unsafe { (self.api.model_free)(self.model) };
    }
}

/// Positional index of each bound operand within the graph's input/output list.
pub(crate) fn positions(bound: &[(u32, Binding)]) -> impl Iterator<Item = (i32, &Binding)> {
    bound.iter().enumerate().map(|(pos, (_, b))| (pos as i32, b))
}
