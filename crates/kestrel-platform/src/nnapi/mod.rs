//! NPU backend over Android NNAPI.
//!
//! Memory comes from `ASharedMemory` so the accelerator driver can bind it
//! directly; layers run as one-shot compiled graphs.

pub mod context;
pub mod ffi;
pub mod graph;
pub mod memory;

pub use context::NpuContext;
pub use graph::{Binding, NpuGraph, Operand};
pub use memory::NpuAllocator;

/// Whether the NNAPI runtime could be opened.
pub fn is_nnapi_available() -> bool {
    ffi::nnapi_api().is_some()
}
