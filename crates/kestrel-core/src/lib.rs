//! # kestrel-core
//!
//! Shared vocabulary for the Kestrel on-device inference runtime.
//!
//! Provides:
//! - `DeviceKind`: the compute targets of the SoC (CPU, GPU, NPU, shared)
//! - `DType`: element types with the on-disk type codes of the model format
//! - `Shape` / `TensorLayout`: tensor geometry and placement tags
//! - `EngineError`: the one error type every crate surfaces
//! - `constants`: fixed facts about the target chip

pub mod constants;
pub mod device;
pub mod dtype;
pub mod error;
pub mod shape;

pub use device::DeviceKind;
pub use dtype::DType;
pub use error::{EngineError, ErrorKind};
pub use shape::{Shape, TensorLayout};

pub type Result<T> = std::result::Result<T, EngineError>;
