//! # kestrel-runtime
//!
//! Model loading and heterogeneous execution for the Kestrel runtime.
//!
//! ## Key Features
//! - Binary model format: fixed-size headers, execution plan and tensor table
//! - `ModelLoader`: streams each tensor straight into its declared device's memory
//! - `ExecutionScheduler`: dispatches table entries to CPU, GPU or NPU executors
//! - `InferencePipeline`: prefill + greedy decode over a per-conversation KV cache
//! - `Engine`: the lifecycle state machine that owns all of the above

pub mod config;
pub mod engine;
pub mod executor;
pub mod format;
pub mod kernels;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod tensor;
pub mod tensor_manager;

pub use config::{EngineConfig, GenerationConfig};
pub use engine::{ConversationHandle, Engine, EngineState};
pub use executor::{LayerExecutor, Phase, Step};
pub use format::{ExecutionPlan, HardwareHeader, ModelConfig, ModelFileBuilder, ModelHeader, TensorMetadata};
pub use kernels::{CpuKernel, GpuKernel, KernelRegistry, MatMulF32, NpuKernel};
pub use loader::ModelLoader;
pub use model::Model;
pub use pipeline::{ConversationState, Greedy, InferencePipeline, TokenSelector};
pub use scheduler::ExecutionScheduler;
pub use tensor::Tensor;
pub use tensor_manager::TensorManager;
