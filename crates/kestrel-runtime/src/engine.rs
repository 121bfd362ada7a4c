//! Top-level engine: owns every subsystem and sequences their lifecycle.
//!
//! ```text
//!  Uninitialized ──initialize──▶ Initialized ──load_model──▶ ModelLoaded
//!        │                          ▲   ▲                      │   ▲
//!        │ (failure)                │   └──────unload_model────┘   │ generate
//!        ▼                          │                              ▼   │
//!    ErrorState                     │                        InferenceActive
//!                                   │
//!  any non-terminal state ──shutdown──▶ Shutdown
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use kestrel_core::{DType, EngineError, Result};
use kestrel_platform::{CapabilitySnapshot, DeviceManager, HardwareProber, PlatformBackend};

use crate::config::EngineConfig;
use crate::format::ModelConfig;
use crate::kernels::{CpuKernel, GpuKernel, KernelRegistry, NpuKernel};
use crate::loader::ModelLoader;
use crate::pipeline::InferencePipeline;
use crate::tensor::Tensor;
use crate::tensor_manager::TensorManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    ModelLoaded,
    InferenceActive,
    Shutdown,
    ErrorState,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initialized => "initialized",
            EngineState::ModelLoaded => "model-loaded",
            EngineState::InferenceActive => "inference-active",
            EngineState::Shutdown => "shutdown",
            EngineState::ErrorState => "error",
        };
        write!(f, "{s}")
    }
}

/// Opaque conversation identifier. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationHandle {
    pub id: u64,
}

impl ConversationHandle {
    pub fn is_valid(&self) -> bool {
        self.id != 0
    }
}

pub struct Engine {
    state: EngineState,
    kernels: KernelRegistry,
    devices: DeviceManager,
    backend: Option<Arc<PlatformBackend>>,
    tensors: Option<Arc<TensorManager>>,
    loader: Option<ModelLoader>,
    pipeline: Option<Arc<InferencePipeline>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Uninitialized,
            kernels: KernelRegistry::new(),
            devices: DeviceManager::new(),
            backend: None,
            tensors: None,
            loader: None,
            pipeline: None,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Probe the hardware and bring up every subsystem.
    pub fn initialize(&mut self, config: EngineConfig) -> Result<()> {
        self.initialize_with_snapshot(config, HardwareProber::probe())
    }

    /// Like [`Engine::initialize`], against a given capability snapshot.
    ///
    /// On failure the engine lands in `ErrorState` with everything already
    /// built torn down.
    pub fn initialize_with_snapshot(&mut self, config: EngineConfig, snapshot: &CapabilitySnapshot) -> Result<()> {
        if self.state != EngineState::Uninitialized {
            return Err(EngineError::AlreadyInitialized { component: "engine" });
        }
        match self.bring_up(config, snapshot) {
            Ok(()) => {
                self.state = EngineState::Initialized;
                info!(devices = ?self.devices.active_kinds(), "engine initialized");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "engine initialization failed");
                self.teardown();
                self.state = EngineState::ErrorState;
                Err(e)
            }
        }
    }

    fn bring_up(&mut self, config: EngineConfig, snapshot: &CapabilitySnapshot) -> Result<()> {
        config.validate()?;
        self.devices.initialize(&config.devices, snapshot)?;
        let backend = Arc::new(PlatformBackend::initialize(&self.devices, &config.devices)?);
        self.backend = Some(Arc::clone(&backend));

        let tensors = Arc::new(TensorManager::new(backend));
        self.tensors = Some(Arc::clone(&tensors));
        self.loader = Some(ModelLoader::new(Arc::clone(&tensors)));
        self.pipeline = Some(Arc::new(InferencePipeline::with_kernels(tensors, config, self.kernels.clone())));
        Ok(())
    }

    /// Load a model file and prepare the pipeline for it.
    ///
    /// Returns `Ok(false)` if the file could not be loaded; the engine stays
    /// `Initialized` with no model. Calling outside `Initialized` is an error.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        self.require("load_model", &[EngineState::Initialized])?;
        let path = path.as_ref();
        let state = self.state;
        let (Some(loader), Some(pipeline)) = (self.loader.as_mut(), self.pipeline.as_ref()) else {
            return Err(EngineError::InvalidState { operation: "load_model", state: state.to_string() });
        };

        let model = match loader.load(path) {
            Ok(model) => model,
            Err(e) => {
                error!(path = %path.display(), kind = %e.kind(), error = %e, "model load failed");
                return Ok(false);
            }
        };
        if let Err(e) = pipeline.prepare(model) {
            error!(path = %path.display(), error = %e, "pipeline preparation failed");
            loader.unload();
            return Ok(false);
        }
        self.state = EngineState::ModelLoaded;
        Ok(true)
    }

    /// Release the pipeline and the model. No-op without a model.
    pub fn unload_model(&mut self) {
        if !matches!(self.state, EngineState::ModelLoaded | EngineState::InferenceActive) {
            return;
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.release();
        }
        if let Some(loader) = self.loader.as_mut() {
            loader.unload();
        }
        self.state = EngineState::Initialized;
    }

    /// Tear everything down in a fixed order. Safe to call repeatedly; also
    /// run on drop.
    pub fn shutdown(&mut self) {
        if self.state == EngineState::Shutdown {
            return;
        }
        self.unload_model();
        self.teardown();
        self.state = EngineState::Shutdown;
        info!("engine shut down");
    }

    fn teardown(&mut self) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.release();
        }
        if let Some(loader) = self.loader.as_mut() {
            loader.unload();
        }
        self.pipeline = None;
        self.loader = None;
        self.tensors = None;
        if let Some(backend) = self.backend.take() {
            backend.shutdown();
        }
        self.devices.shutdown();
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    pub fn start_new_conversation(&mut self) -> Result<ConversationHandle> {
        let pipeline = self.ready_pipeline("start_new_conversation")?;
        let id = pipeline.create_new_context()?;
        Ok(ConversationHandle { id })
    }

    /// Run prefill and decode for `tokens`. See [`InferencePipeline::execute`].
    pub fn generate(&mut self, handle: ConversationHandle, tokens: &[u32]) -> Result<Tensor> {
        let pipeline = self.ready_pipeline("generate")?;
        let prior = self.state;
        self.state = EngineState::InferenceActive;
        let result = pipeline.execute(handle.id, tokens);
        self.state = prior;
        result
    }

    /// Forget a conversation. Unknown handles and missing models are ignored.
    pub fn end_conversation(&mut self, handle: ConversationHandle) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.destroy_context(handle.id);
        }
    }

    // =========================================================================
    // Kernels
    // =========================================================================

    /// Takes effect at the next model load.
    pub fn register_cpu_kernel(&mut self, dtype: DType, kernel: Arc<dyn CpuKernel>) {
        self.kernels.register_cpu(dtype, Arc::clone(&kernel));
        if let Some(pipeline) = &self.pipeline {
            pipeline.register_cpu_kernel(dtype, kernel);
        }
    }

    pub fn register_gpu_kernel(&mut self, kernel: Arc<dyn GpuKernel>) {
        self.kernels.register_gpu(Arc::clone(&kernel));
        if let Some(pipeline) = &self.pipeline {
            pipeline.register_gpu_kernel(kernel);
        }
    }

    pub fn register_npu_kernel(&mut self, dtype: DType, kernel: Arc<dyn NpuKernel>) {
        self.kernels.register_npu(dtype, Arc::clone(&kernel));
        if let Some(pipeline) = &self.pipeline {
            pipeline.register_npu_kernel(dtype, kernel);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_model_loaded(&self) -> bool {
        self.loader.as_ref().is_some_and(ModelLoader::is_loaded)
    }

    pub fn model_config(&self) -> Option<ModelConfig> {
        let model = self.loader.as_ref()?.model()?;
        Some(model.config().clone())
    }

    /// Shared handle for hosts that generate from several threads.
    pub fn pipeline(&self) -> Option<Arc<InferencePipeline>> {
        self.pipeline.clone()
    }

    pub fn backend(&self) -> Option<Arc<PlatformBackend>> {
        self.backend.clone()
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn invalid(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidState { operation, state: self.state.to_string() }
    }

    fn require(&self, operation: &'static str, allowed: &[EngineState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn ready_pipeline(&self, operation: &'static str) -> Result<Arc<InferencePipeline>> {
        self.require(operation, &[EngineState::ModelLoaded, EngineState::InferenceActive])?;
        self.pipeline.clone().ok_or_else(|| self.invalid(operation))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.state != EngineState::Uninitialized {
            self.shutdown();
        }
    }
}
