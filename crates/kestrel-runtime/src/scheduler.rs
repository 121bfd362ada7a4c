//! Routes table entries to the executor of their declared device.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use kestrel_core::{DeviceKind, EngineError, Result};
use kestrel_platform::PlatformBackend;

use crate::executor::{CpuExecutor, GpuExecutor, LayerExecutor, NpuExecutor, Step};
use crate::kernels::KernelRegistry;
use crate::model::Model;
use crate::tensor::Tensor;

pub struct ExecutionScheduler {
    model: Arc<Model>,
    executors: HashMap<DeviceKind, Box<dyn LayerExecutor>>,
}

impl ExecutionScheduler {
    /// One executor per active compute device. GPU and NPU executors need
    /// the backend's driver context and are skipped without it.
    pub fn new(model: Arc<Model>, backend: &PlatformBackend, kernels: &KernelRegistry) -> Self {
        let mut executors: HashMap<DeviceKind, Box<dyn LayerExecutor>> = HashMap::new();
        for kind in backend.active_kinds() {
            match kind {
                DeviceKind::Cpu => {
                    executors.insert(kind, Box::new(CpuExecutor::new(kernels.clone())));
                }
                DeviceKind::Gpu => match backend.gpu_context() {
                    Some(ctx) => {
                        executors.insert(kind, Box::new(GpuExecutor::new(ctx, kernels)));
                    }
                    None => warn!("gpu active without a vulkan context, no gpu executor"),
                },
                DeviceKind::Npu => match backend.npu_context() {
                    Some(ctx) => {
                        executors.insert(kind, Box::new(NpuExecutor::new(ctx, kernels.clone())));
                    }
                    None => warn!("npu active without an nnapi context, no npu executor"),
                },
                DeviceKind::Shared => {}
            }
        }
        debug!(executors = ?executors.keys().collect::<Vec<_>>(), "scheduler built");
        Self { model, executors }
    }

    /// Scheduler over caller-supplied executors.
    pub fn with_executors(model: Arc<Model>, executors: Vec<Box<dyn LayerExecutor>>) -> Self {
        let executors = executors.into_iter().map(|e| (e.device(), e)).collect();
        Self { model, executors }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn has_executor(&self, kind: DeviceKind) -> bool {
        self.executors.contains_key(&kind)
    }

    /// Device that runs table entry `index`.
    pub fn device_of(&self, index: usize) -> Result<DeviceKind> {
        let table = &self.model.config().tensors;
        table
            .get(index)
            .map(|entry| entry.device)
            .ok_or(EngineError::LayerOutOfRange { index, len: table.len() })
    }

    /// Dispatch table entry `index` to its device's executor.
    pub fn execute_layer(
        &self,
        index: usize,
        inputs: &[&Tensor],
        outputs: &mut [&mut Tensor],
        step: &Step<'_>,
    ) -> Result<()> {
        let device = self.device_of(index)?;
        let executor = self.executors.get(&device).ok_or(EngineError::NoExecutor(device))?;
        executor.execute(inputs, outputs, step)
    }
}
