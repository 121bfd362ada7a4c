//! NPU context: shared-memory allocator plus blocking graph execution.

use std::ptr;
use std::sync::Arc;

use tracing::{debug, info};

use kestrel_core::{EngineError, Result};

use super::ffi::*;
use super::graph::{positions, Binding, NpuGraph};
use super::memory::NpuAllocator;
use crate::probe::NpuCapabilities;

/// Process-side NNAPI state shared by the context and every NPU buffer.
pub(crate) struct NpuRuntime {
    pub(crate) api: &'static NnApi,
}

impl Drop for NpuRuntime {
    fn drop(&mut self) {
        info!("nnapi npu context shut down");
    }
}

#[derive(Clone)]
pub struct NpuContext {
    runtime: Arc<NpuRuntime>,
}

impl NpuContext {
    /// NNAPI compiles per graph; bringing up the context only needs the
    /// runtime libraries.
    pub fn new(caps: &NpuCapabilities) -> Result<Self> {
        let api = nnapi_api().ok_or(EngineError::DriverUnavailable { library: "libneuralnetworks.so" })?;
        info!(driver = caps.driver_version, tops = caps.tops, "nnapi npu context initialized");
        Ok(Self { runtime: Arc::new(NpuRuntime { api }) })
    }

    pub fn allocator(&self) -> NpuAllocator {
        NpuAllocator::new(Arc::clone(&self.runtime))
    }

    /// Build a graph with `build`, compile it for a fast single answer,
    /// execute it and block until the completion event fires.
    pub fn run(&self, build: impl FnOnce(&mut NpuGraph) -> Result<()>) -> Result<()> {
        let api = self.runtime.api;
        let mut graph = NpuGraph::new(api)?;
        build(&mut graph)?;
        graph.finish()?;

        let mut compilation: NnCompilation = ptr::null_mut();
        check_nn(
            unsafe { (api.compilation_create)(graph.model, &mut compilation) },
            "ANeuralNetworksCompilation_create",
        )?;
        let result = (|| -> Result<()> {
            check_nn(
                unsafe { (api.compilation_set_preference)(compilation, ANEURALNETWORKS_PREFER_FAST_SINGLE_ANSWER) },
                "ANeuralNetworksCompilation_setPreference",
            )?;
            check_nn(unsafe { (api.compilation_finish)(compilation) }, "ANeuralNetworksCompilation_finish")?;
            execute(api, compilation, &graph)
        })();
        unsafe { (api.compilation_free)(compilation) };

        debug!(operands = graph.operand_count(), ok = result.is_ok(), "npu graph executed");
        result
    }
}

fn execute(api: &NnApi, compilation: NnCompilation, graph: &NpuGraph) -> Result<()> {
    let mut execution: NnExecution = ptr::null_mut();
    check_nn(
        unsafe { (api.execution_create)(compilation, &mut execution) },
        "ANeuralNetworksExecution_create",
    )?;

    let result = (|| -> Result<()> {
        for (pos, binding) in positions(&graph.inputs) {
            let code = match *binding {
                Binding::Memory { memory, length } => unsafe {
                    (api.execution_set_input_from_memory)(execution, pos, ptr::null(), memory as NnMemory, 0, length)
                },
                Binding::Host { ptr: p, length } => unsafe {
                    (api.execution_set_input)(execution, pos, ptr::null(), p.as_ptr().cast(), length)
                },
            };
            check_nn(code, "ANeuralNetworksExecution_setInput")?;
        }
        for (pos, binding) in positions(&graph.outputs) {
            let code = match *binding {
                Binding::Memory { memory, length } => unsafe {
                    (api.execution_set_output_from_memory)(execution, pos, ptr::null(), memory as NnMemory, 0, length)
                },
                Binding::Host { ptr: p, length } => unsafe {
                    (api.execution_set_output)(execution, pos, ptr::null(), p.as_ptr().cast(), length)
                },
            };
            check_nn(code, "ANeuralNetworksExecution_setOutput")?;
        }

        let mut event: NnEvent = ptr::null_mut();
        check_nn(
            unsafe { (api.execution_start_compute)(execution, &mut event) },
            "ANeuralNetworksExecution_startCompute",
        )?;
        let waited = check_nn(unsafe { (api.event_wait)(event) }, "ANeuralNetworksEvent_wait");
        unsafe { (api.event_free)(event) };
        waited
    })();

    unsafe { (api.execution_free)(execution) };
    result
}
