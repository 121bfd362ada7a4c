//! Prefill/decode driver and the per-conversation KV cache.
//!
//! A pipeline is prepared against one loaded model. Each conversation owns
//! one key/value tensor pair per transformer layer and a count of the
//! positions already pushed through. Executes on different conversations
//! run in parallel; executes on the same conversation serialize on its lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use kestrel_core::{DType, DeviceKind, EngineError, Result, Shape, TensorLayout};
use kestrel_platform::MemoryUsage;

use crate::config::EngineConfig;
use crate::executor::{Phase, Step};
use crate::kernels::{CpuKernel, GpuKernel, KernelRegistry, NpuKernel};
use crate::model::Model;
use crate::scheduler::ExecutionScheduler;
use crate::tensor::Tensor;
use crate::tensor_manager::TensorManager;

// ---------------------------------------------------------------------------
// Token selection
// ---------------------------------------------------------------------------

/// Picks the next token from one row of logits.
pub trait TokenSelector: Send + Sync {
    fn select(&self, logits: &[f32]) -> u32;
}

/// Argmax; the first maximum wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct Greedy;

impl TokenSelector for Greedy {
    fn select(&self, logits: &[f32]) -> u32 {
        let mut best_idx = 0u32;
        let mut best_val = f32::NEG_INFINITY;
        for (i, &v) in logits.iter().enumerate() {
            if v > best_val {
                best_val = v;
                best_idx = i as u32;
            }
        }
        best_idx
    }
}

// ---------------------------------------------------------------------------
// Conversation state
// ---------------------------------------------------------------------------

/// KV cache and progress of one conversation.
pub struct ConversationState {
    id: u64,
    /// `(k_cache_l, v_cache_l)` for every layer `l`.
    kv: Vec<(Tensor, Tensor)>,
    processed: usize,
    generated: Vec<u32>,
}

impl ConversationState {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Positions already pushed through the model.
    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Every token chosen so far, across `execute` calls.
    pub fn generated(&self) -> &[u32] {
        &self.generated
    }

    pub fn kv_pairs(&self) -> &[(Tensor, Tensor)] {
        &self.kv
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct Prepared {
    model: Arc<Model>,
    scheduler: Arc<ExecutionScheduler>,
}

pub struct InferencePipeline {
    tensors: Arc<TensorManager>,
    config: EngineConfig,
    kernels: Mutex<KernelRegistry>,
    selector: RwLock<Arc<dyn TokenSelector>>,
    prepared: RwLock<Option<Prepared>>,
    contexts: Mutex<HashMap<u64, Arc<Mutex<ConversationState>>>>,
    next_id: AtomicU64,
}

impl InferencePipeline {
    pub fn new(tensors: Arc<TensorManager>, config: EngineConfig) -> Self {
        Self::with_kernels(tensors, config, KernelRegistry::new())
    }

    pub fn with_kernels(tensors: Arc<TensorManager>, config: EngineConfig, kernels: KernelRegistry) -> Self {
        Self {
            tensors,
            config,
            kernels: Mutex::new(kernels),
            selector: RwLock::new(Arc::new(Greedy)),
            prepared: RwLock::new(None),
            contexts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    // =========================================================================
    // Kernels and selection
    // =========================================================================

    pub fn register_cpu_kernel(&self, dtype: DType, kernel: Arc<dyn CpuKernel>) {
        self.kernels.lock().register_cpu(dtype, kernel);
    }

    pub fn register_gpu_kernel(&self, kernel: Arc<dyn GpuKernel>) {
        self.kernels.lock().register_gpu(kernel);
    }

    pub fn register_npu_kernel(&self, dtype: DType, kernel: Arc<dyn NpuKernel>) {
        self.kernels.lock().register_npu(dtype, kernel);
    }

    pub fn set_token_selector(&self, selector: Arc<dyn TokenSelector>) {
        *self.selector.write() = selector;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bind to `model` and build the scheduler from the registered kernels.
    pub fn prepare(&self, model: Arc<Model>) -> Result<()> {
        let mut prepared = self.prepared.write();
        if prepared.is_some() {
            return Err(EngineError::AlreadyPrepared);
        }
        let scheduler = {
            let kernels = self.kernels.lock();
            ExecutionScheduler::new(Arc::clone(&model), self.tensors.backend(), &kernels)
        };
        info!(entries = model.len(), layers = model.config().header.layer_count, "pipeline prepared");
        *prepared = Some(Prepared { model, scheduler: Arc::new(scheduler) });
        Ok(())
    }

    /// Drop every conversation, the scheduler and the model reference.
    pub fn release(&self) {
        let dropped = {
            let mut contexts = self.contexts.lock();
            let n = contexts.len();
            contexts.clear();
            n
        };
        if self.prepared.write().take().is_some() {
            info!(conversations = dropped, "pipeline released");
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.read().is_some()
    }

    pub fn model(&self) -> Option<Arc<Model>> {
        self.prepared.read().as_ref().map(|p| Arc::clone(&p.model))
    }

    fn bound(&self) -> Result<(Arc<Model>, Arc<ExecutionScheduler>)> {
        self.prepared
            .read()
            .as_ref()
            .map(|p| (Arc::clone(&p.model), Arc::clone(&p.scheduler)))
            .ok_or(EngineError::NotPrepared)
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    /// Allocate a KV cache for a new conversation and return its handle.
    pub fn create_new_context(&self) -> Result<u64> {
        let (model, _) = self.bound()?;
        let mut contexts = self.contexts.lock();
        let limit = self.config.max_concurrent_conversations;
        if contexts.len() >= limit {
            return Err(EngineError::ConversationLimit { limit });
        }

        let header = &model.config().header;
        let shape = Shape::new(&[1, header.seq_len as usize, header.kv_heads as usize, header.head_size as usize]);
        let (device, usage, layout) = if self.tensors.backend().is_active(DeviceKind::Gpu) {
            (DeviceKind::Gpu, MemoryUsage::DeviceLocal, TensorLayout::OptimizedGpu)
        } else {
            (DeviceKind::Cpu, MemoryUsage::HostVisibleCoherent, TensorLayout::Dense)
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut kv = Vec::with_capacity(header.layer_count as usize);
        for layer in 0..header.layer_count {
            let k = self.kv_tensor(&format!("k_cache_{layer}"), &shape, device, layout, usage)?;
            let v = self.kv_tensor(&format!("v_cache_{layer}"), &shape, device, layout, usage)?;
            kv.push((k, v));
        }

        debug!(conversation = id, layers = kv.len(), device = %device, "conversation created");
        contexts.insert(id, Arc::new(Mutex::new(ConversationState { id, kv, processed: 0, generated: Vec::new() })));
        Ok(id)
    }

    fn kv_tensor(
        &self,
        name: &str,
        shape: &Shape,
        device: DeviceKind,
        layout: TensorLayout,
        usage: MemoryUsage,
    ) -> Result<Tensor> {
        let mut tensor = self.tensors.create_tensor(name, shape.clone(), DType::F16, device, layout, usage)?;
        if tensor.is_host_visible() {
            tensor.fill_zero()?;
        }
        Ok(tensor)
    }

    /// Forget a conversation. Unknown handles are ignored.
    pub fn destroy_context(&self, handle: u64) {
        if self.contexts.lock().remove(&handle).is_some() {
            debug!(conversation = handle, "conversation destroyed");
        }
    }

    pub fn context(&self, handle: u64) -> Option<Arc<Mutex<ConversationState>>> {
        self.contexts.lock().get(&handle).cloned()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Prefill `tokens`, then decode greedily until the end token, the
    /// sequence limit or the token budget.
    ///
    /// Returns `generated_logits`, `[steps, vocab_size]`: row `r` holds the
    /// logits that chose generated token `r`.
    pub fn execute(&self, handle: u64, tokens: &[u32]) -> Result<Tensor> {
        let (model, scheduler) = self.bound()?;
        let context = self.context(handle).ok_or(EngineError::UnknownConversation(handle))?;
        if tokens.is_empty() {
            return Err(EngineError::EmptyInput);
        }

        let mut guard = context.lock();
        let state = &mut *guard;
        let header = &model.config().header;
        let seq_len = header.seq_len as usize;
        let vocab = header.vocab_size as usize;
        if state.processed + tokens.len() > seq_len {
            return Err(EngineError::ContextOverflow {
                handle,
                requested: state.processed + tokens.len(),
                capacity: seq_len,
            });
        }
        let width = (header.hidden_size.max(header.intermediate_size).max(header.vocab_size) as usize).max(1);

        let started = Instant::now();
        let step = Step { phase: Phase::Prefill, position: state.processed, tokens, layer: None };
        let mut act = self.run_pass(&model, &scheduler, &mut state.kv, tokens.len(), width, step)?;
        state.processed += tokens.len();

        let selector = Arc::clone(&*self.selector.read());
        let max_new = self.config.generation.max_new_tokens;
        let eos = self.config.generation.eos_token;
        // at most one row per free cache position, plus the row chosen after the last
        let rows = max_new.min(seq_len - state.processed + 1);
        let mut logits: Vec<f32> = Vec::with_capacity(rows.saturating_mul(vocab));
        let mut steps = 0usize;
        loop {
            let row = last_row(&act, width, vocab)?;
            let token = selector.select(row);
            logits.extend_from_slice(row);
            state.generated.push(token);
            steps += 1;

            if eos == Some(token) || steps >= max_new || state.processed >= seq_len {
                break;
            }
            let next = [token];
            let step = Step { phase: Phase::Decode, position: state.processed, tokens: &next, layer: None };
            act = self.run_pass(&model, &scheduler, &mut state.kv, 1, width, step)?;
            state.processed += 1;
        }

        let mut out = self.tensors.create_host_f32("generated_logits", Shape::new(&[steps, vocab]))?;
        out.data_mut()?.copy_from_slice(bytemuck::cast_slice(&logits[..]));

        if self.config.enable_profiling {
            debug!(
                conversation = handle,
                prompt = tokens.len(),
                steps,
                elapsed_ms = started.elapsed().as_secs_f64() * 1e3,
                "generation finished"
            );
        }
        Ok(out)
    }

    /// Push `rows` positions through every table entry in order. Returns the
    /// activation holding the last entry's output.
    fn run_pass(
        &self,
        model: &Model,
        scheduler: &ExecutionScheduler,
        kv: &mut [(Tensor, Tensor)],
        rows: usize,
        width: usize,
        step: Step<'_>,
    ) -> Result<Tensor> {
        let shape = Shape::new(&[rows, width]);
        let mut input = self.tensors.create_host_f32("activation_a", shape.clone())?;
        let mut output = self.tensors.create_host_f32("activation_b", shape)?;
        input.fill_zero()?;
        output.fill_zero()?;

        for index in 0..model.len() {
            let (meta, weight) = model.entry(index).ok_or(EngineError::LayerOutOfRange { index, len: model.len() })?;
            let layer = model.layer_of(index);
            let step = Step { layer, ..step };
            let inputs = [&input, weight];
            let started = self.config.enable_profiling.then(Instant::now);

            match layer.and_then(|l| kv.get_mut(l)) {
                Some((k, v)) => scheduler.execute_layer(index, &inputs, &mut [&mut output, k, v], &step)?,
                None => scheduler.execute_layer(index, &inputs, &mut [&mut output], &step)?,
            }

            if let Some(started) = started {
                debug!(
                    entry = index,
                    tensor = %meta.name,
                    device = %meta.device,
                    phase = ?step.phase,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "dispatch"
                );
            }
            std::mem::swap(&mut input, &mut output);
        }
        Ok(input)
    }
}

/// First `vocab` values of the last row of a `[rows, width]` activation.
fn last_row(act: &Tensor, width: usize, vocab: usize) -> Result<&[f32]> {
    let data = act.as_f32().ok_or_else(|| EngineError::Unmapped { name: act.name().to_string() })?;
    let rows = data.len() / width;
    let start = rows.saturating_sub(1) * width;
    Ok(&data[start..start + vocab.min(width)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationConfig;
    use crate::format::{ModelFileBuilder, ModelHeader};
    use crate::loader::ModelLoader;
    use kestrel_core::ErrorKind;
    use kestrel_platform::testing::CountingAllocator;
    use kestrel_platform::{CpuAllocator, MemoryAllocator, PlatformBackend};

    const VOCAB: usize = 8;

    /// Writes a one-hot row whose hot index is the next sequence position,
    /// so greedy selection yields `position + rows` mod vocab. Also marks
    /// the first KV element of the dispatched layer.
    #[derive(Default)]
    struct Scripted {
        dispatches: Mutex<Vec<(Phase, usize, Option<usize>, usize)>>,
    }

    impl CpuKernel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn run(&self, inputs: &[&Tensor], outputs: &mut [&mut Tensor], step: &Step<'_>) -> Result<()> {
            self.dispatches.lock().push((step.phase, step.position, step.layer, outputs.len()));
            let rows = inputs[0].shape().dims()[0];
            let width = inputs[0].shape().dims()[1];
            let hot = (step.position + step.tokens.len()) % VOCAB;
            let out = outputs[0].as_f32_mut().unwrap();
            out.fill(0.0);
            out[(rows - 1) * width + hot] = 1.0;
            if let Some(k) = outputs.get_mut(1) {
                k.data_mut()?[0] = 0xAB;
            }
            Ok(())
        }
    }

    fn header() -> ModelHeader {
        ModelHeader {
            layer_count: 2,
            vocab_size: VOCAB as u32,
            hidden_size: 4,
            seq_len: 16,
            kv_heads: 1,
            head_size: 4,
            ..ModelHeader::default()
        }
    }

    fn backend(gpu: bool) -> Arc<PlatformBackend> {
        let mut allocators: Vec<Arc<dyn MemoryAllocator>> = vec![Arc::new(CpuAllocator::new())];
        if gpu {
            allocators.push(Arc::new(CountingAllocator::new(DeviceKind::Gpu)));
        }
        Arc::new(PlatformBackend::from_allocators(allocators))
    }

    fn loaded(backend: Arc<PlatformBackend>) -> (tempfile::TempDir, Arc<TensorManager>, Arc<Model>) {
        let mut b = ModelFileBuilder::new(header());
        b.add_f32("embed", DeviceKind::Cpu, &[VOCAB, 4], &[0.0; VOCAB * 4]).unwrap();
        b.add_f32("layers.0.wq", DeviceKind::Cpu, &[4, 4], &[0.0; 16]).unwrap();
        b.add_f32("layers.1.wq", DeviceKind::Cpu, &[4, 4], &[0.0; 16]).unwrap();
        b.add_f32("lm_head", DeviceKind::Cpu, &[4, VOCAB], &[0.0; 4 * VOCAB]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.t760");
        b.write_to(&path).unwrap();

        let tm = Arc::new(TensorManager::new(backend));
        let model = ModelLoader::new(Arc::clone(&tm)).load(&path).unwrap();
        (dir, tm, model)
    }

    fn pipeline(config: EngineConfig) -> (tempfile::TempDir, InferencePipeline, Arc<Scripted>) {
        let (dir, tm, model) = loaded(backend(false));
        let pipeline = InferencePipeline::new(tm, config);
        let kernel = Arc::new(Scripted::default());
        pipeline.register_cpu_kernel(DType::F32, kernel.clone());
        pipeline.prepare(model).unwrap();
        (dir, pipeline, kernel)
    }

    fn config(max_new_tokens: usize, eos_token: Option<u32>) -> EngineConfig {
        EngineConfig { generation: GenerationConfig { max_new_tokens, eos_token }, ..EngineConfig::cpu_only() }
    }

    #[test]
    fn test_greedy_argmax() {
        assert_eq!(Greedy.select(&[1.0, 3.0, 2.0]), 1);
        assert_eq!(Greedy.select(&[-1.0, -2.0, -0.5]), 2);
        assert_eq!(Greedy.select(&[2.0, 2.0]), 0);
        assert_eq!(Greedy.select(&[]), 0);
    }

    #[test]
    fn test_prepare_twice_and_release() {
        let (_dir, p, _) = pipeline(EngineConfig::cpu_only());
        let model = p.model().unwrap();
        let err = p.prepare(model).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyPrepared));
        assert_eq!(err.kind(), ErrorKind::State);

        p.create_new_context().unwrap();
        p.release();
        p.release();
        assert!(!p.is_prepared());
        assert_eq!(p.context_count(), 0);
        assert!(matches!(p.create_new_context(), Err(EngineError::NotPrepared)));
    }

    #[test]
    fn test_kv_cache_per_layer() {
        let (_dir, p, _) = pipeline(EngineConfig::cpu_only());
        let handle = p.create_new_context().unwrap();
        assert_eq!(handle, 1);
        let ctx = p.context(handle).unwrap();
        let state = ctx.lock();
        assert_eq!(state.kv_pairs().len(), 2);
        for (i, (k, v)) in state.kv_pairs().iter().enumerate() {
            assert_eq!(k.name(), format!("k_cache_{i}"));
            assert_eq!(v.name(), format!("v_cache_{i}"));
            assert_eq!(k.shape().dims(), &[1, 16, 1, 4]);
            assert_eq!(k.dtype(), DType::F16);
            assert_eq!(k.device(), DeviceKind::Cpu);
            assert_eq!(k.numel(), 16 * 4);
        }
    }

    #[test]
    fn test_kv_cache_on_gpu_when_active() {
        let (_dir, tm, model) = loaded(backend(true));
        let p = InferencePipeline::new(tm, EngineConfig::default());
        p.prepare(model).unwrap();
        let handle = p.create_new_context().unwrap();
        let ctx = p.context(handle).unwrap();
        let state = ctx.lock();
        let (k, v) = &state.kv_pairs()[0];
        assert_eq!(k.device(), DeviceKind::Gpu);
        assert_eq!(v.layout(), TensorLayout::OptimizedGpu);
    }

    #[test]
    fn test_handles_are_never_reused() {
        let (_dir, p, _) = pipeline(EngineConfig::cpu_only());
        let a = p.create_new_context().unwrap();
        p.destroy_context(a);
        let b = p.create_new_context().unwrap();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_destroy_unknown_is_noop() {
        let (_dir, p, _) = pipeline(EngineConfig::cpu_only());
        let a = p.create_new_context().unwrap();
        p.destroy_context(999);
        assert_eq!(p.context_count(), 1);
        assert!(p.context(a).is_some());
    }

    #[test]
    fn test_conversation_limit() {
        let cfg = EngineConfig { max_concurrent_conversations: 2, ..EngineConfig::cpu_only() };
        let (_dir, p, _) = pipeline(cfg);
        let a = p.create_new_context().unwrap();
        p.create_new_context().unwrap();
        let err = p.create_new_context().unwrap_err();
        assert!(matches!(err, EngineError::ConversationLimit { limit: 2 }));
        assert_eq!(err.kind(), ErrorKind::State);

        p.destroy_context(a);
        p.create_new_context().unwrap();
    }

    #[test]
    fn test_execute_errors() {
        let (_dir, p, _) = pipeline(EngineConfig::cpu_only());
        let err = p.execute(42, &[1]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownConversation(42)));
        assert_eq!(err.kind(), ErrorKind::Lookup);

        let h = p.create_new_context().unwrap();
        assert!(matches!(p.execute(h, &[]), Err(EngineError::EmptyInput)));
        let err = p.execute(h, &[0; 17]).unwrap_err();
        assert!(matches!(err, EngineError::ContextOverflow { requested: 17, capacity: 16, .. }));
    }

    #[test]
    fn test_prefill_then_decode_to_budget() {
        let (_dir, p, kernel) = pipeline(config(3, None));
        let h = p.create_new_context().unwrap();
        let logits = p.execute(h, &[5, 6]).unwrap();

        assert_eq!(logits.name(), "generated_logits");
        assert_eq!(logits.shape().dims(), &[3, VOCAB]);
        assert_eq!(logits.device(), DeviceKind::Cpu);
        let rows = logits.as_f32().unwrap();
        // prefill covered positions 0..2, so the first pick is 2
        assert_eq!(rows[2], 1.0);
        assert_eq!(rows[VOCAB + 3], 1.0);

        let ctx = p.context(h).unwrap();
        let state = ctx.lock();
        assert_eq!(state.generated(), &[2, 3, 4]);
        // two prompt positions plus two decoded ones; the last pick is not pushed
        assert_eq!(state.processed(), 4);
        assert_eq!(state.kv_pairs()[0].0.data().unwrap()[0], 0xAB);

        let d = kernel.dispatches.lock();
        assert_eq!(d.len(), 4 * 3);
        assert_eq!(d[0], (Phase::Prefill, 0, None, 1));
        assert_eq!(d[1], (Phase::Prefill, 0, Some(0), 3));
        assert_eq!(d[2], (Phase::Prefill, 0, Some(1), 3));
        assert_eq!(d[3], (Phase::Prefill, 0, None, 1));
        assert_eq!(d[4], (Phase::Decode, 2, None, 1));
        assert_eq!(d[8], (Phase::Decode, 3, None, 1));
    }

    #[test]
    fn test_decode_stops_on_eos() {
        let (_dir, p, _) = pipeline(config(10, Some(3)));
        let h = p.create_new_context().unwrap();
        let logits = p.execute(h, &[1]).unwrap();
        assert_eq!(logits.shape().dims(), &[3, VOCAB]);
        assert_eq!(p.context(h).unwrap().lock().generated(), &[1, 2, 3]);
    }

    #[test]
    fn test_decode_stops_at_sequence_limit() {
        let (_dir, p, _) = pipeline(config(100, None));
        let h = p.create_new_context().unwrap();
        let logits = p.execute(h, &[0; 14]).unwrap();
        // 14 prompt positions, two decoded, then the cache is full
        assert_eq!(logits.shape().dims(), &[3, VOCAB]);
        assert_eq!(p.context(h).unwrap().lock().processed(), 16);

        let err = p.execute(h, &[1]).unwrap_err();
        assert!(matches!(err, EngineError::ContextOverflow { .. }));
    }

    #[test]
    fn test_huge_token_budget_is_bounded_by_cache() {
        let (_dir, p, _) = pipeline(config(usize::MAX / 2, None));
        let h = p.create_new_context().unwrap();
        let logits = p.execute(h, &[1]).unwrap();
        assert_eq!(logits.shape().dims(), &[16, VOCAB]);
        assert_eq!(p.context(h).unwrap().lock().processed(), 16);
    }

    #[test]
    fn test_conversations_continue_across_calls() {
        let (_dir, p, _) = pipeline(config(1, None));
        let h = p.create_new_context().unwrap();
        p.execute(h, &[1, 2, 3]).unwrap();
        p.execute(h, &[4]).unwrap();
        let ctx = p.context(h).unwrap();
        let state = ctx.lock();
        assert_eq!(state.processed(), 4);
        assert_eq!(state.generated(), &[3, 4]);
    }

    #[test]
    fn test_custom_selector() {
        struct Always(u32);
        impl TokenSelector for Always {
            fn select(&self, _: &[f32]) -> u32 {
                self.0
            }
        }
        let (_dir, p, _) = pipeline(config(2, None));
        p.set_token_selector(Arc::new(Always(7)));
        let h = p.create_new_context().unwrap();
        p.execute(h, &[1]).unwrap();
        assert_eq!(p.context(h).unwrap().lock().generated(), &[7, 7]);
    }

    #[test]
    fn test_without_kernels_logits_are_zero() {
        let (_dir, tm, model) = loaded(backend(false));
        let p = InferencePipeline::new(tm, config(2, None));
        p.prepare(model).unwrap();
        let h = p.create_new_context().unwrap();
        let logits = p.execute(h, &[1, 2]).unwrap();
        assert!(logits.as_f32().unwrap().iter().all(|&v| v == 0.0));
        assert_eq!(p.context(h).unwrap().lock().generated(), &[0, 0]);
    }
}
