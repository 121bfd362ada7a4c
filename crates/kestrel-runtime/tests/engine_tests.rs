//! End-to-end tests for the Kestrel runtime on a driverless host.
//! Run with: cargo test -p kestrel-runtime --test engine_tests -- --nocapture

use std::path::PathBuf;
use std::sync::Arc;

use kestrel_core::{DType, DeviceKind, ErrorKind, Shape, TensorLayout};
use kestrel_platform::testing::CountingAllocator;
use kestrel_platform::{CapabilitySnapshot, DeviceConfig, MemoryAllocator, MemoryUsage, PlatformBackend};
use kestrel_runtime::format::MODEL_HEADER_SIZE;
use kestrel_runtime::{
    ConversationHandle, Engine, EngineConfig, EngineState, GenerationConfig, MatMulF32, ModelConfig,
    ModelFileBuilder, ModelHeader, Tensor, TensorManager,
};

/// Version 3, two layers, 128 positions, 2 KV heads of size 4, three CPU entries.
fn synthetic_file(dir: &tempfile::TempDir) -> PathBuf {
    let header = ModelHeader {
        version: 3,
        layer_count: 2,
        vocab_size: 16,
        hidden_size: 8,
        heads: 2,
        head_size: 4,
        kv_heads: 2,
        seq_len: 128,
        ..ModelHeader::default()
    };
    let mut b = ModelFileBuilder::new(header);
    b.add_f32("token_embd", DeviceKind::Cpu, &[16, 8], &[0.01; 128]).unwrap();
    b.add_f32("blk.0.attn_qkv", DeviceKind::Cpu, &[8, 8], &[0.5; 64]).unwrap();
    b.add_f32("blk.1.ffn_down", DeviceKind::Cpu, &[8, 16], &[0.25; 128]).unwrap();
    let path = dir.path().join("synthetic.t760");
    b.write_to(&path).unwrap();
    path
}

fn cpu_engine(config: EngineConfig) -> Engine {
    let mut engine = Engine::new();
    engine.initialize_with_snapshot(config, &CapabilitySnapshot::cpu_only()).unwrap();
    engine
}

// ============================================================================
// Model loading
// ============================================================================

#[test]
fn test_synthetic_model_loads_in_table_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = synthetic_file(&dir);
    let mut engine = cpu_engine(EngineConfig::default());
    assert!(engine.load_model(&path).unwrap());

    let config = engine.model_config().unwrap();
    assert_eq!(config.tensors.len(), 3);
    let names: Vec<&str> = config.tensors.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["token_embd", "blk.0.attn_qkv", "blk.1.ffn_down"]);

    let model = engine.pipeline().unwrap().model().unwrap();
    let order: Vec<&str> = model.execution_order().map(Tensor::name).collect();
    assert_eq!(order, names);
    assert_eq!(model.tensor("blk.0.attn_qkv").unwrap().as_f32().unwrap(), &[0.5; 64]);
}

#[test]
fn test_synthetic_model_kv_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = cpu_engine(EngineConfig::default());
    assert!(engine.load_model(synthetic_file(&dir)).unwrap());

    let handle = engine.start_new_conversation().unwrap();
    let ctx = engine.pipeline().unwrap().context(handle.id).unwrap();
    let state = ctx.lock();
    assert_eq!(state.kv_pairs().len(), 2);
    for (k, v) in state.kv_pairs() {
        assert_eq!(k.numel(), 128 * 2 * 4);
        assert_eq!(v.numel(), 128 * 2 * 4);
        assert_eq!(k.shape().dims(), &[1, 128, 2, 4]);
        assert_eq!(k.dtype(), DType::F16);
        assert_eq!(k.device(), DeviceKind::Cpu);
    }
}

#[test]
fn test_corrupted_magic_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = synthetic_file(&dir);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let err = ModelConfig::from_bytes(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);

    let mut engine = cpu_engine(EngineConfig::default());
    assert!(!engine.load_model(&path).unwrap());
    assert!(!engine.is_model_loaded());
    assert_eq!(engine.state(), EngineState::Initialized);
}

#[test]
fn test_truncated_header_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = synthetic_file(&dir);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..MODEL_HEADER_SIZE - 1]).unwrap();

    let mut engine = cpu_engine(EngineConfig::default());
    assert!(!engine.load_model(&path).unwrap());
    assert!(!engine.is_model_loaded());
}

// ============================================================================
// Device activation
// ============================================================================

#[test]
fn test_gpu_unavailable_falls_back_to_cpu() {
    let config = EngineConfig {
        devices: vec![DeviceConfig::new(DeviceKind::Gpu), DeviceConfig::new(DeviceKind::Cpu)],
        ..EngineConfig::default()
    };
    let mut engine = Engine::new();
    engine.initialize_with_snapshot(config, &CapabilitySnapshot::with_accelerators(false, false)).unwrap();
    assert_eq!(engine.state(), EngineState::Initialized);
    assert_eq!(engine.devices().active_kinds(), vec![DeviceKind::Cpu]);
    assert_eq!(engine.backend().unwrap().active_kinds(), vec![DeviceKind::Cpu]);
}

#[test]
fn test_accelerator_only_request_without_accelerators_fails() {
    let config = EngineConfig {
        devices: vec![DeviceConfig::new(DeviceKind::Gpu), DeviceConfig::new(DeviceKind::Npu)],
        ..EngineConfig::default()
    };
    let mut engine = Engine::new();
    let err = engine.initialize_with_snapshot(config, &CapabilitySnapshot::cpu_only()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Initialization);
    assert_eq!(engine.state(), EngineState::ErrorState);
}

#[test]
fn test_disabled_cpu_is_not_activated() {
    let config = EngineConfig { devices: vec![DeviceConfig::new(DeviceKind::Cpu).disabled()], ..EngineConfig::default() };
    let mut engine = Engine::new();
    assert!(engine.initialize_with_snapshot(config, &CapabilitySnapshot::cpu_only()).is_err());
}

// ============================================================================
// Conversations
// ============================================================================

#[test]
fn test_unknown_handles() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = cpu_engine(EngineConfig::default());
    assert!(engine.load_model(synthetic_file(&dir)).unwrap());
    let live = engine.start_new_conversation().unwrap();
    let pipeline = engine.pipeline().unwrap();

    let ghost = ConversationHandle { id: live.id + 100 };
    engine.end_conversation(ghost);
    assert_eq!(pipeline.context_count(), 1);

    let err = engine.generate(ghost, &[1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lookup);
    assert_eq!(engine.state(), EngineState::ModelLoaded);
}

#[test]
fn test_conversation_cap() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = cpu_engine(EngineConfig { max_concurrent_conversations: 3, ..EngineConfig::default() });
    assert!(engine.load_model(synthetic_file(&dir)).unwrap());

    let handles: Vec<_> = (0..3).map(|_| engine.start_new_conversation().unwrap()).collect();
    assert_eq!(engine.start_new_conversation().unwrap_err().kind(), ErrorKind::State);

    engine.end_conversation(handles[1]);
    let next = engine.start_new_conversation().unwrap();
    assert!(handles.iter().all(|h| h.id != next.id));
}

#[test]
fn test_generation_with_reference_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig { generation: GenerationConfig { max_new_tokens: 4, eos_token: None }, ..EngineConfig::default() };
    let mut engine = Engine::new();
    engine.register_cpu_kernel(DType::F32, Arc::new(MatMulF32));
    engine.initialize_with_snapshot(config, &CapabilitySnapshot::cpu_only()).unwrap();
    assert!(engine.load_model(synthetic_file(&dir)).unwrap());

    let handle = engine.start_new_conversation().unwrap();
    let logits = engine.generate(handle, &[3, 1, 4]).unwrap();
    assert_eq!(logits.shape().dims(), &[4, 16]);
    assert_eq!(logits.dtype(), DType::F32);

    let ctx = engine.pipeline().unwrap().context(handle.id).unwrap();
    let state = ctx.lock();
    assert_eq!(state.generated().len(), 4);
    assert_eq!(state.processed(), 3 + 3);
}

#[test]
fn test_parallel_conversations() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig { generation: GenerationConfig { max_new_tokens: 2, eos_token: None }, ..EngineConfig::default() };
    let mut engine = cpu_engine(config);
    assert!(engine.load_model(synthetic_file(&dir)).unwrap());
    let pipeline = engine.pipeline().unwrap();

    let handles: Vec<u64> = (0..4).map(|_| pipeline.create_new_context().unwrap()).collect();
    std::thread::scope(|s| {
        for &h in &handles {
            let pipeline = Arc::clone(&pipeline);
            s.spawn(move || {
                for _ in 0..3 {
                    pipeline.execute(h, &[7]).unwrap();
                }
            });
        }
    });
    for h in handles {
        let ctx = pipeline.context(h).unwrap();
        let state = ctx.lock();
        assert_eq!(state.generated().len(), 6);
        assert_eq!(state.processed(), 6);
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_state_machine_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = synthetic_file(&dir);
    let mut engine = Engine::new();
    assert_eq!(engine.state(), EngineState::Uninitialized);
    assert_eq!(engine.load_model(&path).unwrap_err().kind(), ErrorKind::State);

    engine.initialize_with_snapshot(EngineConfig::default(), &CapabilitySnapshot::cpu_only()).unwrap();
    assert!(engine.load_model(&path).unwrap());
    assert_eq!(engine.state(), EngineState::ModelLoaded);

    engine.unload_model();
    assert_eq!(engine.state(), EngineState::Initialized);
    assert!(engine.load_model(&path).unwrap());

    engine.shutdown();
    assert_eq!(engine.state(), EngineState::Shutdown);
    assert!(!engine.is_model_loaded());
    engine.shutdown();
    assert_eq!(engine.start_new_conversation().unwrap_err().kind(), ErrorKind::State);
}

#[test]
fn test_memory_budget_caps_allocations() {
    let dir = tempfile::tempdir().unwrap();
    // the synthetic tensors take 1280 bytes; one conversation's KV cache takes 8 KiB
    let config = EngineConfig { devices: vec![DeviceConfig::new(DeviceKind::Cpu).with_budget_mb(1)], ..EngineConfig::default() };
    let mut engine = cpu_engine(config);
    assert!(engine.load_model(synthetic_file(&dir)).unwrap());
    let backend = engine.backend().unwrap();
    let before = backend.remaining_budget(DeviceKind::Cpu).unwrap();
    assert!(before < 1024 * 1024);

    let handle = engine.start_new_conversation().unwrap();
    assert_eq!(backend.remaining_budget(DeviceKind::Cpu).unwrap(), before - 2 * 2 * 128 * 2 * 4 * 2);
    engine.end_conversation(handle);
    assert_eq!(backend.remaining_budget(DeviceKind::Cpu).unwrap(), before);
}

// ============================================================================
// Release accounting
// ============================================================================

#[test]
fn test_every_buffer_released_exactly_once() {
    let allocators: Vec<CountingAllocator> = DeviceKind::COMPUTE.into_iter().map(CountingAllocator::new).collect();
    let counters: Vec<_> = allocators.iter().map(|a| a.counters()).collect();
    let backend = PlatformBackend::from_allocators(allocators.into_iter().map(|a| Arc::new(a) as Arc<dyn MemoryAllocator>));
    let tm = TensorManager::new(Arc::new(backend));

    let make = |name: &str, device| {
        tm.create_tensor(name, Shape::new(&[4, 4]), DType::F32, device, TensorLayout::Dense, MemoryUsage::HostVisibleCoherent)
            .unwrap()
    };

    for device in DeviceKind::COMPUTE {
        // moved into a collection
        let mut held = vec![make("a", device), make("b", device)];
        // replaced in place; the old value drops here
        held[0] = make("c", device);
        let loose = make("d", device);
        let popped = held.pop().unwrap();
        drop(popped);
        drop(loose);
        drop(held);
    }

    for c in &counters {
        assert_eq!(c.allocated(), 4);
        assert_eq!(c.released(), 4);
        assert_eq!(c.live(), 0);
    }
}
