//! Streams a model file's tensors into device memory.

use std::fs::File;
use std::io::{ErrorKind as IoErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use kestrel_core::{EngineError, Result, TensorLayout};
use kestrel_platform::MemoryUsage;

use crate::format::{ModelConfig, TensorMetadata};
use crate::model::Model;
use crate::tensor::Tensor;
use crate::tensor_manager::TensorManager;

pub struct ModelLoader {
    tensors: Arc<TensorManager>,
    model: Option<Arc<Model>>,
}

impl ModelLoader {
    pub fn new(tensors: Arc<TensorManager>) -> Self {
        Self { tensors, model: None }
    }

    /// Parse `path`, allocate every tensor on its declared device and read
    /// its payload. Nothing is kept if any entry fails.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<Arc<Model>> {
        if self.model.is_some() {
            return Err(EngineError::ModelAlreadyLoaded);
        }
        let path = path.as_ref();
        let config = ModelConfig::parse_metadata(path)?;
        let mut file = File::open(path).map_err(|e| EngineError::io(format!("open {}", path.display()), e))?;

        let mut tensors = Vec::with_capacity(config.tensors.len());
        for entry in &config.tensors {
            tensors.push(self.load_tensor(&mut file, entry)?);
        }

        let model = Arc::new(Model::assemble(config, tensors)?);
        info!(
            path = %path.display(),
            tensors = model.len(),
            layers = model.config().header.layer_count,
            "model loaded"
        );
        self.model = Some(Arc::clone(&model));
        Ok(model)
    }

    fn load_tensor(&self, file: &mut File, entry: &TensorMetadata) -> Result<Tensor> {
        let mut tensor = self.tensors.create_tensor(
            &entry.name,
            entry.shape(),
            entry.dtype,
            entry.device,
            TensorLayout::Dense,
            MemoryUsage::HostVisibleCoherent,
        )?;

        let capacity = tensor.size_in_bytes();
        if entry.stored_size > capacity as u64 {
            return Err(EngineError::StoredSizeExceedsCapacity {
                name: entry.name.clone(),
                stored: entry.stored_size,
                capacity,
            });
        }

        file.seek(SeekFrom::Start(entry.offset))
            .map_err(|e| EngineError::io(format!("seek to tensor '{}'", entry.name), e))?;
        let dst = &mut tensor.data_mut()?[..entry.stored_size as usize];
        file.read_exact(dst).map_err(|e| match e.kind() {
            IoErrorKind::UnexpectedEof => EngineError::ShortRead { name: entry.name.clone(), expected: entry.stored_size },
            _ => EngineError::io(format!("read tensor '{}'", entry.name), e),
        })?;

        debug!(tensor = %entry.name, device = %entry.device, bytes = entry.stored_size, "tensor loaded");
        Ok(tensor)
    }

    /// Drop the loaded model, if any.
    pub fn unload(&mut self) {
        if self.model.take().is_some() {
            info!("model unloaded");
        }
    }

    pub fn model(&self) -> Option<Arc<Model>> {
        self.model.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ModelFileBuilder, ModelHeader, HEADERS_SIZE, TENSOR_ENTRY_SIZE};
    use kestrel_core::{DType, DeviceKind, ErrorKind};
    use kestrel_platform::testing::CountingAllocator;
    use kestrel_platform::{CpuAllocator, MemoryAllocator, PlatformBackend};

    fn loader_with(allocators: Vec<Arc<dyn MemoryAllocator>>) -> ModelLoader {
        let backend = Arc::new(PlatformBackend::from_allocators(allocators));
        ModelLoader::new(Arc::new(TensorManager::new(backend)))
    }

    fn cpu_loader() -> ModelLoader {
        loader_with(vec![Arc::new(CpuAllocator::new())])
    }

    fn write(b: &ModelFileBuilder) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.t760");
        b.write_to(&path).unwrap();
        (dir, path)
    }

    fn header() -> ModelHeader {
        ModelHeader { layer_count: 1, vocab_size: 4, hidden_size: 4, seq_len: 16, kv_heads: 1, head_size: 4, ..ModelHeader::default() }
    }

    #[test]
    fn test_payload_lands_in_tensor() {
        let mut b = ModelFileBuilder::new(header());
        b.add_f32("embed", DeviceKind::Cpu, &[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        b.add_f32("layers.0.wq", DeviceKind::Cpu, &[3], &[9.0, 8.0, 7.0]).unwrap();
        let (_dir, path) = write(&b);

        let mut loader = cpu_loader();
        let model = loader.load(&path).unwrap();
        assert_eq!(model.len(), 2);
        assert_eq!(model.tensor("embed").unwrap().as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(model.tensor("layers.0.wq").unwrap().as_f32().unwrap(), &[9.0, 8.0, 7.0]);
        assert!(loader.is_loaded());
    }

    #[test]
    fn test_load_twice_rejected_until_unload() {
        let mut b = ModelFileBuilder::new(header());
        b.add_f32("w", DeviceKind::Cpu, &[1], &[1.0]).unwrap();
        let (_dir, path) = write(&b);

        let mut loader = cpu_loader();
        loader.load(&path).unwrap();
        let err = loader.load(&path).unwrap_err();
        assert!(matches!(err, EngineError::ModelAlreadyLoaded));
        assert_eq!(err.kind(), ErrorKind::State);

        loader.unload();
        assert!(loader.model().is_none());
        loader.load(&path).unwrap();
    }

    #[test]
    fn test_stored_size_larger_than_tensor() {
        let mut b = ModelFileBuilder::new(header());
        // dims say one f32, payload holds two
        b.add_tensor("w", DeviceKind::Cpu, DType::F32, &[1], &[0u8; 8]).unwrap();
        let (_dir, path) = write(&b);

        let err = cpu_loader().load(&path).unwrap_err();
        assert!(matches!(err, EngineError::StoredSizeExceedsCapacity { stored: 8, capacity: 4, .. }));
    }

    #[test]
    fn test_short_payload_is_io_error() {
        let mut b = ModelFileBuilder::new(header());
        b.add_f32("w", DeviceKind::Cpu, &[64], &[1.0; 64]).unwrap();
        let bytes = b.to_bytes();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.t760");
        // keep the metadata, drop most of the payload
        std::fs::write(&path, &bytes[..HEADERS_SIZE + TENSOR_ENTRY_SIZE + 100]).unwrap();

        let err = cpu_loader().load(&path).unwrap_err();
        assert!(matches!(err, EngineError::ShortRead { .. }));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_entries_placed_on_declared_device() {
        let mut b = ModelFileBuilder::new(header());
        b.add_f32("npu_w", DeviceKind::Npu, &[4], &[1.0; 4]).unwrap();
        b.add_f32("gpu_w", DeviceKind::Gpu, &[4], &[2.0; 4]).unwrap();
        b.add_f32("cpu_w", DeviceKind::Cpu, &[4], &[3.0; 4]).unwrap();
        let (_dir, path) = write(&b);

        let gpu = CountingAllocator::new(DeviceKind::Gpu);
        let gpu_counters = gpu.counters();
        let mut loader = loader_with(vec![
            Arc::new(CpuAllocator::new()),
            Arc::new(gpu),
            Arc::new(CountingAllocator::new(DeviceKind::Npu)),
        ]);
        let model = loader.load(&path).unwrap();
        assert_eq!(model.tensor("npu_w").unwrap().device(), DeviceKind::Npu);
        assert_eq!(model.tensor("gpu_w").unwrap().device(), DeviceKind::Gpu);
        assert_eq!(model.tensor("gpu_w").unwrap().as_f32().unwrap(), &[2.0; 4]);
        assert_eq!(gpu_counters.live(), 1);

        drop(model);
        loader.unload();
        assert_eq!(gpu_counters.live(), 0);
    }

    #[test]
    fn test_missing_device_fails_whole_load() {
        let mut b = ModelFileBuilder::new(header());
        b.add_f32("cpu_w", DeviceKind::Cpu, &[4], &[3.0; 4]).unwrap();
        b.add_f32("gpu_w", DeviceKind::Gpu, &[4], &[2.0; 4]).unwrap();
        let (_dir, path) = write(&b);

        let mut loader = cpu_loader();
        let err = loader.load(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert!(!loader.is_loaded());
    }
}
