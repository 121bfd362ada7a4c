//! Binary model container.
//!
//! Layout (all integers little-endian, no padding between fields):
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Model header          (64 bytes)         │
//! │   magic "T760", version, hyperparameters │
//! ├──────────────────────────────────────────┤
//! │ Hardware header       (64 bytes)         │
//! │   per-device tuning hints                │
//! ├──────────────────────────────────────────┤
//! │ Execution plan        (24 bytes)         │
//! │   [start, end) for NPU, GPU, CPU         │
//! ├──────────────────────────────────────────┤
//! │ Tensor table          (cpu_end × 176)    │
//! ├──────────────────────────────────────────┤
//! │ Payload (raw tensor bytes by offset)     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The parser only reads headers and the table; payloads are streamed by the
//! loader straight into device buffers.

use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

use kestrel_core::constants::{MIN_MODEL_VERSION, MODEL_MAGIC};
use kestrel_core::{DType, DeviceKind, EngineError, Result, Shape};

pub const MODEL_HEADER_SIZE: usize = 64;
pub const HARDWARE_HEADER_SIZE: usize = 64;
pub const PLAN_HEADER_SIZE: usize = 24;
pub const TENSOR_ENTRY_SIZE: usize = 176;
/// Bytes before the tensor table.
pub const HEADERS_SIZE: usize = MODEL_HEADER_SIZE + HARDWARE_HEADER_SIZE + PLAN_HEADER_SIZE;
/// Width of the NUL-terminated name field.
pub const NAME_FIELD_LEN: usize = 128;
/// Maximum dimension slots per tensor.
pub const MAX_DIMS: usize = 4;

/// Payload alignment used by [`ModelFileBuilder`].
const PAYLOAD_ALIGNMENT: usize = 64;

// ---------------------------------------------------------------------------
// Little-endian cursor
// ---------------------------------------------------------------------------

/// Callers check the section length before reading from it.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.bytes::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.bytes())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.bytes())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.bytes())
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Model hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelHeader {
    pub magic: u32,
    pub version: u16,
    pub arch_type: u16,
    pub layer_count: u32,
    pub vocab_size: u32,
    pub hidden_size: u32,
    pub intermediate_size: u32,
    pub heads: u32,
    pub head_size: u32,
    pub kv_heads: u32,
    pub seq_len: u32,
    pub quant_method: u8,
    pub alignment: u8,
    pub reserved: u16,
    pub rope_freq_base: f32,
    pub checksum: [u8; 16],
}

impl Default for ModelHeader {
    fn default() -> Self {
        Self {
            magic: MODEL_MAGIC,
            version: MIN_MODEL_VERSION,
            arch_type: 0,
            layer_count: 0,
            vocab_size: 0,
            hidden_size: 0,
            intermediate_size: 0,
            heads: 0,
            head_size: 0,
            kv_heads: 0,
            seq_len: 0,
            quant_method: 0,
            alignment: PAYLOAD_ALIGNMENT as u8,
            reserved: 0,
            rope_freq_base: 10000.0,
            checksum: [0; 16],
        }
    }
}

impl ModelHeader {
    fn decode(r: &mut Reader<'_>) -> Self {
        Self {
            magic: r.u32(),
            version: r.u16(),
            arch_type: r.u16(),
            layer_count: r.u32(),
            vocab_size: r.u32(),
            hidden_size: r.u32(),
            intermediate_size: r.u32(),
            heads: r.u32(),
            head_size: r.u32(),
            kv_heads: r.u32(),
            seq_len: r.u32(),
            quant_method: r.u8(),
            alignment: r.u8(),
            reserved: r.u16(),
            rope_freq_base: r.f32(),
            checksum: r.bytes(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.arch_type.to_le_bytes());
        for v in [
            self.layer_count,
            self.vocab_size,
            self.hidden_size,
            self.intermediate_size,
            self.heads,
            self.head_size,
            self.kv_heads,
            self.seq_len,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.push(self.quant_method);
        out.push(self.alignment);
        out.extend_from_slice(&self.reserved.to_le_bytes());
        out.extend_from_slice(&self.rope_freq_base.to_le_bytes());
        out.extend_from_slice(&self.checksum);
    }

    /// Elements in one layer's key (or value) cache.
    pub fn kv_cache_elements(&self) -> usize {
        self.seq_len as usize * self.kv_heads as usize * self.head_size as usize
    }
}

/// Device tuning hints. Carried through verbatim, never validated.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareHeader {
    pub npu_precision: u8,
    pub npu_tensor_cores: u8,
    pub npu_batch_size: u16,
    pub gpu_compute_units: u8,
    pub gpu_warp_size: u8,
    pub gpu_workgroup_size: u16,
    pub big_core_mask: u8,
    pub little_core_mask: u8,
    pub migration_hint: u8,
    pub cache_level: u8,
    pub dma_burst_size: u8,
    pub memory_channels: u16,
    pub reserved: [u8; 49],
}

impl Default for HardwareHeader {
    fn default() -> Self {
        use kestrel_core::constants as c;
        Self {
            npu_precision: 0,
            npu_tensor_cores: 0,
            npu_batch_size: c::NPU_BATCH_SIZE as u16,
            gpu_compute_units: c::GPU_COMPUTE_UNITS as u8,
            gpu_warp_size: 0,
            gpu_workgroup_size: c::GPU_WORKGROUP_SIZE as u16,
            big_core_mask: c::BIG_CORE_MASK,
            little_core_mask: c::LITTLE_CORE_MASK,
            migration_hint: 0,
            cache_level: 0,
            dma_burst_size: 0,
            memory_channels: 0,
            reserved: [0; 49],
        }
    }
}

impl HardwareHeader {
    fn decode(r: &mut Reader<'_>) -> Self {
        Self {
            npu_precision: r.u8(),
            npu_tensor_cores: r.u8(),
            npu_batch_size: r.u16(),
            gpu_compute_units: r.u8(),
            gpu_warp_size: r.u8(),
            gpu_workgroup_size: r.u16(),
            big_core_mask: r.u8(),
            little_core_mask: r.u8(),
            migration_hint: r.u8(),
            cache_level: r.u8(),
            dma_burst_size: r.u8(),
            memory_channels: r.u16(),
            reserved: r.bytes(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.npu_precision);
        out.push(self.npu_tensor_cores);
        out.extend_from_slice(&self.npu_batch_size.to_le_bytes());
        out.push(self.gpu_compute_units);
        out.push(self.gpu_warp_size);
        out.extend_from_slice(&self.gpu_workgroup_size.to_le_bytes());
        out.push(self.big_core_mask);
        out.push(self.little_core_mask);
        out.push(self.migration_hint);
        out.push(self.cache_level);
        out.push(self.dma_burst_size);
        out.extend_from_slice(&self.memory_channels.to_le_bytes());
        out.extend_from_slice(&self.reserved);
    }
}

/// Which contiguous slice of the tensor table each device runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionPlan {
    pub npu_start: u32,
    pub npu_end: u32,
    pub gpu_start: u32,
    pub gpu_end: u32,
    pub cpu_start: u32,
    pub cpu_end: u32,
}

impl ExecutionPlan {
    /// Plan that puts the whole table in the CPU range.
    pub fn cpu_only(count: u32) -> Self {
        Self { cpu_end: count, ..Self::default() }
    }

    /// Number of table entries; the CPU range end is authoritative.
    pub fn tensor_count(&self) -> usize {
        self.cpu_end as usize
    }

    /// Table index range for a compute device.
    pub fn range(&self, kind: DeviceKind) -> Option<Range<usize>> {
        let (start, end) = match kind {
            DeviceKind::Npu => (self.npu_start, self.npu_end),
            DeviceKind::Gpu => (self.gpu_start, self.gpu_end),
            DeviceKind::Cpu => (self.cpu_start, self.cpu_end),
            DeviceKind::Shared => return None,
        };
        Some(start as usize..end as usize)
    }

    /// Every range must be ordered and lie within the tensor count.
    pub fn validate(&self) -> Result<()> {
        let total = self.cpu_end;
        for (label, start, end) in [
            ("npu", self.npu_start, self.npu_end),
            ("gpu", self.gpu_start, self.gpu_end),
            ("cpu", self.cpu_start, self.cpu_end),
        ] {
            if start > end || end > total {
                return Err(EngineError::InvalidPlan(format!(
                    "{label} range {start}..{end} is not within 0..{total}"
                )));
            }
        }
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> Self {
        Self {
            npu_start: r.u32(),
            npu_end: r.u32(),
            gpu_start: r.u32(),
            gpu_end: r.u32(),
            cpu_start: r.u32(),
            cpu_end: r.u32(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for v in [self.npu_start, self.npu_end, self.gpu_start, self.gpu_end, self.cpu_start, self.cpu_end] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// Tensor table
// ---------------------------------------------------------------------------

/// One row of the tensor table.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorMetadata {
    pub name: String,
    pub device: DeviceKind,
    pub dtype: DType,
    pub offset: u64,
    pub stored_size: u64,
    pub original_size: u64,
    /// Dimension slots; 0 marks an unused slot.
    pub dims: [u32; MAX_DIMS],
}

impl TensorMetadata {
    pub fn shape(&self) -> Shape {
        Shape::from_slots(&self.dims)
    }

    fn decode(r: &mut Reader<'_>, index: usize) -> Result<Self> {
        let raw_name: [u8; NAME_FIELD_LEN] = r.bytes();
        let len = raw_name.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_LEN);
        let name = std::str::from_utf8(&raw_name[..len])
            .map_err(|_| EngineError::InvalidName { index })?
            .to_string();

        let device_id = r.u8();
        let _reserved: [u8; 3] = r.bytes();
        let code = r.u32();
        let device = DeviceKind::from_id(device_id).ok_or(EngineError::UnknownDevice { index, id: device_id })?;
        let dtype = DType::from_code(code).ok_or(EngineError::UnknownDType { index, code })?;

        Ok(Self {
            name,
            device,
            dtype,
            offset: r.u64(),
            stored_size: r.u64(),
            original_size: r.u64(),
            dims: [r.u32(), r.u32(), r.u32(), r.u32()],
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let mut name = [0u8; NAME_FIELD_LEN];
        let bytes = self.name.as_bytes();
        let n = bytes.len().min(NAME_FIELD_LEN - 1);
        name[..n].copy_from_slice(&bytes[..n]);
        out.extend_from_slice(&name);
        out.push(self.device.id());
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.dtype.code().to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.stored_size.to_le_bytes());
        out.extend_from_slice(&self.original_size.to_le_bytes());
        for d in self.dims {
            out.extend_from_slice(&d.to_le_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// Parsed configuration
// ---------------------------------------------------------------------------

/// Everything in a model file except the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub header: ModelHeader,
    pub hardware: HardwareHeader,
    pub plan: ExecutionPlan,
    pub tensors: Vec<TensorMetadata>,
}

impl ModelConfig {
    /// Parse the metadata of an in-memory model file.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let total = data.len() as u64;
        let (header, hardware, plan) = decode_headers(data, total)?;
        let table_len = table_bytes(&plan, total)?;
        let tensors = decode_table(&data[HEADERS_SIZE..HEADERS_SIZE + table_len], plan.tensor_count())?;
        Ok(Self { header, hardware, plan, tensors })
    }

    /// Parse the metadata of a model file on disk without reading payloads.
    pub fn parse_metadata(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ctx = |what: &str| format!("{what} {}", path.display());
        let mut file = File::open(path).map_err(|e| EngineError::io(ctx("open"), e))?;
        let total = file.metadata().map_err(|e| EngineError::io(ctx("stat"), e))?.len();

        let mut prefix = vec![0u8; (total as usize).min(HEADERS_SIZE)];
        file.read_exact(&mut prefix).map_err(|e| EngineError::io(ctx("read headers of"), e))?;
        let (header, hardware, plan) = decode_headers(&prefix, total)?;

        let mut table = vec![0u8; table_bytes(&plan, total)?];
        file.read_exact(&mut table).map_err(|e| EngineError::io(ctx("read tensor table of"), e))?;
        let tensors = decode_table(&table, plan.tensor_count())?;

        Ok(Self { header, hardware, plan, tensors })
    }

    /// Encode headers and table (no payload).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADERS_SIZE + self.tensors.len() * TENSOR_ENTRY_SIZE);
        self.header.encode(&mut out);
        self.hardware.encode(&mut out);
        self.plan.encode(&mut out);
        for entry in &self.tensors {
            entry.encode(&mut out);
        }
        out
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }
}

fn decode_headers(data: &[u8], total: u64) -> Result<(ModelHeader, HardwareHeader, ExecutionPlan)> {
    if total < MODEL_HEADER_SIZE as u64 {
        return Err(EngineError::Truncated { section: "model header", needed: MODEL_HEADER_SIZE as u64, actual: total });
    }
    let mut r = Reader::new(data);
    let header = ModelHeader::decode(&mut r);
    if header.magic != MODEL_MAGIC {
        return Err(EngineError::BadMagic { expected: MODEL_MAGIC, found: header.magic });
    }
    if header.version < MIN_MODEL_VERSION {
        return Err(EngineError::UnsupportedVersion { found: header.version, minimum: MIN_MODEL_VERSION });
    }

    if total < HEADERS_SIZE as u64 {
        return Err(EngineError::Truncated {
            section: "hardware and execution plan headers",
            needed: HEADERS_SIZE as u64,
            actual: total,
        });
    }
    let hardware = HardwareHeader::decode(&mut r);
    let plan = ExecutionPlan::decode(&mut r);
    plan.validate()?;
    Ok((header, hardware, plan))
}

/// Byte length of the table the plan declares, checked against the file.
fn table_bytes(plan: &ExecutionPlan, total: u64) -> Result<usize> {
    let needed = HEADERS_SIZE as u64 + plan.tensor_count() as u64 * TENSOR_ENTRY_SIZE as u64;
    if total < needed {
        return Err(EngineError::Truncated { section: "tensor table", needed, actual: total });
    }
    Ok(plan.tensor_count() * TENSOR_ENTRY_SIZE)
}

fn decode_table(data: &[u8], count: usize) -> Result<Vec<TensorMetadata>> {
    let mut r = Reader::new(data);
    (0..count).map(|index| TensorMetadata::decode(&mut r, index)).collect()
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

struct PendingTensor {
    name: String,
    device: DeviceKind,
    dtype: DType,
    dims: [u32; MAX_DIMS],
    original_size: u64,
    data: Vec<u8>,
}

/// Writes well-formed model files, mostly for fixtures and smoke tests.
pub struct ModelFileBuilder {
    header: ModelHeader,
    hardware: HardwareHeader,
    plan: Option<ExecutionPlan>,
    tensors: Vec<PendingTensor>,
}

impl ModelFileBuilder {
    pub fn new(header: ModelHeader) -> Self {
        Self { header, hardware: HardwareHeader::default(), plan: None, tensors: Vec::new() }
    }

    pub fn hardware(mut self, hardware: HardwareHeader) -> Self {
        self.hardware = hardware;
        self
    }

    /// Override the execution plan. By default the whole table is the CPU
    /// range.
    pub fn plan(mut self, plan: ExecutionPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Append a tensor. `data` is stored verbatim; its length becomes the
    /// entry's stored size.
    pub fn add_tensor(&mut self, name: &str, device: DeviceKind, dtype: DType, dims: &[usize], data: &[u8]) -> Result<()> {
        let invalid = |reason: String| EngineError::InvalidEntry { name: name.to_string(), reason };
        if name.len() >= NAME_FIELD_LEN {
            return Err(invalid(format!("name is longer than {} bytes", NAME_FIELD_LEN - 1)));
        }
        if dims.len() > MAX_DIMS {
            return Err(invalid(format!("{} dimensions, the format holds {MAX_DIMS}", dims.len())));
        }
        let mut slots = [0u32; MAX_DIMS];
        for (slot, &d) in slots.iter_mut().zip(dims) {
            *slot = u32::try_from(d).map_err(|_| invalid(format!("dimension {d} does not fit in u32")))?;
        }
        let original_size = dtype.storage_bytes(Shape::new(dims).numel()) as u64;
        self.tensors.push(PendingTensor {
            name: name.to_string(),
            device,
            dtype,
            dims: slots,
            original_size,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Append an F32 tensor.
    pub fn add_f32(&mut self, name: &str, device: DeviceKind, dims: &[usize], data: &[f32]) -> Result<()> {
        self.add_tensor(name, device, DType::F32, dims, bytemuck::cast_slice(data))
    }

    /// Metadata the built file will carry.
    pub fn config(&self) -> ModelConfig {
        let table_end = HEADERS_SIZE + self.tensors.len() * TENSOR_ENTRY_SIZE;
        let mut cursor = align_up(table_end, PAYLOAD_ALIGNMENT);
        let tensors = self
            .tensors
            .iter()
            .map(|t| {
                let offset = cursor;
                cursor = align_up(cursor + t.data.len(), PAYLOAD_ALIGNMENT);
                TensorMetadata {
                    name: t.name.clone(),
                    device: t.device,
                    dtype: t.dtype,
                    offset: offset as u64,
                    stored_size: t.data.len() as u64,
                    original_size: t.original_size,
                    dims: t.dims,
                }
            })
            .collect();
        ModelConfig {
            header: self.header.clone(),
            hardware: self.hardware.clone(),
            plan: self.plan.unwrap_or_else(|| ExecutionPlan::cpu_only(self.tensors.len() as u32)),
            tensors,
        }
    }

    /// Encode the complete file: headers, table, then aligned payloads.
    pub fn to_bytes(&self) -> Vec<u8> {
        let config = self.config();
        let mut out = config.to_bytes();
        for (entry, pending) in config.tensors.iter().zip(&self.tensors) {
            out.resize(entry.offset as usize, 0);
            out.extend_from_slice(&pending.data);
        }
        out
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_bytes()).map_err(|e| EngineError::io(format!("write {}", path.display()), e))
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
