//! Fixed facts about the target SoC and the model format.
//!
//! These parameterize defaults only; nothing here is read from the
//! environment at runtime.

// CPU topology
pub const BIG_CORE_COUNT: usize = 4;
pub const LITTLE_CORE_COUNT: usize = 4;
pub const TOTAL_CPU_CORES: usize = BIG_CORE_COUNT + LITTLE_CORE_COUNT;
pub const CPU_ARCHITECTURE: &str = "ARMv8.2-A (Cortex-A76 + Cortex-A55)";

/// Affinity mask of the Cortex-A76 cluster (cores 4-7).
pub const BIG_CORE_MASK: u8 = 0xF0;
/// Affinity mask of the Cortex-A55 cluster (cores 0-3).
pub const LITTLE_CORE_MASK: u8 = 0x0F;
pub const DEFAULT_THREAD_COUNT: usize = 4;

// Caches
pub const L1_CACHE_SIZE: usize = 64 * 1024;
pub const L2_CACHE_SIZE: usize = 512 * 1024;
pub const CACHE_LINE_SIZE: usize = 64;

// GPU
pub const GPU_NAME: &str = "Mali-G57 MC4";
pub const GPU_COMPUTE_UNITS: u32 = 4;
pub const GPU_WORKGROUP_SIZE: u32 = 128;

// NPU
pub const NPU_DRIVER: &str = "NNAPI 1.3+";
pub const NPU_TOPS: f32 = 3.2;
pub const NPU_BATCH_SIZE: u32 = 1;

/// Host allocation alignment; covers NEON loads and GPU import granularity.
pub const DEFAULT_MEMORY_ALIGNMENT: usize = 128;

// Runtime limits
pub const MAX_SUPPORTED_SEQ_LEN: usize = 4096;
pub const MAX_CONCURRENT_CONVERSATIONS: usize = 8;

// Model format
/// Model file magic: the bytes `0x30 0x36 0x37 0x54` read as a LE u32.
pub const MODEL_MAGIC: u32 = 0x5437_3630;
pub const MIN_MODEL_VERSION: u16 = 3;
