use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;

use kestrel_core::{constants, DType, DeviceKind};
use kestrel_platform::{CapabilitySnapshot, HardwareProber};
use kestrel_runtime::{Engine, EngineConfig, MatMulF32, ModelConfig, ModelFileBuilder, ModelHeader};

#[derive(Parser)]
#[command(
    name = "kestrel",
    about = "Kestrel on-device inference runtime",
    long_about = "Loads partitioned models and runs them across the CPU, GPU and NPU\nof the target SoC, falling back to the CPU where a driver is missing.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the capability snapshot and chip constants
    Info,
    /// Print the headers, execution plan and tensor table of a model file
    Inspect {
        /// Model file
        path: PathBuf,
    },
    /// Load a model, run one conversation turn and print the result
    Run {
        /// Model file
        path: PathBuf,
        /// Engine configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Prompt token ids (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "1")]
        tokens: Vec<u32>,
        /// Request only the CPU
        #[arg(long)]
        cpu_only: bool,
        /// Override the configured token budget
        #[arg(long)]
        max_new_tokens: Option<usize>,
    },
    /// Write a small synthetic model file
    Synth {
        /// Output path
        path: PathBuf,
        #[arg(long, default_value = "2")]
        layers: u32,
        #[arg(long, default_value = "32")]
        vocab: u32,
        #[arg(long, default_value = "16")]
        hidden: u32,
        #[arg(long, default_value = "128")]
        seq_len: u32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Inspect { path } => cmd_inspect(&path),
        Commands::Run { path, config, tokens, cpu_only, max_new_tokens } => {
            cmd_run(&path, config.as_deref(), &tokens, cpu_only, max_new_tokens)
        }
        Commands::Synth { path, layers, vocab, hidden, seq_len } => cmd_synth(&path, layers, vocab, hidden, seq_len),
    }
}

fn mark(on: bool) -> &'static str {
    if on {
        "[x]"
    } else {
        "[ ]"
    }
}

fn cmd_info() -> anyhow::Result<()> {
    let snapshot: &CapabilitySnapshot = HardwareProber::probe();
    println!("kestrel v{}\n", env!("CARGO_PKG_VERSION"));

    let cpu = &snapshot.cpu;
    println!("CPU  {}", cpu.architecture);
    println!("  cores:      {} big + {} little ({} total)", cpu.big_cores, cpu.little_cores, cpu.total_cores);
    println!("  caches:     L1 {} KiB, L2 {} KiB, line {} B", cpu.l1_cache_bytes / 1024, cpu.l2_cache_bytes / 1024, cpu.cache_line_bytes);
    println!("  NEON:       {}", mark(cpu.neon));
    println!("  memory:     {} MiB", cpu.total_memory_bytes / (1024 * 1024));

    let gpu = &snapshot.gpu;
    println!("\nGPU  {}", gpu.name);
    println!("  compute units: {}, workgroup {}", gpu.compute_units, gpu.workgroup_size);
    println!("  Vulkan:        {}", mark(gpu.supports_vulkan));
    println!("  FP16:          {}", mark(gpu.supports_fp16));

    let npu = &snapshot.npu;
    println!("\nNPU  {} ({} TOPS)", npu.driver_version, npu.tops);
    println!("  available:  {}", mark(npu.is_available));
    println!("  INT8/INT16: {}/{}", mark(npu.supports_int8), mark(npu.supports_int16));

    println!("\nLimits");
    println!("  max sequence length:          {}", constants::MAX_SUPPORTED_SEQ_LEN);
    println!("  max concurrent conversations: {}", constants::MAX_CONCURRENT_CONVERSATIONS);
    println!("  host alignment:               {} B", constants::DEFAULT_MEMORY_ALIGNMENT);
    println!("  model magic / min version:    {:#010x} / {}", constants::MODEL_MAGIC, constants::MIN_MODEL_VERSION);
    Ok(())
}

fn cmd_inspect(path: &Path) -> anyhow::Result<()> {
    let config = ModelConfig::parse_metadata(path).with_context(|| format!("inspect {}", path.display()))?;
    let h = &config.header;
    println!("{}", path.display());
    println!("  version {}  arch {}  quant {}  alignment {}", h.version, h.arch_type, h.quant_method, h.alignment);
    println!(
        "  layers {}  vocab {}  hidden {}  intermediate {}",
        h.layer_count, h.vocab_size, h.hidden_size, h.intermediate_size
    );
    println!("  heads {} x {}  kv heads {}  seq {}  rope base {}", h.heads, h.head_size, h.kv_heads, h.seq_len, h.rope_freq_base);

    println!("\nExecution plan");
    for kind in DeviceKind::COMPUTE {
        match config.plan.range(kind) {
            Some(range) => println!("  {:<4} [{}, {})", kind, range.start, range.end),
            None => println!("  {:<4} -", kind),
        }
    }

    println!("\nTensors ({})", config.tensors.len());
    println!("  {:<32} {:<4} {:<6} {:<20} {:>12} {:>12}", "name", "dev", "dtype", "shape", "offset", "bytes");
    for t in &config.tensors {
        println!(
            "  {:<32} {:<4} {:<6} {:<20} {:>12} {:>12}",
            t.name,
            t.device.to_string(),
            t.dtype.to_string(),
            t.shape().to_string(),
            t.offset,
            t.stored_size
        );
    }
    Ok(())
}

fn cmd_run(
    path: &Path,
    config_path: Option<&Path>,
    tokens: &[u32],
    cpu_only: bool,
    max_new_tokens: Option<usize>,
) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(p) => EngineConfig::from_json_file(p)?,
        None => EngineConfig::default(),
    };
    if cpu_only {
        config.devices = EngineConfig::cpu_only().devices;
    }
    if let Some(n) = max_new_tokens {
        config.generation.max_new_tokens = n;
    }

    let mut engine = Engine::new();
    engine.register_cpu_kernel(DType::F32, Arc::new(MatMulF32));
    engine.initialize(config).context("engine initialization")?;

    if !engine.load_model(path)? {
        bail!("failed to load {}", path.display());
    }
    let handle = engine.start_new_conversation()?;

    let start = Instant::now();
    let logits = engine.generate(handle, tokens)?;
    let elapsed = start.elapsed();

    let generated = engine
        .pipeline()
        .and_then(|p| p.context(handle.id))
        .map(|ctx| ctx.lock().generated().to_vec())
        .unwrap_or_default();

    println!("devices:   {:?}", engine.devices().active_kinds());
    println!("prompt:    {:?}", tokens);
    println!("logits:    {} {}", logits.name(), logits.shape());
    println!("generated: {:?}", generated);
    info!(
        conversation = handle.id,
        prompt = tokens.len(),
        generated = generated.len(),
        elapsed_ms = elapsed.as_secs_f64() * 1e3,
        "run finished"
    );

    engine.end_conversation(handle);
    engine.shutdown();
    Ok(())
}

/// Deterministic weight values in [-0.5, 0.5).
fn synth_values(n: usize, seed: usize) -> Vec<f32> {
    (0..n).map(|i| ((i * 31 + seed * 7) % 17) as f32 / 17.0 - 0.5).collect()
}

fn cmd_synth(path: &Path, layers: u32, vocab: u32, hidden: u32, seq_len: u32) -> anyhow::Result<()> {
    let header = ModelHeader {
        layer_count: layers,
        vocab_size: vocab,
        hidden_size: hidden,
        heads: 1,
        head_size: hidden,
        kv_heads: 1,
        seq_len,
        ..ModelHeader::default()
    };
    let (v, h) = (vocab as usize, hidden as usize);
    let mut builder = ModelFileBuilder::new(header);
    builder.add_f32("token_embd", DeviceKind::Cpu, &[v, h], &synth_values(v * h, 0))?;
    for l in 0..layers as usize {
        builder.add_f32(&format!("layers.{l}.attn"), DeviceKind::Cpu, &[h, h], &synth_values(h * h, l + 1))?;
    }
    builder.add_f32("output", DeviceKind::Cpu, &[h, v], &synth_values(h * v, layers as usize + 1))?;
    builder.write_to(path)?;
    info!(path = %path.display(), layers, vocab, hidden, seq_len, "synthetic model written");

    println!("wrote {} ({} tensors)", path.display(), layers + 2);
    Ok(())
}
