use anyhow::{Context, bail};
use aqlm_core::dequant::{dequantize_gemm, dequantize_gemm_with_layout};
use aqlm_core::synth::{LayerSpec, QuantizedLayer, random_input};
use aqlm_core::{DType, ScaleLayout, Tensor};
use aqlm_kernels::tiled::TiledGemv;
use aqlm_kernels::{
    Accumulation, DeviceClass, GemvBackend, GemvOptions, KernelConfig, Registry, ShapeSignature,
    TuneLevel, TuningCache, select_backward_with, select_with,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "aqlm")]
#[command(about = "Kernel selection, checks and tuning for additive-quantized layers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct LayerArgs {
    /// Device class: host or accelerator
    #[arg(long, default_value = "accelerator")]
    device: String,

    /// Number of codebooks (C)
    #[arg(long, default_value = "2")]
    codebooks: usize,

    /// Entries per codebook (S)
    #[arg(long, default_value = "256")]
    codebook_size: usize,

    /// Output rows per group (O)
    #[arg(long, default_value = "1")]
    out_group: usize,

    /// Input columns per group (G)
    #[arg(long, default_value = "8")]
    in_group: usize,

    /// Codebook storage dtype: f32, f16, bf16
    #[arg(long, default_value = "f16")]
    dtype: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the kernel selected for a configuration
    Select {
        #[command(flatten)]
        layer: LayerArgs,

        /// Select the input-gradient kernel instead
        #[arg(long)]
        backward: bool,
    },

    /// Run the selected kernel and the dense reference on seeded random data
    Check {
        #[command(flatten)]
        layer: LayerArgs,

        #[arg(long, default_value = "4096")]
        in_features: usize,

        #[arg(long, default_value = "4096")]
        out_features: usize,

        /// Input rows
        #[arg(long, default_value = "1")]
        rows: usize,

        #[arg(long, default_value = "0")]
        seed: u64,

        /// Accumulation precision of the tiled kernel: f32 or storage
        #[arg(long, default_value = "f32")]
        accumulation: String,

        /// Maximum error relative to the largest reference output
        #[arg(long)]
        tolerance: Option<f32>,

        /// Check the input-gradient kernel instead
        #[arg(long)]
        backward: bool,
    },

    /// Autotune the tiled kernel for a shape and write the tuning cache
    Tune {
        #[command(flatten)]
        layer: LayerArgs,

        #[arg(long, default_value = "4096")]
        in_features: usize,

        #[arg(long, default_value = "4096")]
        out_features: usize,

        /// Search effort: off, fast, thorough
        #[arg(long, default_value = "thorough")]
        level: String,

        /// Accumulation precision: f32 or storage
        #[arg(long, default_value = "f32")]
        accumulation: String,

        /// Tuning cache file; existing entries are kept
        #[arg(short, long, default_value = "aqlm-tuning.json")]
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let result = match cli.command {
        Commands::Select { layer, backward } => cmd_select(&layer, backward),
        Commands::Check {
            layer,
            in_features,
            out_features,
            rows,
            seed,
            accumulation,
            tolerance,
            backward,
        } => cmd_check(
            &layer,
            Shape {
                in_features,
                out_features,
            },
            rows,
            seed,
            &accumulation,
            tolerance,
            backward,
        ),
        Commands::Tune {
            layer,
            in_features,
            out_features,
            level,
            accumulation,
            output,
        } => cmd_tune(
            &layer,
            Shape {
                in_features,
                out_features,
            },
            &level,
            &accumulation,
            &output,
        ),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

#[derive(Debug, Clone, Copy)]
struct Shape {
    in_features: usize,
    out_features: usize,
}

impl LayerArgs {
    fn config(&self) -> anyhow::Result<KernelConfig> {
        let device = DeviceClass::from_name(&self.device)
            .with_context(|| format!("unknown device class '{}'", self.device))?;
        let dtype = DType::from_name(&self.dtype)
            .with_context(|| format!("unknown dtype '{}'", self.dtype))?;
        if !dtype.is_float() {
            bail!("codebook dtype must be f32, f16 or bf16, got {dtype}");
        }
        Ok(KernelConfig::new(
            device,
            self.codebooks,
            self.codebook_size,
            self.out_group,
            self.in_group,
        )
        .with_codebook_dtype(dtype))
    }

    fn spec(&self, shape: Shape) -> anyhow::Result<LayerSpec> {
        let config = self.config()?;
        Ok(LayerSpec::new(
            config.num_codebooks,
            config.codebook_size,
            config.out_group_size,
            config.in_group_size,
            shape.in_features,
            shape.out_features,
        )
        .with_codebook_dtype(config.codebook_dtype))
    }
}

fn parse_accumulation(name: &str) -> anyhow::Result<Accumulation> {
    Accumulation::from_name(name).with_context(|| format!("unknown accumulation '{name}'"))
}

fn cmd_select(layer: &LayerArgs, backward: bool) -> anyhow::Result<()> {
    let config = layer.config()?;
    let registry = Registry::new(GemvOptions::default());
    let kernel = if backward {
        select_backward_with(&registry, &config)?.forward().clone()
    } else {
        select_with(&registry, &config)?
    };

    println!("config:   {config}");
    if backward {
        println!("runs as:  {}", kernel.config());
    }
    println!("rule:     {} ({})", kernel.rule().priority(), kernel.rule());
    println!("backend:  {}", kernel.name());
    Ok(())
}

fn cmd_check(
    layer: &LayerArgs,
    shape: Shape,
    rows: usize,
    seed: u64,
    accumulation: &str,
    tolerance: Option<f32>,
    backward: bool,
) -> anyhow::Result<()> {
    let config = layer.config()?;
    let accumulation = parse_accumulation(accumulation)?;
    let spec = layer.spec(shape)?;
    let registry = Registry::new(GemvOptions {
        accumulation,
        ..GemvOptions::default()
    });

    let build_start = Instant::now();
    let q = QuantizedLayer::random(&spec, seed)?;
    tracing::debug!(elapsed = ?build_start.elapsed(), "synthetic layer built");

    let (name, got, want, elapsed) = if backward {
        let kernel = select_backward_with(&registry, &config)?;
        let grad = random_input(rows, shape.out_features, config.codebook_dtype, seed ^ 1)?;
        let start = Instant::now();
        let got = kernel.apply(&grad, &q.codes, &q.codebooks, &q.scales, None)?;
        let elapsed = start.elapsed();
        let want = dequantize_gemm_with_layout(
            &grad,
            &q.codes.transpose(0, 1)?,
            &q.codebooks.transpose(2, 3)?,
            &q.scales.transpose(0, 1)?.transpose(2, 3)?,
            ScaleLayout::PerInputGroup,
            None,
        )?;
        (kernel.forward().name().to_string(), got, want, elapsed)
    } else {
        let kernel = select_with(&registry, &config)?;
        let x = random_input(rows, shape.in_features, config.codebook_dtype, seed ^ 1)?;
        let start = Instant::now();
        let got = kernel.apply(&x, &q.codes, &q.codebooks, &q.scales, None)?;
        let elapsed = start.elapsed();
        let want = dequantize_gemm(&x, &q.codes, &q.codebooks, &q.scales, None)?;
        (kernel.name().to_string(), got, want, elapsed)
    };

    let error = max_relative_error(&got, &want)?;
    let tolerance = tolerance.unwrap_or(match (config.codebook_dtype, accumulation) {
        (DType::F32, _) => 1e-4,
        (_, Accumulation::F32) => 1e-2,
        (_, Accumulation::Storage) => 1e-1,
    });

    println!("config:     {config}");
    println!("backend:    {name}");
    println!("shape:      {rows} x {} -> {}", shape.in_features, shape.out_features);
    println!("time:       {:.2}ms", elapsed.as_secs_f64() * 1000.0);
    println!("max error:  {error:.3e} (tolerance {tolerance:.0e})");

    if error > tolerance {
        bail!("{name} disagrees with the reference");
    }
    println!("OK");
    Ok(())
}

/// `max |got - want| / max |want|`.
fn max_relative_error(got: &Tensor, want: &Tensor) -> anyhow::Result<f32> {
    let got = got.to_f32_vec()?;
    let want = want.to_f32_vec()?;
    let diff = got
        .iter()
        .zip(&want)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    let scale = want.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
    Ok(if scale > 0.0 { diff / scale } else { diff })
}

fn cmd_tune(
    layer: &LayerArgs,
    shape: Shape,
    level: &str,
    accumulation: &str,
    output: &Path,
) -> anyhow::Result<()> {
    let config = layer.config()?;
    let level = TuneLevel::from_name(level).with_context(|| format!("unknown tuning level '{level}'"))?;
    let accumulation = parse_accumulation(accumulation)?;
    let spec = layer.spec(shape)?;

    let cache = if output.exists() {
        TuningCache::load(output).with_context(|| format!("reading {}", output.display()))?
    } else {
        TuningCache::new()
    };
    let cache = Arc::new(cache);
    let before = cache.len();

    let kernel = TiledGemv::new(
        GemvOptions {
            accumulation,
            tune: level,
            padded_in_groups: None,
        },
        cache.clone(),
    );
    let q = QuantizedLayer::random(&spec, 0)?;
    let x = random_input(1, shape.in_features, config.codebook_dtype, 1)?;

    let start = Instant::now();
    kernel.apply(&x, &q.codes, &q.codebooks, &q.scales, None)?;
    let elapsed = start.elapsed();

    let num_in_groups = shape.in_features / config.in_group_size;
    let sig = ShapeSignature {
        in_features: shape.in_features,
        out_features: shape.out_features,
        num_codebooks: config.num_codebooks,
        codebook_size: config.codebook_size,
        out_group_size: config.out_group_size,
        in_group_size: config.in_group_size,
        padded_in_groups: num_in_groups.next_power_of_two(),
        accumulation,
    };

    println!("config:          {config}");
    println!("shape:           {} -> {}", shape.in_features, shape.out_features);
    match cache.get(&sig) {
        Some(params) => {
            println!("units per task:  {}", params.units_per_task);
            println!("stage groups:    {}", params.stage_groups);
        }
        None => println!("not tuned (level off), heuristic parameters in use"),
    }
    println!("tuning time:     {:.1}ms", elapsed.as_secs_f64() * 1000.0);

    if cache.len() != before {
        cache.save(output)?;
        println!("wrote {} ({} entries)", output.display(), cache.len());
    }
    Ok(())
}
