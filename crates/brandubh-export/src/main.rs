//! Brandubh checkpoint to ONNX converter
//!
//! Converts a trained Brandubh policy/value checkpoint into a single-file
//! ONNX artifact for browser inference, optionally with a statically
//! quantized INT8 copy next to it.
//!
//! # Usage
//!
//! ```bash
//! # Convert next to the checkpoint (brandubh_model.onnx)
//! brandubh-export brandubh_model.pt
//!
//! # Explicit output, smoke test and INT8 copy (web/model.quant.onnx)
//! brandubh-export brandubh_model.pt -o web/model.onnx --test --quantize
//!
//! # Override what cannot be inferred, reproducible calibration
//! brandubh-export ckpt.safetensors --variant se --value-head-hidden-size 128 \
//!         --quantize --calibration-seed 7
//!
//! # Settings from a file, machine-readable outcome
//! brandubh-export ckpt.pt -c export.toml --report outcome.json --log-format json
//! ```
//!
//! # Exit codes
//!
//! - `0`: success
//! - `1`: the FP32 conversion failed
//! - `2`: invalid configuration
//! - `3`: quantization failed (the FP32 artifact was written)

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use brandubh_export::config::LoggingConfig;
use brandubh_export::exit::{EXIT_CONVERSION_FAIL, EXIT_INVALID_CONFIG, EXIT_QUANTIZATION_FAIL, EXIT_SUCCESS};
use brandubh_export::{ConversionPipeline, ExportConfig, LogFormat, QuantizationOutcome, VariantChoice};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Export a Brandubh checkpoint to ONNX for browser inference
#[derive(Parser, Debug)]
#[command(name = "brandubh-export")]
#[command(about = "Convert Brandubh PyTorch/safetensors checkpoints to single-file ONNX artifacts")]
#[command(version)]
struct Args {
    /// Checkpoint file (.pt, .pth, .ckpt or .safetensors)
    checkpoint: PathBuf,

    /// Output ONNX path (default: the checkpoint with an .onnx extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// ONNX opset version
    #[arg(long)]
    opset: Option<i64>,

    /// Run the exported (and quantized) artifact once and compare outputs
    #[arg(long)]
    test: bool,

    /// Number of residual blocks (inferred when omitted)
    #[arg(long)]
    num_res_blocks: Option<usize>,

    /// Number of channels (inferred when omitted)
    #[arg(long)]
    num_channels: Option<usize>,

    /// Value head hidden size (inferred, or 64 when the checkpoint has no value head)
    #[arg(long)]
    value_head_hidden_size: Option<usize>,

    /// Network variant: auto, plain or se
    #[arg(long)]
    variant: Option<VariantChoice>,

    /// Also write a static INT8 artifact (<output stem>.quant.onnx)
    #[arg(long)]
    quantize: bool,

    /// Number of synthetic calibration samples
    #[arg(long)]
    calibration_samples: Option<usize>,

    /// Seed for reproducible calibration data
    #[arg(long)]
    calibration_seed: Option<u64>,

    /// Write initializers of at least this many bytes to a side-car before
    /// canonicalization re-embeds them
    #[arg(long, value_name = "BYTES")]
    external_data_threshold: Option<usize>,

    /// Keep subnormal floats instead of flushing them to zero
    #[arg(long)]
    no_flush_subnormals: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter directive (RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: pretty, compact or json
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Write the conversion outcome as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };
    if let Err(e) = setup_logging(&config.logging) {
        eprintln!("Error: {e:#}");
        std::process::exit(EXIT_INVALID_CONFIG);
    }

    let code = match convert(&args, config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            EXIT_CONVERSION_FAIL
        }
    };
    std::process::exit(code);
}

/// Defaults < config file < environment < command line.
fn resolve_config(args: &Args) -> Result<ExportConfig> {
    let base = ExportConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let mut builder = base.into_builder();

    if let Some(variant) = args.variant {
        builder = builder.variant(variant);
    }
    if let Some(blocks) = args.num_res_blocks {
        builder = builder.num_residual_blocks(blocks);
    }
    if let Some(channels) = args.num_channels {
        builder = builder.num_channels(channels);
    }
    if let Some(size) = args.value_head_hidden_size {
        builder = builder.value_head_hidden_size(size);
    }
    if let Some(opset) = args.opset {
        builder = builder.opset(opset);
    }
    if let Some(bytes) = args.external_data_threshold {
        builder = builder.external_data_threshold(bytes);
    }
    if args.no_flush_subnormals {
        builder = builder.flush_subnormals(false);
    }
    if args.test {
        builder = builder.verify(true);
    }
    if args.quantize {
        builder = builder.quantize(true);
    }
    if let Some(samples) = args.calibration_samples {
        builder = builder.calibration_samples(samples);
    }
    if let Some(seed) = args.calibration_seed {
        builder = builder.calibration_seed(seed);
    }
    if let Some(level) = &args.log_level {
        builder = builder.log_level(level.clone());
    }
    if let Some(format) = args.log_format {
        builder = builder.log_format(format);
    }

    builder.build().context("invalid command-line options")
}

fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log level `{}`", config.level))?,
    };

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr);

    let installed = match config.format {
        LogFormat::Json => subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).try_init(),
        LogFormat::Compact => subscriber.compact().try_init(),
        LogFormat::Pretty => subscriber.pretty().try_init(),
    };
    installed.map_err(|e| anyhow!(e))
}

fn convert(args: &Args, config: ExportConfig) -> Result<i32> {
    if let Some(path) = &args.config {
        tracing::info!("Config: {}", path.display());
    }

    let mut pipeline = match ConversionPipeline::new(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::error!("{e}");
            return Ok(EXIT_INVALID_CONFIG);
        }
    };
    let outcome = pipeline.run(&args.checkpoint, args.output.as_deref()).map_err(|e| {
        let stage = e.stage();
        anyhow::Error::new(e).context(format!("conversion failed during {stage:?}"))
    })?;

    tracing::info!("Architecture: {}", outcome.architecture);
    tracing::info!(
        "Batch-norm layers repaired: {} of {}",
        outcome.stability.layers_repaired,
        outcome.stability.layers_inspected
    );
    if let Some(verification) = &outcome.verification
        && verification.passed()
    {
        tracing::info!("Inference test passed");
    }
    if let Some(QuantizationOutcome::Completed { report, .. }) = &outcome.quantization {
        tracing::info!("Quantized artifact: {}", report.output.display());
    }

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&outcome).context("failed to serialize report")?;
        fs::write(path, json).with_context(|| format!("failed to write report: {}", path.display()))?;
        tracing::info!("Report: {}", path.display());
    }

    if outcome.quantization_failed() {
        return Ok(EXIT_QUANTIZATION_FAIL);
    }
    Ok(EXIT_SUCCESS)
}
