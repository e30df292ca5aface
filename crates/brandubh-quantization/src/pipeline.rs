//! Static quantization pipeline.
//!
//! [`QuantizationPipeline`] drives preprocess → calibrate → quantize → save
//! over an FP32 artifact on disk and writes an INT8 sibling. The FP32 input
//! is only ever read.

use std::fmt;
use std::path::{Path, PathBuf};

use brandubh_onnx::{ArtifactChecker, ModelProto, Session, SessionOptions, load_model, save_model};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibrate::collect_ranges;
use crate::calibration::{CalibrationDataReader, DEFAULT_CALIBRATION_SAMPLES, SyntheticCalibrationReader};
use crate::error::{QuantizationError, Result};
use crate::params::QuantType;
use crate::quantizer::{StaticQuantizer, split_gemm};

/// Suffix replacing the FP32 artifact's extension.
pub const QUANTIZED_SUFFIX: &str = "quant.onnx";

/// `brandubh.onnx` → `brandubh.quant.onnx`.
pub fn quantized_artifact_path(fp32: &Path) -> PathBuf {
    fp32.with_extension(QUANTIZED_SUFFIX)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Layout of the quantized graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantFormat {
    /// Quantized operators (`QLinearConv`, `QLinearMatMul`).
    QOperator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    pub format: QuantFormat,
    pub activation_type: QuantType,
    pub weight_type: QuantType,
    /// Number of synthetic calibration samples.
    pub calibration_samples: usize,
    /// Seed for reproducible calibration data.
    pub calibration_seed: Option<u64>,
    /// Flush subnormal activations while calibrating.
    pub flush_subnormals: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            format: QuantFormat::QOperator,
            activation_type: QuantType::QUInt8,
            weight_type: QuantType::QInt8,
            calibration_samples: DEFAULT_CALIBRATION_SAMPLES,
            calibration_seed: None,
            flush_subnormals: true,
        }
    }
}

impl QuantizationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.calibration_samples == 0 {
            return Err(QuantizationError::invalid_config("calibration_samples must be > 0"));
        }
        if self.activation_type != QuantType::QUInt8 {
            return Err(QuantizationError::invalid_config("activations must be QUInt8"));
        }
        if self.weight_type != QuantType::QInt8 {
            return Err(QuantizationError::invalid_config("weights must be QInt8"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

/// Discrete stages the pipeline passes through in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum QuantizationStage {
    /// Split `Gemm` into `MatMul` + `Add`.
    Preprocess = 0,
    /// Collect activation ranges from calibration samples.
    Calibration = 1,
    /// Rewrite the graph to quantized operators.
    Quantization = 2,
    /// Validate and write the quantized artifact.
    Save = 3,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantizationReport {
    pub output: PathBuf,
    pub calibration_samples: usize,
    pub nodes_quantized: usize,
    pub relus_fused: usize,
    pub fp32_bytes: u64,
    pub int8_bytes: u64,
    /// `fp32_bytes / int8_bytes`.
    pub compression_ratio: f64,
}

impl QuantizationReport {
    pub fn size_reduction_percent(&self) -> f64 {
        if self.fp32_bytes == 0 {
            return 0.0;
        }
        (1.0 - self.int8_bytes as f64 / self.fp32_bytes as f64) * 100.0
    }
}

impl fmt::Display for QuantizationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MB: f64 = 1024.0 * 1024.0;
        write!(
            f,
            "FP32 {:.2} MB -> INT8 {:.2} MB ({:.2}x smaller, {:.1}% reduction)",
            self.fp32_bytes as f64 / MB,
            self.int8_bytes as f64 / MB,
            self.compression_ratio,
            self.size_reduction_percent()
        )
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct QuantizationPipeline {
    config: QuantizationConfig,
    current_stage: Option<QuantizationStage>,
}

impl QuantizationPipeline {
    pub fn new(config: QuantizationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, current_stage: None })
    }

    pub fn current_stage(&self) -> Option<QuantizationStage> {
        self.current_stage
    }

    pub fn config(&self) -> &QuantizationConfig {
        &self.config
    }

    /// Quantize `fp32` into `output` with synthetic calibration data shaped
    /// like the artifact's first input (batch 1).
    pub fn run(&mut self, fp32: &Path, output: &Path) -> Result<QuantizationReport> {
        self.current_stage = None;
        let model = load_model(fp32)?;
        let input = model
            .graph
            .input
            .iter()
            .find(|i| model.graph.initializer(&i.name).is_none())
            .ok_or_else(|| QuantizationError::UnsupportedGraph {
                node: "graph".into(),
                reason: "artifact declares no runtime input".into(),
            })?;
        let shape: Vec<usize> = input
            .dims()
            .unwrap_or_default()
            .iter()
            .map(|d| match d {
                brandubh_onnx::Dim::Value(v) if *v > 0 => *v as usize,
                _ => 1,
            })
            .collect();
        let mut reader = SyntheticCalibrationReader::new(
            self.config.calibration_samples,
            &shape,
            &input.name,
            self.config.calibration_seed,
        )?;
        self.quantize_model(model, fp32, output, &mut reader)
    }

    /// Quantize `fp32` into `output`, draining `reader` once for calibration.
    pub fn execute(
        &mut self,
        fp32: &Path,
        output: &Path,
        reader: &mut dyn CalibrationDataReader,
    ) -> Result<QuantizationReport> {
        self.current_stage = None;
        let model = load_model(fp32)?;
        self.quantize_model(model, fp32, output, reader)
    }

    /// Stages over an already decoded `model` read from `fp32`.
    fn quantize_model(
        &mut self,
        mut model: ModelProto,
        fp32: &Path,
        output: &Path,
        reader: &mut dyn CalibrationDataReader,
    ) -> Result<QuantizationReport> {
        if same_file(fp32, output) {
            return Err(QuantizationError::OutputCollision { path: output.to_path_buf() });
        }
        let fp32_bytes = file_size(fp32)?;
        info!("Quantizing {} -> {}", fp32.display(), output.display());

        // ---- Stage 1: Preprocess -------------------------------------------
        self.advance_stage(QuantizationStage::Preprocess)?;
        split_gemm(&mut model)?;

        // ---- Stage 2: Calibration ------------------------------------------
        self.advance_stage(QuantizationStage::Calibration)?;
        let session = Session::new(
            model.clone(),
            SessionOptions { flush_subnormals: self.config.flush_subnormals },
        )
        .map_err(QuantizationError::Calibration)?;
        let ranges = collect_ranges(&session, reader)?;
        drop(session);

        // ---- Stage 3: Quantization -----------------------------------------
        self.advance_stage(QuantizationStage::Quantization)?;
        let stats = StaticQuantizer::new().quantize(&mut model, &ranges)?;

        // ---- Stage 4: Save -------------------------------------------------
        self.advance_stage(QuantizationStage::Save)?;
        ArtifactChecker::default().check_model(&model).into_result()?;
        let int8_bytes = save_model(&model, output)?;

        let compression_ratio = if int8_bytes == 0 { 1.0 } else { fp32_bytes as f64 / int8_bytes as f64 };
        let report = QuantizationReport {
            output: output.to_path_buf(),
            calibration_samples: ranges.samples(),
            nodes_quantized: stats.nodes_quantized,
            relus_fused: stats.relus_fused,
            fp32_bytes,
            int8_bytes,
            compression_ratio,
        };
        info!("Quantization complete: {report}");
        Ok(report)
    }

    fn advance_stage(&mut self, next: QuantizationStage) -> Result<()> {
        if let Some(cur) = self.current_stage
            && next <= cur
        {
            return Err(QuantizationError::invalid_config(format!(
                "stage ordering violation: cannot move from {cur:?} to {next:?}"
            )));
        }
        self.current_stage = Some(next);
        Ok(())
    }
}

fn file_size(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|source| QuantizationError::Io { path: path.to_path_buf(), source })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantized_path_replaces_extension() {
        assert_eq!(
            quantized_artifact_path(Path::new("out/brandubh.onnx")),
            PathBuf::from("out/brandubh.quant.onnx")
        );
        assert_eq!(quantized_artifact_path(Path::new("model")), PathBuf::from("model.quant.onnx"));
    }

    #[test]
    fn config_rejects_zero_samples() {
        let config = QuantizationConfig { calibration_samples: 0, ..Default::default() };
        assert!(matches!(QuantizationPipeline::new(config), Err(QuantizationError::InvalidConfig { .. })));
    }

    #[test]
    fn stages_cannot_repeat() {
        let mut pipeline = QuantizationPipeline::new(QuantizationConfig::default()).unwrap();
        pipeline.advance_stage(QuantizationStage::Preprocess).unwrap();
        pipeline.advance_stage(QuantizationStage::Calibration).unwrap();
        assert!(pipeline.advance_stage(QuantizationStage::Preprocess).is_err());
        assert_eq!(pipeline.current_stage(), Some(QuantizationStage::Calibration));
    }

    #[test]
    fn report_formats_megabytes() {
        let report = QuantizationReport {
            output: PathBuf::from("m.quant.onnx"),
            calibration_samples: 50,
            nodes_quantized: 3,
            relus_fused: 1,
            fp32_bytes: 4 * 1024 * 1024,
            int8_bytes: 1024 * 1024,
            compression_ratio: 4.0,
        };
        assert_eq!(report.size_reduction_percent(), 75.0);
        assert_eq!(report.to_string(), "FP32 4.00 MB -> INT8 1.00 MB (4.00x smaller, 75.0% reduction)");
    }
}
