//! Checkpoint → ONNX conversion pipeline.
//!
//! [`ConversionPipeline`] runs the FP32 stages fail-fast, in order:
//! load checkpoint → infer architecture → instantiate → stabilize → export →
//! canonicalize → validate. Verification and quantization follow when
//! enabled; neither can fail the conversion. A quantization failure is
//! recorded in the [`ConversionOutcome`] and the FP32 artifact stays in place.

use std::path::{Path, PathBuf};

use brandubh_net::{
    Architecture, BrandubhNet, ContainerKind, NumericStabilizer, StabilityReport, StateStore, infer_architecture,
};
use brandubh_onnx::{ArtifactChecker, ArtifactSummary, ValidationError, load_model};
use brandubh_quantization::{QuantizationPipeline, QuantizationReport, quantized_artifact_path};
use serde::Serialize;
use tracing::{info, warn};

use crate::canonicalize::{ArtifactCanonicalizer, CanonicalizationReport};
use crate::config::ExportConfig;
use crate::error::{ConversionError, ExportError};
use crate::export::{ArtifactExporter, ExportOptions, ExportSummary};
use crate::verify::{InferenceVerifier, VerificationReport};

type Result<T> = std::result::Result<T, ConversionError>;

/// `brandubh_model.pt` → `brandubh_model.onnx`.
pub fn default_output_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("onnx")
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

/// Discrete stages the pipeline passes through in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStage {
    Configure = 0,
    LoadCheckpoint = 1,
    InferArchitecture = 2,
    /// Strict parameter loading into the network.
    Instantiate = 3,
    /// Batch-norm variance repair.
    Stabilize = 4,
    Export = 5,
    Canonicalize = 6,
    Validate = 7,
    Verify = 8,
    Quantize = 9,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QuantizationOutcome {
    Completed {
        report: QuantizationReport,
        verification: Option<VerificationReport>,
    },
    /// The FP32 artifact was kept; `output` was not written.
    Failed { output: PathBuf, error: String },
}

/// Everything a successful conversion produced, serializable as a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionOutcome {
    pub checkpoint: PathBuf,
    pub container: ContainerKind,
    pub iteration: Option<i64>,
    pub architecture: Architecture,
    pub stability: StabilityReport,
    pub export: ExportSummary,
    pub canonicalization: CanonicalizationReport,
    pub summary: ArtifactSummary,
    pub verification: Option<VerificationReport>,
    pub quantization: Option<QuantizationOutcome>,
}

impl ConversionOutcome {
    pub fn artifact(&self) -> &Path {
        &self.export.artifact
    }

    pub fn quantization_failed(&self) -> bool {
        matches!(self.quantization, Some(QuantizationOutcome::Failed { .. }))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct ConversionPipeline {
    config: ExportConfig,
    store: StateStore,
    current_stage: Option<ConversionStage>,
}

impl ConversionPipeline {
    pub fn new(config: ExportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, store: StateStore::default(), current_stage: None })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn current_stage(&self) -> Option<ConversionStage> {
        self.current_stage
    }

    /// Convert `checkpoint`, writing to `output` or next to the checkpoint.
    pub fn run(&mut self, checkpoint: &Path, output: Option<&Path>) -> Result<ConversionOutcome> {
        self.current_stage = None;
        let output = output.map_or_else(|| default_output_path(checkpoint), Path::to_path_buf);
        let mode = self.config.export.numeric_mode();
        info!("Converting {} -> {}", checkpoint.display(), output.display());

        // ---- Stage 1: Load checkpoint ----------------------------------------
        self.advance_stage(ConversionStage::LoadCheckpoint)?;
        let container = self.store.read_container(checkpoint)?;
        let kind = container.kind();
        let iteration = container.iteration();
        let params = container.into_parameter_map();

        // ---- Stage 2: Infer architecture -------------------------------------
        self.advance_stage(ConversionStage::InferArchitecture)?;
        let architecture =
            infer_architecture(params.shapes(), self.config.model.variant.resolve(), &self.config.model.overrides())?;

        // ---- Stage 3: Instantiate --------------------------------------------
        self.advance_stage(ConversionStage::Instantiate)?;
        let mut net = BrandubhNet::load(&architecture, &params)?;
        drop(params);

        // ---- Stage 4: Stabilize ----------------------------------------------
        self.advance_stage(ConversionStage::Stabilize)?;
        let stability = NumericStabilizer::new(self.config.model.variance_ceiling)
            .stabilize(&mut net)
            .map_err(ConversionError::Stabilize)?;

        // ---- Stage 5: Export -------------------------------------------------
        self.advance_stage(ConversionStage::Export)?;
        let exporter = ArtifactExporter::new(ExportOptions {
            opset: self.config.export.opset,
            numeric_mode: mode,
            external_data_threshold: self.config.export.external_data_threshold,
        })?;
        let sample = net.sample_input().map_err(ExportError::Tensor)?;
        let export = exporter.export(&net, &sample, &output)?;

        // ---- Stage 6: Canonicalize -------------------------------------------
        self.advance_stage(ConversionStage::Canonicalize)?;
        let canonicalization = ArtifactCanonicalizer.canonicalize(&output)?;

        // ---- Stage 7: Validate -----------------------------------------------
        self.advance_stage(ConversionStage::Validate)?;
        let model = load_model(&output).map_err(ValidationError::from)?;
        let report = ArtifactChecker::default().check_model(&model);
        for warning in report.warnings() {
            warn!("{}: {}", warning.check, warning.message);
        }
        report.into_result()?;
        let summary = ArtifactSummary::from_model(&model);
        drop(model);
        info!("ONNX model is valid");
        for line in summary.to_string().lines() {
            info!("{line}");
        }

        // ---- Stage 8: Verify (optional, never fatal) -------------------------
        let verifier = InferenceVerifier::new(mode).with_tolerance(Some(self.config.export.verify_tolerance));
        let verification = if self.config.export.verify {
            self.advance_stage(ConversionStage::Verify)?;
            Some(verifier.verify(&output, Some(&net)))
        } else {
            None
        };

        // ---- Stage 9: Quantize (optional, isolated) --------------------------
        let quantization = if self.config.quantization.enabled {
            self.advance_stage(ConversionStage::Quantize)?;
            Some(self.quantize(&output, &net, verifier))
        } else {
            None
        };

        info!("Export complete: {}", output.display());
        Ok(ConversionOutcome {
            checkpoint: checkpoint.to_path_buf(),
            container: kind,
            iteration,
            architecture,
            stability,
            export,
            canonicalization,
            summary,
            verification,
            quantization,
        })
    }

    fn quantize(&self, fp32: &Path, net: &BrandubhNet, verifier: InferenceVerifier) -> QuantizationOutcome {
        let output = quantized_artifact_path(fp32);
        let result = QuantizationPipeline::new(self.config.quantization_config())
            .and_then(|mut pipeline| pipeline.run(fp32, &output));
        match result {
            Ok(report) => {
                info!("Quantized model saved to {}", output.display());
                info!("{report}");
                let verification = self
                    .config
                    .export
                    .verify
                    .then(|| verifier.with_tolerance(None).verify(&output, Some(net)));
                QuantizationOutcome::Completed { report, verification }
            }
            Err(e) => {
                warn!("Quantization failed: {e}. The FP32 artifact {} is kept", fp32.display());
                QuantizationOutcome::Failed { output, error: e.to_string() }
            }
        }
    }

    fn advance_stage(&mut self, next: ConversionStage) -> Result<()> {
        if let Some(cur) = self.current_stage
            && next <= cur
        {
            return Err(ConversionError::StageOrder { from: cur, to: next });
        }
        self.current_stage = Some(next);
        Ok(())
    }
}
