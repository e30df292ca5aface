//! Brandubh checkpoint → ONNX conversion.
//!
//! The [`ConversionPipeline`] turns a training checkpoint into a single-file
//! ONNX artifact suitable for browser runtimes:
//!
//! 1. load and unwrap the checkpoint, infer the architecture, load the
//!    network strictly and clamp unstable batch-norm statistics
//!    ([`brandubh_net`]),
//! 2. export the graph with batch norms folded ([`ArtifactExporter`]),
//! 3. embed all external data and remove side-cars
//!    ([`ArtifactCanonicalizer`]),
//! 4. check the artifact structurally ([`brandubh_onnx::ArtifactChecker`]),
//! 5. optionally run it once under onnxruntime ([`InferenceVerifier`]) and
//!    write a static INT8 copy ([`brandubh_quantization`]).
//!
//! ```no_run
//! use std::path::Path;
//! use brandubh_export::{ConversionPipeline, ExportConfig};
//!
//! let config = ExportConfig::builder().quantize(true).build().unwrap();
//! let outcome = ConversionPipeline::new(config).unwrap().run(Path::new("brandubh_model.pt"), None).unwrap();
//! println!("{}", outcome.summary);
//! ```

pub mod canonicalize;
pub mod config;
pub mod error;
pub mod exit;
pub mod export;
pub mod onnxruntime;
pub mod pipeline;
pub mod verify;

pub use canonicalize::{ArtifactCanonicalizer, CanonicalizationReport};
pub use config::{ConfigError, ExportConfig, ExportConfigBuilder, LogFormat, VariantChoice};
pub use error::{CanonicalizationError, ConversionError, ExportError, OrtRuntimeError};
pub use export::{
    ArtifactExporter, BATCH_AXIS, DEFAULT_OPSET, ExportOptions, ExportSummary, INPUT_NAME, MIN_EXPORT_OPSET,
    POLICY_OUTPUT, VALUE_OUTPUT,
};
pub use onnxruntime::OrtSession;
pub use pipeline::{
    ConversionOutcome, ConversionPipeline, ConversionStage, QuantizationOutcome, default_output_path,
};
pub use verify::{DEFAULT_TOLERANCE, InferenceVerifier, VerificationReport};
