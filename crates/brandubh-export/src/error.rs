use std::io;
use std::path::PathBuf;

use brandubh_net::{ArchitectureInferenceError, CheckpointLoadError, ParameterLoadError};
use brandubh_onnx::{OnnxError, ValidationError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::pipeline::ConversionStage;

/// The network could not be turned into an ONNX graph.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("opset {opset} is unsupported (expected {min}..={max})")]
    UnsupportedOpset { opset: i64, min: i64, max: i64 },
    #[error("sample input has shape {shape:?}, expected [1, 4, 7, 7]")]
    InvalidSample { shape: Vec<usize> },
    #[error("forward pass failed on the sample input: {0}")]
    Trace(#[source] candle_core::Error),
    #[error("traced `{output}` has shape {actual:?}, expected {expected:?}")]
    UnexpectedOutput { output: &'static str, expected: Vec<usize>, actual: Vec<usize> },
    #[error("layer `{layer}` cannot be exported: {reason}")]
    UnsupportedLayer { layer: String, reason: String },
    #[error("cannot create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Model(#[from] OnnxError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// The artifact could not be rewritten into its single-file form.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CanonicalizationError {
    #[error("cannot load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: OnnxError,
    },
    #[error("cannot embed external data of {path}: {source}")]
    Embed {
        path: PathBuf,
        #[source]
        source: OnnxError,
    },
    #[error("cannot rewrite {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: OnnxError,
    },
    #[error("cannot remove side-car {path}: {source}")]
    RemoveSideCar {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A fatal failure of the FP32 conversion, tagged with its stage.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointLoadError),
    #[error(transparent)]
    Architecture(#[from] ArchitectureInferenceError),
    #[error(transparent)]
    Parameters(#[from] ParameterLoadError),
    #[error("batch-norm stabilization failed: {0}")]
    Stabilize(#[source] candle_core::Error),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Canonicalize(#[from] CanonicalizationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("stage ordering violation: cannot move from {from:?} to {to:?}")]
    StageOrder { from: ConversionStage, to: ConversionStage },
}

impl ConversionError {
    /// Pipeline stage the error was raised in.
    pub fn stage(&self) -> ConversionStage {
        match self {
            ConversionError::Config(_) => ConversionStage::Configure,
            ConversionError::Checkpoint(_) => ConversionStage::LoadCheckpoint,
            ConversionError::Architecture(_) => ConversionStage::InferArchitecture,
            ConversionError::Parameters(_) => ConversionStage::Instantiate,
            ConversionError::Stabilize(_) => ConversionStage::Stabilize,
            ConversionError::Export(_) => ConversionStage::Export,
            ConversionError::Canonicalize(_) => ConversionStage::Canonicalize,
            ConversionError::Validation(_) => ConversionStage::Validate,
            ConversionError::StageOrder { to, .. } => *to,
        }
    }
}

/// onnxruntime could not load or run an artifact.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum OrtRuntimeError {
    #[error("onnxruntime cannot load {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("session has no input named `{0}`")]
    MissingInput(String),
    #[error("onnxruntime inference failed: {0}")]
    Inference(String),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
