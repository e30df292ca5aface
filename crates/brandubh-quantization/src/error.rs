use std::io;
use std::path::PathBuf;

use brandubh_onnx::{OnnxError, RuntimeError, ValidationError};
use thiserror::Error;

/// Static quantization failed. The FP32 artifact is never modified.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum QuantizationError {
    #[error("invalid quantization config: {reason}")]
    InvalidConfig { reason: String },
    #[error("calibration reader produced no samples")]
    EmptyCalibration,
    #[error("calibration run failed: {0}")]
    Calibration(#[source] RuntimeError),
    #[error("no calibrated range for tensor `{tensor}`")]
    MissingRange { tensor: String },
    #[error("cannot quantize node {node}: {reason}")]
    UnsupportedGraph { node: String, reason: String },
    #[error("output {path} would overwrite the FP32 artifact")]
    OutputCollision { path: PathBuf },
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("quantized artifact failed validation: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Model(#[from] OnnxError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl QuantizationError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig { reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, QuantizationError>;
