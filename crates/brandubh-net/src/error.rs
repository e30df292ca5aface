use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The checkpoint could not be read or deserialized.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CheckpointLoadError {
    #[error("cannot read checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unsupported checkpoint format for {0} (expected .pt, .pth, .ckpt or .safetensors)")]
    UnsupportedFormat(PathBuf),
    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint {path} has an unsupported top-level layout: {reason}")]
    UnsupportedLayout { path: PathBuf, reason: String },
    #[error("checkpoint {path} contains no tensors")]
    Empty { path: PathBuf },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// A structural signal needed to derive the architecture is absent or invalid.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchitectureInferenceError {
    #[error("cannot infer channel count: `{key}` not found in state dict")]
    MissingInputConv { key: &'static str },
    #[error("cannot infer residual block count: no key matches `{pattern}`")]
    NoResidualBlocks { pattern: String },
    #[error("malformed residual block index `{token}` in key `{key}`")]
    MalformedBlockIndex { key: String, token: String },
    #[error("`{key}` has shape {shape:?}, expected a leading output dimension")]
    InvalidShape { key: String, shape: Vec<usize> },
    #[error("override `{field}` must be at least 1, got {value}")]
    InvalidOverride { field: &'static str, value: usize },
}

/// A named parameter's shape disagrees with the instantiated architecture.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parameter `{name}` has shape {actual:?}, architecture expects {expected:?}")]
pub struct ParameterShapeMismatchError {
    pub name: String,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

/// Strict parameter loading failed.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ParameterLoadError {
    #[error(transparent)]
    ShapeMismatch(#[from] ParameterShapeMismatchError),
    #[error("missing parameters: {}", .0.join(", "))]
    MissingParameters(Vec<String>),
    #[error("unexpected parameters: {}", .0.join(", "))]
    UnexpectedParameters(Vec<String>),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
