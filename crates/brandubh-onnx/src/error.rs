use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while decoding, encoding or resolving an ONNX model file.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum OnnxError {
    #[error("truncated protobuf message at offset {offset}: {context}")]
    Truncated { offset: usize, context: &'static str },
    #[error("varint overflow at offset {0}")]
    VarintOverflow(usize),
    #[error("unsupported wire type {wire_type} for field {field}")]
    UnsupportedWireType { field: u32, wire_type: u8 },
    #[error("invalid UTF-8 in field {field}")]
    InvalidUtf8 { field: u32 },
    #[error("model has no graph")]
    MissingGraph,
    #[error("tensor `{name}`: {reason}")]
    InvalidTensor { name: String, reason: String },
    #[error("tensor `{name}` has unsupported data type {data_type}")]
    UnsupportedDataType { name: String, data_type: i32 },
    #[error("external data for `{name}`: {reason}")]
    ExternalData { name: String, reason: String },
    #[error("{path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl OnnxError {
    pub(crate) fn at_path(path: impl Into<PathBuf>, source: io::Error) -> Self {
        OnnxError::Path { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, OnnxError>;

/// Errors raised by the reference runtime.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("missing graph input `{0}`")]
    MissingInput(String),
    #[error("input `{name}` has shape {actual:?}, graph declares {expected}")]
    InputShape { name: String, expected: String, actual: Vec<usize> },
    #[error("value `{name}` consumed by node `{node}` is undefined")]
    UndefinedValue { node: String, name: String },
    #[error("unsupported operator `{op_type}` (node `{node}`)")]
    UnsupportedOperator { node: String, op_type: String },
    #[error("node `{node}`: {reason}")]
    InvalidNode { node: String, reason: String },
    #[error("graph output `{0}` was never produced")]
    MissingOutput(String),
    #[error(transparent)]
    Model(#[from] OnnxError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl RuntimeError {
    pub(crate) fn invalid(node: &str, reason: impl Into<String>) -> Self {
        RuntimeError::InvalidNode { node: node.to_string(), reason: reason.into() }
    }
}
