//! Minimal ONNX support for Brandubh network artifacts.
//!
//! This crate reads and writes ONNX model files without a protobuf code
//! generator, and provides the two collaborators the export pipeline needs on
//! the consuming side:
//!
//! - [`checker`]: structural well-formedness checks and a diagnostic summary,
//! - [`runtime`]: a small candle-backed interpreter used to verify exported
//!   artifacts and to collect activation ranges for static quantization.
//!
//! External data (`<artifact>.data` side-cars) can be produced and resolved
//! through [`external`].
//!
//! # Example
//!
//! ```no_run
//! use brandubh_onnx::{ArtifactChecker, load_model};
//!
//! let model = load_model("brandubh.onnx").unwrap();
//! let report = ArtifactChecker::default().check_model(&model);
//! println!("{}", report.overall_status);
//! ```

pub mod checker;
pub mod error;
pub mod external;
pub mod io;
pub mod proto;
pub mod runtime;
pub mod tensor;
pub mod wire;

pub use checker::{
    ArtifactCheck, ArtifactChecker, ArtifactSummary, CheckReport, CheckerConfig, TensorSignature,
    ValidationError, ir_version_for_opset,
};
pub use error::{OnnxError, Result, RuntimeError};
pub use external::{externalize_initializers, internalize_initializers, side_car_path};
pub use io::{load_model, save_model};
pub use proto::{
    AttributeProto, Dim, GraphProto, ModelProto, NodeProto, OperatorSetId, StringStringEntry,
    ValueInfoProto,
};
pub use runtime::{Session, SessionOptions, Value};
pub use tensor::{DataType, TensorProto};

/// Producer name written into artifacts created by this workspace.
pub const PRODUCER_NAME: &str = "brandubh-export";
