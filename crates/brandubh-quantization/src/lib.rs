//! Static INT8 quantization of Brandubh ONNX artifacts.
//!
//! The scheme is QOperator with per-tensor MinMax calibration:
//! `QUInt8` activations (asymmetric), `QInt8` weights (symmetric) and
//! `INT32` biases at scale `input_scale * weight_scale`.
//!
//! ```no_run
//! use std::path::Path;
//! use brandubh_quantization::{QuantizationConfig, QuantizationPipeline, quantized_artifact_path};
//!
//! let fp32 = Path::new("brandubh.onnx");
//! let mut pipeline = QuantizationPipeline::new(QuantizationConfig::default()).unwrap();
//! let report = pipeline.run(fp32, &quantized_artifact_path(fp32)).unwrap();
//! println!("{report}");
//! ```

pub mod calibrate;
pub mod calibration;
pub mod error;
pub mod params;
pub mod pipeline;
pub mod quantizer;

pub use calibrate::{CalibrationRanges, TensorRange, collect_ranges};
pub use calibration::{
    CalibrationDataReader, CalibrationSample, DEFAULT_CALIBRATION_SAMPLES, SyntheticCalibrationReader,
};
pub use error::{QuantizationError, Result};
pub use params::{QuantParams, QuantType, quantize_bias};
pub use pipeline::{
    QuantFormat, QuantizationConfig, QuantizationPipeline, QuantizationReport, QuantizationStage,
    quantized_artifact_path,
};
pub use quantizer::{RewriteStats, StaticQuantizer, split_gemm};
