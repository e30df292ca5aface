//! Artifact execution through onnxruntime.
//!
//! Browser inference engines are onnxruntime builds, so smoke runs of an
//! exported artifact go through the same engine rather than through the
//! workspace's own interpreter.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use brandubh_net::NumericMode;
use candle_core::{DType, Device, Tensor};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use tracing::{debug, info};

use crate::error::OrtRuntimeError;

type Result<T> = std::result::Result<T, OrtRuntimeError>;

/// An artifact loaded into an onnxruntime session.
pub struct OrtSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl fmt::Debug for OrtSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrtSession")
            .field("input_names", &self.input_names)
            .field("output_names", &self.output_names)
            .finish()
    }
}

impl OrtSession {
    /// Load `path`; with subnormal flushing on, the session treats denormals
    /// as zero.
    pub fn from_file(path: &Path, mode: NumericMode) -> Result<Self> {
        info!(path = %path.display(), "Loading ONNX model into onnxruntime");
        let load = |e: ort::Error| OrtRuntimeError::Load { path: path.to_path_buf(), reason: e.to_string() };

        let mut builder = Session::builder()
            .map_err(load)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load)?
            .with_intra_threads(1)
            .map_err(load)?;
        if mode.flush_subnormals {
            builder = builder.with_denormal_as_zero().map_err(load)?;
        }
        let session = builder.commit_from_file(path).map_err(load)?;

        let input_names: Vec<String> = session.inputs().iter().map(|input| input.name().to_string()).collect();
        let output_names: Vec<String> = session.outputs().iter().map(|output| output.name().to_string()).collect();
        debug!(inputs = ?input_names, outputs = ?output_names, "onnxruntime session ready");

        Ok(Self { session, input_names, output_names })
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Run the session on float inputs and collect every float output.
    pub fn run(&mut self, inputs: &[(&str, Tensor)]) -> Result<HashMap<String, Tensor>> {
        let mut feeds = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            if !self.input_names.iter().any(|n| n == name) {
                return Err(OrtRuntimeError::MissingInput((*name).to_string()));
            }
            let shape: Vec<i64> = tensor.dims().iter().map(|&d| d as i64).collect();
            let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let value = ort::value::Tensor::from_array((shape, data))
                .map_err(|e| OrtRuntimeError::Inference(e.to_string()))?;
            feeds.push(((*name).to_string(), value));
        }

        let outputs = self.session.run(feeds).map_err(|e| OrtRuntimeError::Inference(e.to_string()))?;

        let mut result = HashMap::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let Some(output) = outputs.get(name.as_str()) else { continue };
            let (shape, data) = output
                .try_extract_tensor::<f32>()
                .map_err(|e| OrtRuntimeError::Inference(format!("output `{name}`: {e}")))?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            result.insert(name.clone(), Tensor::from_slice(data, dims, &Device::Cpu)?);
        }
        Ok(result)
    }
}
