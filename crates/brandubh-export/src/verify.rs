//! Post-export smoke run of an artifact under onnxruntime.
//!
//! Nothing here is fatal: problems are collected as warnings, and the
//! artifact stays on disk either way.

use std::path::{Path, PathBuf};

use brandubh_net::{BrandubhNet, INPUT_SHAPE, NumericMode, POLICY_SIZE};
use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::{info, warn};

use crate::export::{INPUT_NAME, POLICY_OUTPUT, VALUE_OUTPUT};
use crate::onnxruntime::OrtSession;

/// Default max absolute difference between artifact and network outputs.
pub const DEFAULT_TOLERANCE: f32 = 1e-4;

/// Allowed drift of the policy sum from 1.
const POLICY_SUM_SLACK: f32 = 1e-3;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationReport {
    pub artifact: PathBuf,
    pub policy_shape: Vec<usize>,
    pub value_shape: Vec<usize>,
    pub policy_sum: Option<f32>,
    pub value: Option<f32>,
    /// Largest output difference against the network, when one was given.
    pub max_abs_diff: Option<f32>,
    pub warnings: Vec<String>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InferenceVerifier {
    mode: NumericMode,
    /// `None` reports the difference without judging it (quantized artifacts).
    tolerance: Option<f32>,
}

impl InferenceVerifier {
    pub fn new(mode: NumericMode) -> Self {
        Self { mode, tolerance: Some(DEFAULT_TOLERANCE) }
    }

    pub fn with_tolerance(mut self, tolerance: Option<f32>) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Run `artifact` on one random board and check its outputs.
    pub fn verify(&self, artifact: &Path, reference: Option<&BrandubhNet>) -> VerificationReport {
        let mut report = VerificationReport { artifact: artifact.to_path_buf(), ..Default::default() };
        let input = match Tensor::randn(0f32, 1.0, INPUT_SHAPE.as_slice(), &Device::Cpu) {
            Ok(input) => input,
            Err(e) => {
                report.warn(format!("cannot create a test input: {e}"));
                return report;
            }
        };
        if let Err(message) = self.check(artifact, &input, reference, &mut report) {
            report.warn(format!("Inference test failed: {message}. Model may still work in browser"));
        }
        report
    }

    fn check(
        &self,
        artifact: &Path,
        input: &Tensor,
        reference: Option<&BrandubhNet>,
        report: &mut VerificationReport,
    ) -> Result<(), String> {
        let mut session = OrtSession::from_file(artifact, self.mode).map_err(|e| e.to_string())?;
        let mut outputs = session.run(&[(INPUT_NAME, input.clone())]).map_err(|e| e.to_string())?;
        let policy = outputs.remove(POLICY_OUTPUT).ok_or("artifact produced no `policy` output")?;
        let value = outputs.remove(VALUE_OUTPUT).ok_or("artifact produced no `value` output")?;

        report.policy_shape = policy.dims().to_vec();
        report.value_shape = value.dims().to_vec();
        info!("Policy output shape: {:?}", report.policy_shape);
        info!("Value output shape: {:?}", report.value_shape);
        if report.policy_shape != [1, POLICY_SIZE] {
            report.warn(format!("policy shape {:?}, expected [1, {POLICY_SIZE}]", report.policy_shape));
        }
        if report.value_shape != [1, 1] {
            report.warn(format!("value shape {:?}, expected [1, 1]", report.value_shape));
        }

        let policy_sum = scalar(policy.sum_all())?;
        let value_scalar = scalar(value.flatten_all().and_then(|v| v.get(0)))?;
        report.policy_sum = Some(policy_sum);
        report.value = Some(value_scalar);
        info!("Policy sum: {policy_sum:.4} (should be ~1.0)");
        info!("Value: {value_scalar:.4}");
        if !((policy_sum - 1.0).abs() <= POLICY_SUM_SLACK) {
            report.warn(format!("policy sums to {policy_sum}, expected 1"));
        }
        if !(-1.0..=1.0).contains(&value_scalar) {
            report.warn(format!("value {value_scalar} is outside [-1, 1]"));
        }

        if let Some(net) = reference {
            let (expected_policy, expected_value) = net.forward(input, self.mode).map_err(|e| e.to_string())?;
            let diff = max_abs_diff(&policy, &expected_policy)?.max(max_abs_diff(&value, &expected_value)?);
            report.max_abs_diff = Some(diff);
            info!("Max abs difference vs network: {diff:.3e}");
            if let Some(tolerance) = self.tolerance
                && !(diff <= tolerance)
            {
                report.warn(format!("outputs differ from the network by {diff:.3e} (tolerance {tolerance:.1e})"));
            }
        }
        Ok(())
    }
}

fn scalar(t: candle_core::Result<Tensor>) -> Result<f32, String> {
    t.and_then(|t| t.to_scalar::<f32>()).map_err(|e| e.to_string())
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32, String> {
    scalar((a - b).and_then(|d| d.abs()).and_then(|d| d.max_all()))
}
