//! MinMax range collection.

use std::collections::HashMap;

use brandubh_onnx::{Session, Value};
use tracing::{debug, info};

use crate::calibration::CalibrationDataReader;
use crate::error::{QuantizationError, Result};

/// Observed `[min, max]` of one float tensor across all samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorRange {
    pub min: f32,
    pub max: f32,
}

impl TensorRange {
    fn empty() -> Self {
        Self { min: f32::INFINITY, max: f32::NEG_INFINITY }
    }

    fn update(&mut self, values: &[f32]) {
        for &v in values.iter().filter(|v| v.is_finite()) {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
    }

    fn is_observed(&self) -> bool {
        self.min <= self.max
    }
}

/// Per-tensor ranges keyed by value name.
#[derive(Debug, Clone, Default)]
pub struct CalibrationRanges {
    ranges: HashMap<String, TensorRange>,
    samples: usize,
}

impl CalibrationRanges {
    pub fn get(&self, name: &str) -> Option<TensorRange> {
        self.ranges.get(name).copied().filter(TensorRange::is_observed)
    }

    pub fn require(&self, name: &str) -> Result<TensorRange> {
        self.get(name).ok_or_else(|| QuantizationError::MissingRange { tensor: name.to_string() })
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Run every sample from `reader` through `session`, recording the range of
/// each float graph input and node output.
///
/// The reader is drained exactly once.
pub fn collect_ranges(session: &Session, reader: &mut dyn CalibrationDataReader) -> Result<CalibrationRanges> {
    let mut out = CalibrationRanges::default();
    while let Some(sample) = reader.get_next() {
        let mut failure = None;
        session
            .run_with_observer(&[(sample.input_name.as_str(), sample.tensor)], |name, value: &Value| {
                if !value.is_float() || failure.is_some() {
                    return;
                }
                match value.to_vec() {
                    Ok(values) => {
                        out.ranges.entry(name.to_string()).or_insert_with(TensorRange::empty).update(&values)
                    }
                    Err(e) => failure = Some(e),
                }
            })
            .map_err(QuantizationError::Calibration)?;
        if let Some(e) = failure {
            return Err(QuantizationError::Calibration(e));
        }
        out.samples += 1;
    }

    if out.samples == 0 {
        return Err(QuantizationError::EmptyCalibration);
    }
    info!(samples = out.samples, tensors = out.ranges.len(), "Calibration complete");
    for (name, range) in &out.ranges {
        debug!(tensor = %name, min = range.min, max = range.max, "calibrated range");
    }
    Ok(out)
}

#[cfg(test)]
impl CalibrationRanges {
    pub(crate) fn from_pairs(pairs: &[(&str, f32, f32)]) -> Self {
        let ranges = pairs
            .iter()
            .map(|&(name, min, max)| (name.to_string(), TensorRange { min, max }))
            .collect();
        Self { ranges, samples: 1 }
    }
}
