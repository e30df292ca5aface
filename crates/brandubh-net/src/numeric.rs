//! Numeric policy for a conversion run.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Explicit replacement for a process-wide "flush denormals" switch.
///
/// The mode is passed to every component that produces tensor values
/// (forward pass, exporter, reference runtime) for the duration of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericMode {
    /// Replace subnormal `f32` values with signed zero.
    pub flush_subnormals: bool,
}

impl Default for NumericMode {
    fn default() -> Self {
        Self { flush_subnormals: true }
    }
}

impl NumericMode {
    pub const EXACT: NumericMode = NumericMode { flush_subnormals: false };

    /// Flush subnormals in place, returning how many values changed.
    pub fn apply_to_slice(&self, values: &mut [f32]) -> usize {
        if !self.flush_subnormals {
            return 0;
        }
        let mut flushed = 0;
        for v in values.iter_mut().filter(|v| v.is_subnormal()) {
            *v = 0.0f32.copysign(*v);
            flushed += 1;
        }
        flushed
    }

    pub fn apply(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        if !self.flush_subnormals {
            return Ok(tensor.clone());
        }
        let mut values = tensor.flatten_all()?.to_vec1::<f32>()?;
        if self.apply_to_slice(&mut values) == 0 {
            return Ok(tensor.clone());
        }
        Tensor::from_vec(values, tensor.dims(), tensor.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn flushing_keeps_sign_and_normals() {
        let tiny = f32::MIN_POSITIVE / 2.0;
        let mut values = [tiny, -tiny, 1.0, f32::MIN_POSITIVE];
        assert_eq!(NumericMode::default().apply_to_slice(&mut values), 2);
        assert_eq!(values[0].to_bits(), 0.0f32.to_bits());
        assert_eq!(values[1].to_bits(), (-0.0f32).to_bits());
        assert_eq!(&values[2..], &[1.0, f32::MIN_POSITIVE]);
    }

    #[test]
    fn exact_mode_is_identity() {
        let tiny = f32::MIN_POSITIVE / 8.0;
        let t = Tensor::new(&[tiny, 2.0], &Device::Cpu).unwrap();
        let out = NumericMode::EXACT.apply(&t).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![tiny, 2.0]);
    }
}
