//! Quantization parameter selection.

use std::fmt;

use brandubh_onnx::DataType;
use brandubh_onnx::runtime::quantize_value;
use serde::{Deserialize, Serialize};

/// Target integer type of a quantized tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantType {
    QUInt8,
    QInt8,
}

impl QuantType {
    pub fn data_type(self) -> DataType {
        match self {
            QuantType::QUInt8 => DataType::Uint8,
            QuantType::QInt8 => DataType::Int8,
        }
    }

    /// Representable range `(qmin, qmax)`.
    pub fn range(self) -> (f32, f32) {
        match self {
            QuantType::QUInt8 => (0.0, 255.0),
            QuantType::QInt8 => (-128.0, 127.0),
        }
    }
}

impl fmt::Display for QuantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantType::QUInt8 => write!(f, "QUInt8"),
            QuantType::QInt8 => write!(f, "QInt8"),
        }
    }
}

/// Per-tensor affine mapping `real = (q - zero_point) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
    pub qtype: QuantType,
}

impl QuantParams {
    /// Asymmetric parameters for an observed activation range.
    ///
    /// The range is widened to contain zero so that zero is exactly
    /// representable (padding and ReLU outputs rely on it).
    pub fn for_activation(min: f32, max: f32) -> Self {
        let qtype = QuantType::QUInt8;
        let (qmin, qmax) = qtype.range();
        let rmin = min.min(0.0);
        let rmax = max.max(0.0);
        let scale = (rmax - rmin) / (qmax - qmin);
        if !(scale.is_finite() && scale > 0.0) {
            return Self { scale: 1.0, zero_point: 0, qtype };
        }
        let zero_point = (qmin - rmin / scale).round_ties_even().clamp(qmin, qmax) as i32;
        Self { scale, zero_point, qtype }
    }

    /// Symmetric signed parameters for a weight tensor, restricted to
    /// `[-127, 127]`.
    pub fn for_weight(values: &[f32]) -> Self {
        let qtype = QuantType::QInt8;
        let absmax = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let scale = if absmax > 0.0 && absmax.is_finite() { absmax / 127.0 } else { 1.0 };
        Self { scale, zero_point: 0, qtype }
    }

    pub fn quantize(&self, x: f32) -> f32 {
        let (qmin, qmax) = match self.qtype {
            QuantType::QInt8 => (-127.0, 127.0),
            QuantType::QUInt8 => self.qtype.range(),
        };
        quantize_value(x, self.scale, self.zero_point as f32, (qmin, qmax))
    }

    pub fn dequantize(&self, q: f32) -> f32 {
        (q - self.zero_point as f32) * self.scale
    }

    pub fn quantize_u8(&self, values: &[f32]) -> Vec<u8> {
        values.iter().map(|&v| self.quantize(v) as u8).collect()
    }

    pub fn quantize_i8(&self, values: &[f32]) -> Vec<i8> {
        values.iter().map(|&v| self.quantize(v) as i8).collect()
    }
}

/// Bias values as INT32 at scale `input_scale * weight_scale`, zero point 0.
pub fn quantize_bias(values: &[f32], input_scale: f32, weight_scale: f32) -> Vec<i32> {
    let scale = input_scale * weight_scale;
    let bounds = (i32::MIN as f32, i32::MAX as f32);
    values.iter().map(|&v| quantize_value(v, scale, 0.0, bounds) as i32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn activation_range_includes_zero() {
        let p = QuantParams::for_activation(0.5, 2.55);
        assert_eq!(p.zero_point, 0);
        assert!((p.scale - 0.01).abs() < 1e-6);
        assert_eq!(p.quantize(0.0), 0.0);

        let p = QuantParams::for_activation(-1.0, -0.2);
        assert_eq!(p.zero_point, 255);
        assert_eq!(p.quantize(0.0), 255.0);
    }

    #[test]
    fn degenerate_range_falls_back_to_unit_scale() {
        let p = QuantParams::for_activation(0.0, 0.0);
        assert_eq!((p.scale, p.zero_point), (1.0, 0));
        assert_eq!(QuantParams::for_weight(&[0.0, 0.0]).scale, 1.0);
    }

    #[test]
    fn weights_are_symmetric_and_avoid_minus_128() {
        let p = QuantParams::for_weight(&[-2.54, 1.0, 0.5]);
        assert_eq!(p.zero_point, 0);
        assert_eq!(p.quantize_i8(&[-2.54, 2.54, -10.0]), vec![-127, 127, -127]);
    }

    #[test]
    fn bias_uses_product_scale() {
        assert_eq!(quantize_bias(&[0.5, -0.25], 0.1, 0.05), vec![100, -50]);
    }

    proptest! {
        #[test]
        fn activation_round_trip_error_is_within_half_step(
            lo in -50.0f32..0.0,
            span in 0.01f32..100.0,
            t in 0.0f32..1.0,
        ) {
            let hi = lo + span;
            let p = QuantParams::for_activation(lo, hi);
            let x = lo + t * span;
            let restored = p.dequantize(p.quantize(x));
            prop_assert!((restored - x).abs() <= p.scale * 0.5 + 1e-4, "{x} -> {restored}");
        }
    }
}
