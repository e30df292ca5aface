//! Calibration data for static quantization.
//!
//! Calibration only needs inputs that exercise realistic activation ranges.
//! [`SyntheticCalibrationReader`] draws standard-normal board tensors, a
//! stand-in for positions sampled from self-play games; any other source can
//! be plugged in through [`CalibrationDataReader`].

use std::collections::VecDeque;

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::error::Result;

/// Default number of calibration samples.
pub const DEFAULT_CALIBRATION_SAMPLES: usize = 50;

/// One named input tensor fed to the model during calibration.
#[derive(Debug, Clone)]
pub struct CalibrationSample {
    pub input_name: String,
    pub tensor: Tensor,
}

/// A finite, single-pass source of calibration samples.
pub trait CalibrationDataReader {
    /// The next sample, or `None` once the set is exhausted. Every call after
    /// exhaustion keeps returning `None`.
    fn get_next(&mut self) -> Option<CalibrationSample>;
}

/// Pre-generated standard-normal samples.
#[derive(Debug)]
pub struct SyntheticCalibrationReader {
    samples: VecDeque<CalibrationSample>,
}

impl SyntheticCalibrationReader {
    /// Generate `count` samples of `shape` up front.
    ///
    /// With `seed` the values are reproducible; without it every reader
    /// draws fresh entropy.
    pub fn new(count: usize, shape: &[usize], input_name: &str, seed: Option<u64>) -> Result<Self> {
        let mut rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let numel: usize = shape.iter().product();

        let mut samples = VecDeque::with_capacity(count);
        for _ in 0..count {
            let values: Vec<f32> = (0..numel).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
            let tensor = Tensor::from_vec(values, shape, &Device::Cpu)?;
            samples.push_back(CalibrationSample { input_name: input_name.to_string(), tensor });
        }
        debug!(count, ?shape, seeded = seed.is_some(), "generated calibration samples");
        Ok(Self { samples })
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl CalibrationDataReader for SyntheticCalibrationReader {
    fn get_next(&mut self) -> Option<CalibrationSample> {
        self.samples.pop_front()
    }
}

impl Iterator for SyntheticCalibrationReader {
    type Item = CalibrationSample;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next()
    }
}
