//! Batch-norm variance repair applied before export.

use serde::Serialize;
use tracing::{info, warn};

use crate::model::BrandubhNet;

/// Running-variance ceiling applied when none is configured.
pub const DEFAULT_VARIANCE_CEILING: f32 = 10.0;

/// Outcome of one stabilization pass. Diagnostics only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StabilityReport {
    /// Largest running variance seen across all layers before clamping.
    pub max_statistic_before_repair: f32,
    pub layers_repaired: usize,
    pub layers_inspected: usize,
    pub ceiling: f32,
    /// Prefixes of the clamped layers.
    pub repaired: Vec<String>,
}

impl StabilityReport {
    pub fn is_healthy(&self) -> bool {
        self.layers_repaired == 0
    }
}

/// Clamps batch-norm running variances to a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct NumericStabilizer {
    ceiling: f32,
}

impl Default for NumericStabilizer {
    fn default() -> Self {
        Self { ceiling: DEFAULT_VARIANCE_CEILING }
    }
}

impl NumericStabilizer {
    pub fn new(ceiling: f32) -> Self {
        Self { ceiling }
    }

    pub fn ceiling(&self) -> f32 {
        self.ceiling
    }

    /// Visit every batch-norm layer; a layer whose max running variance
    /// exceeds the ceiling has all its variances clamped to the ceiling.
    pub fn stabilize(&self, model: &mut BrandubhNet) -> candle_core::Result<StabilityReport> {
        let mut report = StabilityReport {
            max_statistic_before_repair: f32::NEG_INFINITY,
            layers_repaired: 0,
            layers_inspected: 0,
            ceiling: self.ceiling,
            repaired: Vec::new(),
        };

        for (name, bn) in model.batch_norms_mut() {
            report.layers_inspected += 1;
            let max = bn.running_var.max_all()?.to_scalar::<f32>()?;
            report.max_statistic_before_repair = report.max_statistic_before_repair.max(max);
            if max > self.ceiling {
                warn!("{name}: running_var max {max:.3} exceeds {}, clamping", self.ceiling);
                bn.running_var = bn.running_var.minimum(self.ceiling)?;
                report.layers_repaired += 1;
                report.repaired.push(name);
            }
        }

        if report.layers_repaired > 0 {
            info!(
                repaired = report.layers_repaired,
                inspected = report.layers_inspected,
                "Clamped batch-norm running variances to {}",
                self.ceiling
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Architecture, NetworkVariant};
    use crate::model::synthetic_parameters;
    use candle_core::{Device, Tensor};

    fn net() -> BrandubhNet {
        let arch = Architecture::new(1, 4, NetworkVariant::Plain);
        BrandubhNet::load(&arch, &synthetic_parameters(&arch, &Device::Cpu).unwrap()).unwrap()
    }

    fn set_var(net: &mut BrandubhNet, values: &[f32]) {
        net.res_blocks[0].bn1.running_var = Tensor::new(values, &Device::Cpu).unwrap();
    }

    #[test]
    fn oversized_variance_is_clamped() {
        let mut net = net();
        set_var(&mut net, &[1.0, 25.0, 4.0, 11.0]);
        let report = NumericStabilizer::default().stabilize(&mut net).unwrap();
        assert_eq!(report.layers_repaired, 1);
        assert_eq!(report.repaired, ["res_blocks.0.bn1"]);
        assert_eq!(report.max_statistic_before_repair, 25.0);
        assert_eq!(
            net.res_blocks[0].bn1.running_var.to_vec1::<f32>().unwrap(),
            vec![1.0, 10.0, 4.0, 10.0]
        );
    }

    #[test]
    fn healthy_layers_are_untouched() {
        let mut net = net();
        set_var(&mut net, &[3.0, 0.5, 2.0, 1.0]);
        let report = NumericStabilizer::default().stabilize(&mut net).unwrap();
        assert!(report.is_healthy());
        assert_eq!(report.layers_inspected, 5);
        assert_eq!(
            net.res_blocks[0].bn1.running_var.to_vec1::<f32>().unwrap(),
            vec![3.0, 0.5, 2.0, 1.0]
        );
    }

    #[test]
    fn second_pass_repairs_nothing() {
        let mut net = net();
        set_var(&mut net, &[40.0, 1.0, 1.0, 1.0]);
        let stabilizer = NumericStabilizer::new(5.0);
        assert_eq!(stabilizer.stabilize(&mut net).unwrap().layers_repaired, 1);
        let second = stabilizer.stabilize(&mut net).unwrap();
        assert_eq!(second.layers_repaired, 0);
        assert_eq!(second.max_statistic_before_repair, 5.0);
    }
}
