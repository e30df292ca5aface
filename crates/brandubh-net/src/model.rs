//! The Brandubh policy/value network.
//!
//! Layout: a 3x3 convolution stem, a tower of residual blocks (each
//! optionally gated by squeeze-excitation), a policy head over 1176 moves and
//! a scalar value head. Batch-norm layers always run with their running
//! statistics, i.e. in inference mode.

use std::collections::BTreeSet;

use candle_core::{D, DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module};
use serde::Serialize;
use tracing::debug;

use crate::arch::{Architecture, NetworkVariant};
use crate::error::{ParameterLoadError, ParameterShapeMismatchError};
use crate::names::{self, block_key};
use crate::numeric::NumericMode;
use crate::params::ParameterMap;

pub const BOARD_SIZE: usize = 7;
pub const BOARD_CELLS: usize = BOARD_SIZE * BOARD_SIZE;
pub const INPUT_PLANES: usize = 4;
pub const POLICY_PLANES: usize = 2;
pub const VALUE_PLANES: usize = 1;
/// 49 source squares times 24 orthogonal destinations.
pub const POLICY_SIZE: usize = 1176;
pub const SE_REDUCTION: usize = 4;
pub const BN_EPS: f64 = 1e-5;

/// Shape of one network input sample.
pub const INPUT_SHAPE: [usize; 4] = [1, INPUT_PLANES, BOARD_SIZE, BOARD_SIZE];

/// One expected parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub required: bool,
}

impl ParameterSpec {
    fn required(name: impl Into<String>, shape: &[usize]) -> Self {
        Self { name: name.into(), shape: shape.to_vec(), required: true }
    }

    fn optional(name: impl Into<String>, shape: &[usize]) -> Self {
        Self { name: name.into(), shape: shape.to_vec(), required: false }
    }
}

fn conv_specs(out: &mut Vec<ParameterSpec>, prefix: &str, shape: [usize; 4]) {
    out.push(ParameterSpec::required(format!("{prefix}.weight"), &shape));
    out.push(ParameterSpec::optional(format!("{prefix}.bias"), &shape[..1]));
}

fn bn_specs(out: &mut Vec<ParameterSpec>, prefix: &str, channels: usize) {
    for leaf in ["weight", "bias", "running_mean", "running_var"] {
        out.push(ParameterSpec::required(format!("{prefix}.{leaf}"), &[channels]));
    }
    out.push(ParameterSpec::optional(format!("{prefix}.num_batches_tracked"), &[]));
}

fn linear_specs(out: &mut Vec<ParameterSpec>, prefix: &str, out_features: usize, in_features: usize) {
    out.push(ParameterSpec::required(format!("{prefix}.weight"), &[out_features, in_features]));
    out.push(ParameterSpec::required(format!("{prefix}.bias"), &[out_features]));
}

/// Every parameter the network declares for `arch`, in module order.
pub fn parameter_specs(arch: &Architecture) -> Vec<ParameterSpec> {
    let c = arch.num_channels;
    let h = arch.value_head_hidden_size;
    let mut specs = Vec::new();

    conv_specs(&mut specs, "conv_input", [c, INPUT_PLANES, 3, 3]);
    bn_specs(&mut specs, "bn_input", c);
    for i in 0..arch.num_residual_blocks {
        let prefix = format!("{}.{i}", names::RESIDUAL_PREFIX);
        conv_specs(&mut specs, &format!("{prefix}.conv1"), [c, c, 3, 3]);
        bn_specs(&mut specs, &format!("{prefix}.bn1"), c);
        conv_specs(&mut specs, &format!("{prefix}.conv2"), [c, c, 3, 3]);
        bn_specs(&mut specs, &format!("{prefix}.bn2"), c);
        if arch.variant == NetworkVariant::SqueezeExcitation {
            let s = arch.se_hidden();
            linear_specs(&mut specs, &format!("{prefix}.se.0"), s, c);
            linear_specs(&mut specs, &format!("{prefix}.se.2"), c, s);
        }
    }
    conv_specs(&mut specs, "conv_policy", [POLICY_PLANES, c, 1, 1]);
    bn_specs(&mut specs, "bn_policy", POLICY_PLANES);
    linear_specs(&mut specs, "fc_policy", POLICY_SIZE, POLICY_PLANES * BOARD_CELLS);
    conv_specs(&mut specs, "conv_value", [VALUE_PLANES, c, 1, 1]);
    bn_specs(&mut specs, "bn_value", VALUE_PLANES);
    linear_specs(&mut specs, "fc_value1", h, VALUE_PLANES * BOARD_CELLS);
    linear_specs(&mut specs, "fc_value2", 1, h);
    specs
}

/// Generate a structurally valid parameter map with random values.
///
/// Weights are scaled by fan-in, running variances stay within `[0.5, 1.5)`.
/// Used for fixtures and round-trip tests.
pub fn synthetic_parameters(arch: &Architecture, device: &Device) -> candle_core::Result<ParameterMap> {
    let mut params = ParameterMap::new();
    for spec in parameter_specs(arch) {
        let tensor = if names::is_batch_counter(&spec.name) {
            Tensor::new(0i64, device)?
        } else if spec.name.ends_with(".running_var") {
            Tensor::rand(0.5f32, 1.5, spec.shape.as_slice(), device)?
        } else if spec.name.ends_with(".running_mean") || spec.name.ends_with(".bias") {
            Tensor::randn(0f32, 0.05, spec.shape.as_slice(), device)?
        } else if spec.name.starts_with("bn") || spec.name.contains(".bn") {
            Tensor::rand(0.8f32, 1.2, spec.shape.as_slice(), device)?
        } else {
            let fan_in: usize = spec.shape[1..].iter().product::<usize>().max(1);
            Tensor::randn(0f32, (1.0 / fan_in as f64).sqrt() as f32, spec.shape.as_slice(), device)?
        };
        params.insert(spec.name, tensor);
    }
    Ok(params)
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// Inference-mode 2D batch normalization over the channel axis.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub weight: Tensor,
    pub bias: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub eps: f64,
}

impl BatchNorm2d {
    fn load(params: &ParameterMap, prefix: &str) -> Result<Self, ParameterLoadError> {
        Ok(Self {
            weight: take(params, &format!("{prefix}.weight"))?,
            bias: take(params, &format!("{prefix}.bias"))?,
            running_mean: take(params, &format!("{prefix}.running_mean"))?,
            running_var: take(params, &format!("{prefix}.running_var"))?,
            eps: BN_EPS,
        })
    }

    pub fn channels(&self) -> usize {
        self.weight.elem_count()
    }

    /// Per-channel affine form `y = x * scale + shift`.
    pub fn scale_and_shift(&self) -> candle_core::Result<(Tensor, Tensor)> {
        let scale = self.weight.broadcast_div(&(&self.running_var + self.eps)?.sqrt()?)?;
        let shift = (&self.bias - self.running_mean.mul(&scale)?)?;
        Ok((scale, shift))
    }

    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (scale, shift) = self.scale_and_shift()?;
        let shape = (1, self.channels(), 1, 1);
        xs.broadcast_mul(&scale.reshape(shape)?)?.broadcast_add(&shift.reshape(shape)?)
    }
}

/// Fold `bn` into the convolution that feeds it.
///
/// Returns the rescaled kernel and the combined bias.
pub fn fold_batch_norm(conv: &Conv2d, bn: &BatchNorm2d) -> candle_core::Result<(Tensor, Tensor)> {
    let (scale, shift) = bn.scale_and_shift()?;
    let weight = conv.weight().broadcast_mul(&scale.reshape((bn.channels(), 1, 1, 1))?)?;
    let bias = match conv.bias() {
        Some(b) => (b.mul(&scale)? + shift)?,
        None => shift,
    };
    Ok((weight, bias))
}

/// Channel gate: global average pool, bottleneck MLP, sigmoid.
#[derive(Debug, Clone)]
pub struct SqueezeExcitation {
    pub fc1: Linear,
    pub fc2: Linear,
}

impl SqueezeExcitation {
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let pooled = xs.mean((2, 3))?;
        let hidden = self.fc1.forward(&pooled)?.relu()?;
        let gate = candle_nn::ops::sigmoid(&self.fc2.forward(&hidden)?)?;
        xs.broadcast_mul(&gate.unsqueeze(2)?.unsqueeze(3)?)
    }
}

#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub conv1: Conv2d,
    pub bn1: BatchNorm2d,
    pub conv2: Conv2d,
    pub bn2: BatchNorm2d,
    pub se: Option<SqueezeExcitation>,
}

impl ResidualBlock {
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let out = self.bn1.forward(&self.conv1.forward(xs)?)?.relu()?;
        let mut out = self.bn2.forward(&self.conv2.forward(&out)?)?;
        if let Some(se) = &self.se {
            out = se.forward(&out)?;
        }
        (out + xs)?.relu()
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// An instantiated network holding its own tensors.
#[derive(Debug, Clone)]
pub struct BrandubhNet {
    pub arch: Architecture,
    pub conv_input: Conv2d,
    pub bn_input: BatchNorm2d,
    pub res_blocks: Vec<ResidualBlock>,
    pub conv_policy: Conv2d,
    pub bn_policy: BatchNorm2d,
    pub fc_policy: Linear,
    pub conv_value: Conv2d,
    pub bn_value: BatchNorm2d,
    pub fc_value1: Linear,
    pub fc_value2: Linear,
}

impl BrandubhNet {
    /// Strictly load `params` into a network shaped by `arch`.
    ///
    /// Shape disagreements are reported first, then missing required
    /// parameters, then parameters the architecture does not declare.
    pub fn load(arch: &Architecture, params: &ParameterMap) -> Result<Self, ParameterLoadError> {
        let specs = parameter_specs(arch);

        for spec in &specs {
            let Some(tensor) = params.get(&spec.name) else { continue };
            if names::is_batch_counter(&spec.name) {
                continue;
            }
            if tensor.dims() != spec.shape.as_slice() {
                return Err(ParameterShapeMismatchError {
                    name: spec.name.clone(),
                    expected: spec.shape.clone(),
                    actual: tensor.dims().to_vec(),
                }
                .into());
            }
        }

        let missing: Vec<String> = specs
            .iter()
            .filter(|s| s.required && !params.contains_key(&s.name))
            .map(|s| s.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ParameterLoadError::MissingParameters(missing));
        }

        let declared: BTreeSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        let unexpected: Vec<String> =
            params.keys().filter(|k| !declared.contains(k)).map(str::to_owned).collect();
        if !unexpected.is_empty() {
            return Err(ParameterLoadError::UnexpectedParameters(unexpected));
        }

        let mut res_blocks = Vec::with_capacity(arch.num_residual_blocks);
        for i in 0..arch.num_residual_blocks {
            let se = match arch.variant {
                NetworkVariant::Plain => None,
                NetworkVariant::SqueezeExcitation => Some(SqueezeExcitation {
                    fc1: linear(params, &block_key(i, "se.0"))?,
                    fc2: linear(params, &block_key(i, "se.2"))?,
                }),
            };
            res_blocks.push(ResidualBlock {
                conv1: conv(params, &block_key(i, "conv1"), 1)?,
                bn1: BatchNorm2d::load(params, &block_key(i, "bn1"))?,
                conv2: conv(params, &block_key(i, "conv2"), 1)?,
                bn2: BatchNorm2d::load(params, &block_key(i, "bn2"))?,
                se,
            });
        }

        let net = Self {
            arch: *arch,
            conv_input: conv(params, "conv_input", 1)?,
            bn_input: BatchNorm2d::load(params, "bn_input")?,
            res_blocks,
            conv_policy: conv(params, "conv_policy", 0)?,
            bn_policy: BatchNorm2d::load(params, "bn_policy")?,
            fc_policy: linear(params, "fc_policy")?,
            conv_value: conv(params, "conv_value", 0)?,
            bn_value: BatchNorm2d::load(params, "bn_value")?,
            fc_value1: linear(params, "fc_value1")?,
            fc_value2: linear(params, "fc_value2")?,
        };
        debug!(parameters = specs.len(), "network instantiated");
        Ok(net)
    }

    /// Run a batch `[N, 4, 7, 7]`, returning `(policy [N, 1176], value [N, 1])`.
    ///
    /// The policy is a probability distribution per row, the value lies in
    /// `[-1, 1]`.
    pub fn forward(&self, xs: &Tensor, mode: NumericMode) -> candle_core::Result<(Tensor, Tensor)> {
        let dims = xs.dims();
        if dims.len() != 4 || dims[1..] != INPUT_SHAPE[1..] {
            candle_core::bail!("expected input [N, 4, 7, 7], got {dims:?}")
        }
        let batch = dims[0];

        let mut x = self.bn_input.forward(&self.conv_input.forward(&mode.apply(xs)?)?)?.relu()?;
        for block in &self.res_blocks {
            x = mode.apply(&block.forward(&x)?)?;
        }

        let p = self.bn_policy.forward(&self.conv_policy.forward(&x)?)?.relu()?;
        let p = self.fc_policy.forward(&p.reshape((batch, POLICY_PLANES * BOARD_CELLS))?)?;
        let policy = candle_nn::ops::softmax(&p, D::Minus1)?;

        let v = self.bn_value.forward(&self.conv_value.forward(&x)?)?.relu()?;
        let v = self.fc_value1.forward(&v.reshape((batch, VALUE_PLANES * BOARD_CELLS))?)?.relu()?;
        let value = self.fc_value2.forward(&v)?.tanh()?;

        Ok((mode.apply(&policy)?, mode.apply(&value)?))
    }

    /// Every batch-norm layer with its parameter prefix, in module order.
    pub fn batch_norms(&self) -> Vec<(String, &BatchNorm2d)> {
        let mut out = vec![("bn_input".to_string(), &self.bn_input)];
        for (i, block) in self.res_blocks.iter().enumerate() {
            out.push((block_key(i, "bn1"), &block.bn1));
            out.push((block_key(i, "bn2"), &block.bn2));
        }
        out.push(("bn_policy".to_string(), &self.bn_policy));
        out.push(("bn_value".to_string(), &self.bn_value));
        out
    }

    pub fn batch_norms_mut(&mut self) -> Vec<(String, &mut BatchNorm2d)> {
        let mut out = vec![("bn_input".to_string(), &mut self.bn_input)];
        for (i, block) in self.res_blocks.iter_mut().enumerate() {
            out.push((block_key(i, "bn1"), &mut block.bn1));
            out.push((block_key(i, "bn2"), &mut block.bn2));
        }
        out.push(("bn_policy".to_string(), &mut self.bn_policy));
        out.push(("bn_value".to_string(), &mut self.bn_value));
        out
    }

    pub fn device(&self) -> &Device {
        self.conv_input.weight().device()
    }

    /// A deterministic sample board batch of shape [`INPUT_SHAPE`].
    pub fn sample_input(&self) -> candle_core::Result<Tensor> {
        let n: usize = INPUT_SHAPE.iter().product();
        let values: Vec<f32> = (0..n).map(|i| ((i * 7919) % 13) as f32 / 13.0).collect();
        Tensor::from_vec(values, INPUT_SHAPE.as_slice(), self.device())?.to_dtype(DType::F32)
    }
}

fn take(params: &ParameterMap, name: &str) -> Result<Tensor, ParameterLoadError> {
    params
        .get(name)
        .cloned()
        .ok_or_else(|| ParameterLoadError::MissingParameters(vec![name.to_string()]))
}

fn conv(params: &ParameterMap, prefix: &str, padding: usize) -> Result<Conv2d, ParameterLoadError> {
    let weight = take(params, &format!("{prefix}.weight"))?;
    let bias = params.get(&format!("{prefix}.bias")).cloned();
    Ok(Conv2d::new(weight, bias, Conv2dConfig { padding, ..Default::default() }))
}

fn linear(params: &ParameterMap, prefix: &str) -> Result<Linear, ParameterLoadError> {
    let weight = take(params, &format!("{prefix}.weight"))?;
    let bias = take(params, &format!("{prefix}.bias"))?;
    Ok(Linear::new(weight, Some(bias)))
}
