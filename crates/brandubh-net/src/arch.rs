//! Architecture inference from parameter names and shapes.
//!
//! Inference never touches tensor values, only `(name, shape)` pairs, so it
//! can be exercised without a numeric back-end.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ArchitectureInferenceError;
use crate::names::{self, INPUT_CONV_WEIGHT, VALUE_FC1_WEIGHT};

/// Value-head hidden size assumed when `fc_value1.weight` is absent.
///
/// This is the historical training default, not a property of every
/// checkpoint; pass an override when a checkpoint was trained differently.
pub const DEFAULT_VALUE_HEAD_HIDDEN_SIZE: usize = 64;

/// Residual block flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkVariant {
    Plain,
    #[serde(alias = "se")]
    SqueezeExcitation,
}

impl NetworkVariant {
    /// Key suffix whose presence marks one residual block of this variant.
    pub fn block_signal(self) -> &'static str {
        match self {
            NetworkVariant::Plain => names::PLAIN_BLOCK_SIGNAL,
            NetworkVariant::SqueezeExcitation => names::SE_BLOCK_SIGNAL,
        }
    }

    fn matches_block_signal(self, key: &str) -> bool {
        match self {
            NetworkVariant::Plain => names::is_plain_block_signal(key),
            NetworkVariant::SqueezeExcitation => names::is_se_block_signal(key),
        }
    }
}

impl fmt::Display for NetworkVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkVariant::Plain => write!(f, "plain"),
            NetworkVariant::SqueezeExcitation => write!(f, "squeeze-excitation"),
        }
    }
}

/// Structural hyper-parameters of a Brandubh network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Architecture {
    pub num_residual_blocks: usize,
    pub num_channels: usize,
    pub value_head_hidden_size: usize,
    pub variant: NetworkVariant,
}

impl Architecture {
    pub fn new(num_residual_blocks: usize, num_channels: usize, variant: NetworkVariant) -> Self {
        Self {
            num_residual_blocks,
            num_channels,
            value_head_hidden_size: DEFAULT_VALUE_HEAD_HIDDEN_SIZE,
            variant,
        }
    }

    pub fn with_value_head_hidden_size(mut self, size: usize) -> Self {
        self.value_head_hidden_size = size;
        self
    }

    /// Hidden width of each squeeze-excitation gate.
    pub fn se_hidden(&self) -> usize {
        (self.num_channels / crate::model::SE_REDUCTION).max(1)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} residual blocks, {} channels, value head {} ({})",
            self.num_residual_blocks, self.num_channels, self.value_head_hidden_size, self.variant
        )
    }
}

/// Explicit values that take precedence over inference, field by field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureOverrides {
    pub num_residual_blocks: Option<usize>,
    pub num_channels: Option<usize>,
    pub value_head_hidden_size: Option<usize>,
}

impl ArchitectureOverrides {
    pub fn is_complete(&self) -> bool {
        self.num_residual_blocks.is_some()
            && self.num_channels.is_some()
            && self.value_head_hidden_size.is_some()
    }

    fn validate(&self) -> Result<(), ArchitectureInferenceError> {
        let fields = [
            ("num_residual_blocks", self.num_residual_blocks),
            ("num_channels", self.num_channels),
            ("value_head_hidden_size", self.value_head_hidden_size),
        ];
        for (field, value) in fields {
            if value == Some(0) {
                return Err(ArchitectureInferenceError::InvalidOverride { field, value: 0 });
            }
        }
        Ok(())
    }
}

/// Whether any parameter belongs to a squeeze-excitation gate.
pub fn detect_variant<'a>(mut keys: impl Iterator<Item = &'a str>) -> NetworkVariant {
    if keys.any(names::is_se_parameter) {
        NetworkVariant::SqueezeExcitation
    } else {
        NetworkVariant::Plain
    }
}

/// Derive an [`Architecture`] from `(name, shape)` pairs.
///
/// `variant` of `None` auto-detects. Overridden fields are taken verbatim and
/// their structural signal is not required.
pub fn infer_architecture<'a, I>(
    shapes: I,
    variant: Option<NetworkVariant>,
    overrides: &ArchitectureOverrides,
) -> Result<Architecture, ArchitectureInferenceError>
where
    I: IntoIterator<Item = (&'a str, &'a [usize])>,
    I::IntoIter: Clone,
{
    overrides.validate()?;
    let shapes = shapes.into_iter();
    let variant = variant.unwrap_or_else(|| detect_variant(shapes.clone().map(|(k, _)| k)));

    let num_channels = match overrides.num_channels {
        Some(c) => c,
        None => leading_dim(shapes.clone(), INPUT_CONV_WEIGHT)?
            .ok_or(ArchitectureInferenceError::MissingInputConv { key: INPUT_CONV_WEIGHT })?,
    };

    let num_residual_blocks = match overrides.num_residual_blocks {
        Some(n) => n,
        None => count_blocks(shapes.clone(), variant)?,
    };

    let value_head_hidden_size = match overrides.value_head_hidden_size {
        Some(h) => h,
        None => match leading_dim(shapes, VALUE_FC1_WEIGHT)? {
            Some(h) => h,
            None => {
                debug!(
                    "{VALUE_FC1_WEIGHT} absent; using default hidden size {DEFAULT_VALUE_HEAD_HIDDEN_SIZE}"
                );
                DEFAULT_VALUE_HEAD_HIDDEN_SIZE
            }
        },
    };

    let arch = Architecture { num_residual_blocks, num_channels, value_head_hidden_size, variant };
    info!("Detected architecture: {arch}");
    Ok(arch)
}

fn leading_dim<'a>(
    mut shapes: impl Iterator<Item = (&'a str, &'a [usize])>,
    key: &str,
) -> Result<Option<usize>, ArchitectureInferenceError> {
    match shapes.find(|(k, _)| *k == key) {
        None => Ok(None),
        Some((_, [first, ..])) if *first > 0 => Ok(Some(*first)),
        Some((_, shape)) => {
            Err(ArchitectureInferenceError::InvalidShape { key: key.to_string(), shape: shape.to_vec() })
        }
    }
}

fn count_blocks<'a>(
    shapes: impl Iterator<Item = (&'a str, &'a [usize])>,
    variant: NetworkVariant,
) -> Result<usize, ArchitectureInferenceError> {
    let mut max_index: Option<usize> = None;
    for (key, _) in shapes.filter(|(k, _)| variant.matches_block_signal(k)) {
        let index = names::parse_block_index(key)
            .map_err(|e| ArchitectureInferenceError::MalformedBlockIndex { key: e.key, token: e.token })?
            .unwrap_or_default();
        max_index = Some(max_index.map_or(index, |m| m.max(index)));
    }
    max_index.map(|m| m + 1).ok_or_else(|| ArchitectureInferenceError::NoResidualBlocks {
        pattern: format!("{}.<i>.{}", names::RESIDUAL_PREFIX, variant.block_signal()),
    })
}
