// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parameter naming conventions of the Brandubh network.
//!
//! Centralizes the key patterns that architecture inference, strict loading
//! and the exporter agree on. Keys follow the PyTorch module hierarchy:
//! `res_blocks.<i>.conv1.weight`, `bn_input.running_var`, ...

/// Weight of the stem convolution; its leading dim is the channel count.
pub const INPUT_CONV_WEIGHT: &str = "conv_input.weight";
/// Prefix of every residual-block parameter.
pub const RESIDUAL_PREFIX: &str = "res_blocks";
/// First value-head fully-connected weight; its leading dim is the hidden size.
pub const VALUE_FC1_WEIGHT: &str = "fc_value1.weight";

/// Suffix that signals a plain residual block (first convolution weight).
pub const PLAIN_BLOCK_SIGNAL: &str = "conv1.weight";
/// Suffix that signals a squeeze-excitation block (second SE weight).
pub const SE_BLOCK_SIGNAL: &str = "se.2.weight";

/// Error from [`parse_block_index`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedIndex {
    pub key: String,
    pub token: String,
}

/// Integer token following `res_blocks.` in a dotted key.
///
/// Returns `Ok(None)` for keys outside the residual tower and an error when
/// the token after the prefix is not a non-negative integer.
///
/// # Examples
///
/// ```
/// use brandubh_net::names::parse_block_index;
///
/// assert_eq!(parse_block_index("res_blocks.3.conv1.weight"), Ok(Some(3)));
/// assert_eq!(parse_block_index("conv_input.weight"), Ok(None));
/// assert!(parse_block_index("res_blocks.x.conv1.weight").is_err());
/// ```
pub fn parse_block_index(key: &str) -> Result<Option<usize>, MalformedIndex> {
    let mut parts = key.split('.');
    if parts.next() != Some(RESIDUAL_PREFIX) {
        return Ok(None);
    }
    let token = parts.next().unwrap_or_default();
    token
        .parse::<usize>()
        .map(Some)
        .map_err(|_| MalformedIndex { key: key.to_string(), token: token.to_string() })
}

/// Whether `key` is the plain-variant block signal `res_blocks.<i>.conv1.weight`.
pub fn is_plain_block_signal(key: &str) -> bool {
    key.starts_with("res_blocks.") && key.ends_with(&format!(".{PLAIN_BLOCK_SIGNAL}"))
}

/// Whether `key` is the SE-variant block signal `res_blocks.<i>.se.2.weight`.
pub fn is_se_block_signal(key: &str) -> bool {
    key.starts_with("res_blocks.") && key.ends_with(&format!(".{SE_BLOCK_SIGNAL}"))
}

/// Whether `key` belongs to a squeeze-excitation sub-module.
///
/// ```
/// use brandubh_net::names::is_se_parameter;
///
/// assert!(is_se_parameter("res_blocks.0.se.0.bias"));
/// assert!(!is_se_parameter("res_blocks.0.conv1.weight"));
/// ```
pub fn is_se_parameter(key: &str) -> bool {
    key.starts_with("res_blocks.") && key.contains(".se.")
}

/// BatchNorm bookkeeping counters carry no numeric information.
pub fn is_batch_counter(key: &str) -> bool {
    key.ends_with(".num_batches_tracked")
}

pub fn block_key(index: usize, leaf: &str) -> String {
    format!("{RESIDUAL_PREFIX}.{index}.{leaf}")
}
