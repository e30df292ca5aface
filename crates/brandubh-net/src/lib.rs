//! Brandubh policy/value network.
//!
//! This crate turns a training checkpoint into an instantiated, numerically
//! sane network:
//!
//! 1. [`StateStore`] reads a PyTorch or safetensors checkpoint and unwraps it
//!    to a [`ParameterMap`].
//! 2. [`infer_architecture`] derives the [`Architecture`] from parameter
//!    names and shapes alone.
//! 3. [`BrandubhNet::load`] instantiates the network, rejecting any shape,
//!    missing or unexpected parameter.
//! 4. [`NumericStabilizer`] clamps out-of-range batch-norm statistics.
//!
//! ```no_run
//! use std::path::Path;
//! use brandubh_net::{ArchitectureOverrides, BrandubhNet, NumericStabilizer, StateStore, infer_architecture};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let params = StateStore::default().open(Path::new("brandubh_model.pt"))?;
//! let arch = infer_architecture(params.shapes(), None, &ArchitectureOverrides::default())?;
//! let mut net = BrandubhNet::load(&arch, &params)?;
//! let report = NumericStabilizer::default().stabilize(&mut net)?;
//! assert_eq!(report.layers_inspected, 2 * arch.num_residual_blocks + 3);
//! # Ok(())
//! # }
//! ```

pub mod arch;
pub mod checkpoint;
pub mod error;
pub mod model;
pub mod names;
pub mod numeric;
pub mod params;
pub mod stabilize;

pub use arch::{
    Architecture, ArchitectureOverrides, DEFAULT_VALUE_HEAD_HIDDEN_SIZE, NetworkVariant, detect_variant,
    infer_architecture,
};
pub use checkpoint::{
    CheckpointContainer, CheckpointFormat, ContainerKind, StateStore, detect_container, save_safetensors,
};
pub use error::{
    ArchitectureInferenceError, CheckpointLoadError, ParameterLoadError, ParameterShapeMismatchError,
};
pub use model::{
    BatchNorm2d, BrandubhNet, INPUT_SHAPE, POLICY_SIZE, ParameterSpec, ResidualBlock, SqueezeExcitation,
    fold_batch_norm, parameter_specs, synthetic_parameters,
};
pub use numeric::NumericMode;
pub use params::ParameterMap;
pub use stabilize::{DEFAULT_VARIANCE_CEILING, NumericStabilizer, StabilityReport};
