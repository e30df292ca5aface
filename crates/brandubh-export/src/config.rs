//! Conversion configuration with TOML, environment variable and default
//! sources.
//!
//! Precedence, lowest first: [`ExportConfig::default`], a TOML file,
//! `BRANDUBH_*` environment variables, then command-line flags layered on
//! with [`ExportConfigBuilder`].

use std::path::Path;
use std::{env, fmt, fs};

use brandubh_net::{ArchitectureOverrides, DEFAULT_VARIANCE_CEILING, NetworkVariant, NumericMode};
use brandubh_onnx::checker::MAX_OPSET;
use brandubh_quantization::{DEFAULT_CALIBRATION_SAMPLES, QuantizationConfig};
use serde::{Deserialize, Serialize};

use crate::export::{DEFAULT_OPSET, MIN_EXPORT_OPSET};
use crate::verify::DEFAULT_TOLERANCE;

// -- Errors ------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown network variant `{0}` (expected auto, plain or se)")]
    UnknownVariant(String),

    #[error("unknown log format `{0}` (expected pretty, compact or json)")]
    UnknownLogFormat(String),

    #[error("invalid environment variable value for {key}: {value}")]
    InvalidEnvVar { key: String, value: String },
}

// -- VariantChoice -----------------------------------------------------------

/// Network variant as requested by the user; `Auto` detects it from keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariantChoice {
    #[default]
    Auto,
    Plain,
    #[serde(alias = "squeeze_excitation")]
    Se,
}

impl VariantChoice {
    pub fn resolve(self) -> Option<NetworkVariant> {
        match self {
            Self::Auto => None,
            Self::Plain => Some(NetworkVariant::Plain),
            Self::Se => Some(NetworkVariant::SqueezeExcitation),
        }
    }
}

impl fmt::Display for VariantChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Plain => write!(f, "plain"),
            Self::Se => write!(f, "se"),
        }
    }
}

impl std::str::FromStr for VariantChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "plain" => Ok(Self::Plain),
            "se" | "squeeze_excitation" | "squeeze-excitation" => Ok(Self::Se),
            other => Err(ConfigError::UnknownVariant(other.to_string())),
        }
    }
}

// -- LogFormat ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::UnknownLogFormat(other.to_string())),
        }
    }
}

// -- Sections ----------------------------------------------------------------

/// Architecture overrides and pre-export repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub variant: VariantChoice,
    pub num_residual_blocks: Option<usize>,
    pub num_channels: Option<usize>,
    pub value_head_hidden_size: Option<usize>,
    /// Batch-norm running variances above this are clamped.
    pub variance_ceiling: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            variant: VariantChoice::Auto,
            num_residual_blocks: None,
            num_channels: None,
            value_head_hidden_size: None,
            variance_ceiling: DEFAULT_VARIANCE_CEILING,
        }
    }
}

impl ModelConfig {
    pub fn overrides(&self) -> ArchitectureOverrides {
        ArchitectureOverrides {
            num_residual_blocks: self.num_residual_blocks,
            num_channels: self.num_channels,
            value_head_hidden_size: self.value_head_hidden_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub opset: i64,
    pub flush_subnormals: bool,
    /// Initializers of at least this many bytes go to an external-data
    /// side-car before canonicalization re-embeds them.
    pub external_data_threshold: Option<usize>,
    /// Run the exported artifact (and its quantized copy) after writing.
    pub verify: bool,
    /// Max absolute difference tolerated between artifact and network.
    pub verify_tolerance: f32,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            opset: DEFAULT_OPSET,
            flush_subnormals: true,
            external_data_threshold: None,
            verify: false,
            verify_tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl ArtifactConfig {
    pub fn numeric_mode(&self) -> NumericMode {
        NumericMode { flush_subnormals: self.flush_subnormals }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizeConfig {
    pub enabled: bool,
    pub calibration_samples: usize,
    pub calibration_seed: Option<u64>,
}

impl Default for QuantizeConfig {
    fn default() -> Self {
        Self { enabled: false, calibration_samples: DEFAULT_CALIBRATION_SAMPLES, calibration_seed: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

// -- ExportConfig ------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub model: ModelConfig,
    pub export: ArtifactConfig,
    pub quantization: QuantizeConfig,
    pub logging: LoggingConfig,
}

impl ExportConfig {
    pub fn builder() -> ExportConfigBuilder {
        ExportConfigBuilder::new(Self::default())
    }

    /// Layer further settings on top of this configuration.
    pub fn into_builder(self) -> ExportConfigBuilder {
        ExportConfigBuilder::new(self)
    }

    /// Parse a TOML file. Missing sections and keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Ok(toml::from_str(&text)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Defaults with `BRANDUBH_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// File (when given) then environment, validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("BRANDUBH_VARIANT") {
            self.model.variant = v.parse()?;
        }
        if let Ok(v) = env::var("BRANDUBH_VARIANCE_CEILING") {
            self.model.variance_ceiling = parse_env("BRANDUBH_VARIANCE_CEILING", &v)?;
        }
        if let Ok(v) = env::var("BRANDUBH_OPSET") {
            self.export.opset = parse_env("BRANDUBH_OPSET", &v)?;
        }
        if let Ok(v) = env::var("BRANDUBH_FLUSH_SUBNORMALS") {
            self.export.flush_subnormals = parse_env_bool("BRANDUBH_FLUSH_SUBNORMALS", &v)?;
        }
        if let Ok(v) = env::var("BRANDUBH_EXTERNAL_DATA_THRESHOLD") {
            self.export.external_data_threshold = match v.to_ascii_lowercase().as_str() {
                "" | "none" => None,
                _ => Some(parse_env("BRANDUBH_EXTERNAL_DATA_THRESHOLD", &v)?),
            };
        }
        if let Ok(v) = env::var("BRANDUBH_VERIFY") {
            self.export.verify = parse_env_bool("BRANDUBH_VERIFY", &v)?;
        }
        if let Ok(v) = env::var("BRANDUBH_QUANTIZE") {
            self.quantization.enabled = parse_env_bool("BRANDUBH_QUANTIZE", &v)?;
        }
        if let Ok(v) = env::var("BRANDUBH_CALIBRATION_SAMPLES") {
            self.quantization.calibration_samples = parse_env("BRANDUBH_CALIBRATION_SAMPLES", &v)?;
        }
        if let Ok(v) = env::var("BRANDUBH_CALIBRATION_SEED") {
            self.quantization.calibration_seed = Some(parse_env("BRANDUBH_CALIBRATION_SEED", &v)?);
        }
        if let Ok(v) = env::var("BRANDUBH_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = env::var("BRANDUBH_LOG_FORMAT") {
            self.logging.format = v.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("num_residual_blocks", self.model.num_residual_blocks),
            ("num_channels", self.model.num_channels),
            ("value_head_hidden_size", self.model.value_head_hidden_size),
        ];
        for (field, value) in fields {
            if value == Some(0) {
                return Err(ConfigError::Validation(format!("{field} must be >= 1 when set")));
            }
        }
        if !(self.model.variance_ceiling.is_finite() && self.model.variance_ceiling > 0.0) {
            return Err(ConfigError::Validation(format!(
                "variance_ceiling must be a positive number, got {}",
                self.model.variance_ceiling
            )));
        }
        if !(MIN_EXPORT_OPSET..=MAX_OPSET).contains(&self.export.opset) {
            return Err(ConfigError::Validation(format!(
                "opset {} is outside the supported range {MIN_EXPORT_OPSET}..={MAX_OPSET}",
                self.export.opset
            )));
        }
        if self.export.external_data_threshold == Some(0) {
            return Err(ConfigError::Validation("external_data_threshold must be > 0 when set".into()));
        }
        if !(self.export.verify_tolerance.is_finite() && self.export.verify_tolerance > 0.0) {
            return Err(ConfigError::Validation("verify_tolerance must be a positive number".into()));
        }
        if self.quantization.calibration_samples == 0 {
            return Err(ConfigError::Validation("calibration_samples must be >= 1".into()));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Validation("logging.level must not be empty".into()));
        }
        Ok(())
    }

    /// Settings handed to the static quantizer.
    pub fn quantization_config(&self) -> QuantizationConfig {
        QuantizationConfig {
            calibration_samples: self.quantization.calibration_samples,
            calibration_seed: self.quantization.calibration_seed,
            flush_subnormals: self.export.flush_subnormals,
            ..QuantizationConfig::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, val: &str) -> Result<T, ConfigError> {
    val.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidEnvVar { key: key.to_string(), value: val.to_string() })
}

fn parse_env_bool(key: &str, val: &str) -> Result<bool, ConfigError> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvVar { key: key.to_string(), value: val.to_string() }),
    }
}

// -- Builder -----------------------------------------------------------------

/// Field-by-field overlay, validated on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ExportConfigBuilder {
    config: ExportConfig,
}

impl ExportConfigBuilder {
    pub fn new(base: ExportConfig) -> Self {
        Self { config: base }
    }

    pub fn variant(mut self, variant: VariantChoice) -> Self {
        self.config.model.variant = variant;
        self
    }

    pub fn num_residual_blocks(mut self, blocks: usize) -> Self {
        self.config.model.num_residual_blocks = Some(blocks);
        self
    }

    pub fn num_channels(mut self, channels: usize) -> Self {
        self.config.model.num_channels = Some(channels);
        self
    }

    pub fn value_head_hidden_size(mut self, size: usize) -> Self {
        self.config.model.value_head_hidden_size = Some(size);
        self
    }

    pub fn variance_ceiling(mut self, ceiling: f32) -> Self {
        self.config.model.variance_ceiling = ceiling;
        self
    }

    pub fn opset(mut self, opset: i64) -> Self {
        self.config.export.opset = opset;
        self
    }

    pub fn flush_subnormals(mut self, flush: bool) -> Self {
        self.config.export.flush_subnormals = flush;
        self
    }

    pub fn external_data_threshold(mut self, bytes: usize) -> Self {
        self.config.export.external_data_threshold = Some(bytes);
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.config.export.verify = verify;
        self
    }

    pub fn quantize(mut self, enabled: bool) -> Self {
        self.config.quantization.enabled = enabled;
        self
    }

    pub fn calibration_samples(mut self, samples: usize) -> Self {
        self.config.quantization.calibration_samples = samples;
        self
    }

    pub fn calibration_seed(mut self, seed: u64) -> Self {
        self.config.quantization.calibration_seed = Some(seed);
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.logging.format = format;
        self
    }

    pub fn build(self) -> Result<ExportConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests;
