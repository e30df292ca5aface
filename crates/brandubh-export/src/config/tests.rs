//! Configuration tests

use super::*;
use serial_test::serial;
use std::io::Write;
use std::sync::Mutex;
use tempfile::NamedTempFile;

// Environment variable tests must not interleave
static ENV_TEST_MUTEX: Mutex<()> = Mutex::new(());

fn acquire_env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_TEST_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const ENV_VARS: [&str; 11] = [
    "BRANDUBH_VARIANT",
    "BRANDUBH_VARIANCE_CEILING",
    "BRANDUBH_OPSET",
    "BRANDUBH_FLUSH_SUBNORMALS",
    "BRANDUBH_EXTERNAL_DATA_THRESHOLD",
    "BRANDUBH_VERIFY",
    "BRANDUBH_QUANTIZE",
    "BRANDUBH_CALIBRATION_SAMPLES",
    "BRANDUBH_CALIBRATION_SEED",
    "BRANDUBH_LOG_LEVEL",
    "BRANDUBH_LOG_FORMAT",
];

fn clear_env() {
    for var in ENV_VARS {
        unsafe {
            env::remove_var(var);
        }
    }
}

fn toml_file(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file
}

#[test]
fn test_default_config() {
    let config = ExportConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.model.variant, VariantChoice::Auto);
    assert_eq!(config.model.variance_ceiling, 10.0);
    assert_eq!(config.export.opset, 14);
    assert!(config.export.flush_subnormals);
    assert!(!config.export.verify);
    assert!(!config.quantization.enabled);
    assert_eq!(config.quantization.calibration_samples, 50);
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert!(config.model.overrides() == ArchitectureOverrides::default());
}

#[test]
fn test_config_builder() {
    let config = ExportConfig::builder()
        .variant(VariantChoice::Se)
        .num_channels(64)
        .opset(17)
        .quantize(true)
        .calibration_samples(8)
        .calibration_seed(7)
        .flush_subnormals(false)
        .build()
        .unwrap();

    assert_eq!(config.model.variant.resolve(), Some(NetworkVariant::SqueezeExcitation));
    assert_eq!(config.model.overrides().num_channels, Some(64));
    assert_eq!(config.model.overrides().num_residual_blocks, None);
    assert_eq!(config.export.opset, 17);
    assert!(!config.export.numeric_mode().flush_subnormals);

    let quant = config.quantization_config();
    assert_eq!(quant.calibration_samples, 8);
    assert_eq!(quant.calibration_seed, Some(7));
    assert!(!quant.flush_subnormals);
}

#[test]
fn test_config_validation() {
    let mut config = ExportConfig::default();
    config.export.opset = 10;
    assert!(config.validate().is_err());

    config = ExportConfig::default();
    config.export.opset = 22;
    assert!(config.validate().is_err());

    config = ExportConfig::default();
    config.model.num_channels = Some(0);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("num_channels"));

    config = ExportConfig::default();
    config.model.variance_ceiling = f32::NAN;
    assert!(config.validate().is_err());

    config = ExportConfig::default();
    config.quantization.calibration_samples = 0;
    assert!(config.validate().is_err());

    config = ExportConfig::default();
    config.export.external_data_threshold = Some(0);
    assert!(config.validate().is_err());

    assert!(ExportConfig::builder().opset(21).build().is_ok());
    assert!(ExportConfig::builder().opset(11).build().is_ok());
}

#[test]
fn test_variant_and_format_parsing() {
    assert_eq!("SE".parse::<VariantChoice>().unwrap(), VariantChoice::Se);
    assert_eq!("squeeze-excitation".parse::<VariantChoice>().unwrap(), VariantChoice::Se);
    assert_eq!("plain".parse::<VariantChoice>().unwrap().resolve(), Some(NetworkVariant::Plain));
    assert!(matches!("resnet".parse::<VariantChoice>(), Err(ConfigError::UnknownVariant(_))));

    for format in [LogFormat::Pretty, LogFormat::Compact, LogFormat::Json] {
        assert_eq!(format.to_string().parse::<LogFormat>().unwrap(), format);
    }
    assert!("xml".parse::<LogFormat>().is_err());
}

#[test]
#[serial]
fn test_toml_config_loading() {
    let _lock = acquire_env_lock();
    clear_env();

    let temp_file = toml_file(
        r#"
[model]
variant = "se"
num_residual_blocks = 6
variance_ceiling = 4.0

[export]
opset = 13
external_data_threshold = 1024
verify = true

[quantization]
enabled = true
calibration_samples = 16

[logging]
level = "debug"
format = "json"
"#,
    );

    let config = ExportConfig::from_file(temp_file.path()).unwrap();
    assert_eq!(config.model.variant, VariantChoice::Se);
    assert_eq!(config.model.num_residual_blocks, Some(6));
    assert_eq!(config.model.num_channels, None);
    assert_eq!(config.model.variance_ceiling, 4.0);
    assert_eq!(config.export.opset, 13);
    assert_eq!(config.export.external_data_threshold, Some(1024));
    assert!(config.export.verify);
    assert!(config.export.flush_subnormals);
    assert!(config.quantization.enabled);
    assert_eq!(config.quantization.calibration_samples, 16);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_toml_round_trip() {
    let config = ExportConfig::builder().num_residual_blocks(3).quantize(true).build().unwrap();
    let text = config.to_toml().unwrap();
    let parsed: ExportConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed, config);
}

#[test]
fn test_invalid_toml_is_error() {
    let temp_file = toml_file("[export]\nopset = \"fourteen\"\n");
    assert!(matches!(ExportConfig::from_file(temp_file.path()), Err(ConfigError::TomlParse(_))));

    let missing = std::path::Path::new("/nonexistent/brandubh.toml");
    assert!(matches!(ExportConfig::from_file(missing), Err(ConfigError::Io { .. })));
}

#[test]
#[serial]
fn test_env_overrides() {
    let _lock = acquire_env_lock();
    clear_env();

    unsafe {
        env::set_var("BRANDUBH_VARIANT", "plain");
        env::set_var("BRANDUBH_OPSET", "17");
        env::set_var("BRANDUBH_FLUSH_SUBNORMALS", "off");
        env::set_var("BRANDUBH_QUANTIZE", "1");
        env::set_var("BRANDUBH_CALIBRATION_SEED", "99");
        env::set_var("BRANDUBH_EXTERNAL_DATA_THRESHOLD", "4096");
        env::set_var("BRANDUBH_LOG_FORMAT", "compact");
    }

    let config = ExportConfig::from_env().unwrap();
    assert_eq!(config.model.variant, VariantChoice::Plain);
    assert_eq!(config.export.opset, 17);
    assert!(!config.export.flush_subnormals);
    assert!(config.quantization.enabled);
    assert_eq!(config.quantization.calibration_seed, Some(99));
    assert_eq!(config.export.external_data_threshold, Some(4096));
    assert_eq!(config.logging.format, LogFormat::Compact);

    unsafe {
        env::set_var("BRANDUBH_EXTERNAL_DATA_THRESHOLD", "none");
    }
    let config = ExportConfig::from_env().unwrap();
    assert_eq!(config.export.external_data_threshold, None);

    clear_env();
}

#[test]
#[serial]
fn test_invalid_env_value() {
    let _lock = acquire_env_lock();
    clear_env();

    unsafe {
        env::set_var("BRANDUBH_CALIBRATION_SAMPLES", "many");
    }
    let err = ExportConfig::from_env().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidEnvVar { ref key, .. } if key == "BRANDUBH_CALIBRATION_SAMPLES"));

    clear_env();
    unsafe {
        env::set_var("BRANDUBH_VERIFY", "maybe");
    }
    assert!(ExportConfig::from_env().is_err());

    clear_env();
}

#[test]
#[serial]
fn test_config_loader_precedence() {
    let _lock = acquire_env_lock();
    clear_env();

    let temp_file = toml_file(
        r#"
[export]
opset = 13
verify = true

[quantization]
calibration_samples = 20
"#,
    );

    // Environment overrides the file
    unsafe {
        env::set_var("BRANDUBH_OPSET", "15");
    }
    let loaded = ExportConfig::load(Some(temp_file.path())).unwrap();
    assert_eq!(loaded.export.opset, 15);
    assert!(loaded.export.verify);
    assert_eq!(loaded.quantization.calibration_samples, 20);

    // Command-line flags override both
    let config = loaded.into_builder().opset(16).calibration_samples(5).build().unwrap();
    assert_eq!(config.export.opset, 16);
    assert_eq!(config.quantization.calibration_samples, 5);
    assert!(config.export.verify);

    clear_env();
}

#[test]
#[serial]
fn test_load_rejects_invalid_merged_config() {
    let _lock = acquire_env_lock();
    clear_env();

    unsafe {
        env::set_var("BRANDUBH_OPSET", "9");
    }
    assert!(matches!(ExportConfig::load(None), Err(ConfigError::Validation(_))));

    clear_env();
}
