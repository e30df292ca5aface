//! End-to-end conversions of generated checkpoints.

use std::fs;
use std::path::{Path, PathBuf};

use brandubh_export::{
    ConversionError, ConversionPipeline, ConversionStage, ExportConfig, OrtSession, QuantizationOutcome,
};
use brandubh_net::{
    Architecture, BrandubhNet, CheckpointContainer, ContainerKind, INPUT_SHAPE, NetworkVariant, NumericMode,
    ParameterLoadError, ParameterMap, save_safetensors, synthetic_parameters,
};
use brandubh_onnx::{ArtifactChecker, load_model, side_car_path};
use brandubh_quantization::quantized_artifact_path;
use candle_core::{Device, Tensor};

fn write_checkpoint(dir: &Path, arch: &Architecture) -> (PathBuf, ParameterMap) {
    let params = synthetic_parameters(arch, &Device::Cpu).unwrap();
    let container = CheckpointContainer::TrainingCheckpoint { parameters: params.clone(), iteration: Some(1200) };
    let path = dir.join("brandubh_model.safetensors");
    save_safetensors(&container, &path).unwrap();
    (path, params)
}

fn run_artifact(path: &Path, input: &Tensor) -> (Vec<f32>, Vec<f32>) {
    let mut session = OrtSession::from_file(path, NumericMode::default()).unwrap();
    let mut outputs = session.run(&[("input", input.clone())]).unwrap();
    let policy = outputs.remove("policy").unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let value = outputs.remove("value").unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    (policy, value)
}

fn max_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

fn board() -> Tensor {
    Tensor::randn(0f32, 1.0, INPUT_SHAPE.as_slice(), &Device::Cpu).unwrap()
}

// ---------------------------------------------------------------------------
// FP32 conversion
// ---------------------------------------------------------------------------

#[test]
fn training_checkpoint_converts_next_to_itself() {
    let dir = tempfile::tempdir().unwrap();
    let arch = Architecture::new(2, 16, NetworkVariant::Plain).with_value_head_hidden_size(32);
    let (checkpoint, params) = write_checkpoint(dir.path(), &arch);

    let config = ExportConfig::builder().verify(true).build().unwrap();
    let mut pipeline = ConversionPipeline::new(config).unwrap();
    let outcome = pipeline.run(&checkpoint, None).unwrap();

    let artifact = dir.path().join("brandubh_model.onnx");
    assert_eq!(outcome.artifact(), artifact.as_path());
    assert!(artifact.is_file());
    assert!(!side_car_path(&artifact).exists());
    assert_eq!(pipeline.current_stage(), Some(ConversionStage::Verify));

    assert_eq!(outcome.container, ContainerKind::TrainingCheckpoint);
    assert_eq!(outcome.iteration, Some(1200));
    assert_eq!(outcome.architecture, arch);
    assert!(outcome.stability.is_healthy());
    assert_eq!(outcome.summary.opset, Some(14));
    assert_eq!(outcome.summary.inputs[0].name, "input");
    assert_eq!(outcome.summary.inputs[0].shape, vec!["dynamic", "4", "7", "7"]);
    let outputs: Vec<&str> = outcome.summary.outputs.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(outputs, ["policy", "value"]);
    assert!(outcome.verification.as_ref().unwrap().passed());
    assert!(outcome.quantization.is_none());

    let net = BrandubhNet::load(&arch, &params).unwrap();
    let input = board();
    let (policy, value) = run_artifact(&artifact, &input);
    let (expected_policy, expected_value) = net.forward(&input, NumericMode::default()).unwrap();
    assert_eq!(policy.len(), 1176);
    assert!(max_diff(&policy, &expected_policy.flatten_all().unwrap().to_vec1().unwrap()) < 1e-4);
    assert!(max_diff(&value, &expected_value.flatten_all().unwrap().to_vec1().unwrap()) < 1e-4);
}

#[test]
fn pipeline_can_be_reused_for_a_second_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let arch = Architecture::new(1, 8, NetworkVariant::Plain);
    let (checkpoint, _) = write_checkpoint(dir.path(), &arch);
    let first = dir.path().join("a.onnx");
    let second = dir.path().join("b.onnx");

    let config = ExportConfig::builder().quantize(true).calibration_samples(2).calibration_seed(5).build().unwrap();
    let mut pipeline = ConversionPipeline::new(config).unwrap();
    pipeline.run(&checkpoint, Some(&first)).unwrap();
    let outcome = pipeline.run(&checkpoint, Some(&second)).unwrap();

    assert_eq!(outcome.artifact(), second.as_path());
    assert!(matches!(outcome.quantization, Some(QuantizationOutcome::Completed { .. })));
    assert_eq!(pipeline.current_stage(), Some(ConversionStage::Quantize));
    assert!(first.is_file() && second.is_file());
    assert!(dir.path().join("b.quant.onnx").is_file());
}

#[test]
fn external_data_is_folded_back_into_a_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let arch = Architecture::new(1, 16, NetworkVariant::Plain);
    let (checkpoint, _) = write_checkpoint(dir.path(), &arch);

    let inline = dir.path().join("inline.onnx");
    ConversionPipeline::new(ExportConfig::default()).unwrap().run(&checkpoint, Some(&inline)).unwrap();

    let split = dir.path().join("split.onnx");
    let config = ExportConfig::builder().external_data_threshold(1024).build().unwrap();
    let outcome = ConversionPipeline::new(config).unwrap().run(&checkpoint, Some(&split)).unwrap();

    assert!(outcome.export.external_tensors > 0);
    assert_eq!(outcome.canonicalization.tensors_embedded, outcome.export.external_tensors);
    assert!(outcome.canonicalization.rewritten);
    assert_eq!(outcome.canonicalization.side_cars_removed, vec![side_car_path(&split)]);
    assert!(!side_car_path(&split).exists());

    // the artifact alone, moved away from its directory, still runs
    let elsewhere = tempfile::tempdir().unwrap();
    let moved = elsewhere.path().join("model.onnx");
    fs::copy(&split, &moved).unwrap();
    assert!(load_model(&moved).unwrap().graph.initializer.iter().all(|t| !t.is_external()));

    let input = board();
    assert_eq!(run_artifact(&moved, &input), run_artifact(&inline, &input));
}

#[test]
fn squeeze_excitation_checkpoint_is_detected_and_exported() {
    let dir = tempfile::tempdir().unwrap();
    let arch = Architecture::new(2, 16, NetworkVariant::SqueezeExcitation);
    let (checkpoint, params) = write_checkpoint(dir.path(), &arch);

    let outcome = ConversionPipeline::new(ExportConfig::default()).unwrap().run(&checkpoint, None).unwrap();
    assert_eq!(outcome.architecture.variant, NetworkVariant::SqueezeExcitation);

    let net = BrandubhNet::load(&arch, &params).unwrap();
    let input = board();
    let (policy, _) = run_artifact(outcome.artifact(), &input);
    let (expected, _) = net.forward(&input, NumericMode::default()).unwrap();
    assert!(max_diff(&policy, &expected.flatten_all().unwrap().to_vec1().unwrap()) < 1e-4);
}

#[test]
fn conflicting_channel_override_fails_while_instantiating() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, _) = write_checkpoint(dir.path(), &Architecture::new(2, 32, NetworkVariant::Plain));

    let config = ExportConfig::builder().num_channels(64).build().unwrap();
    let err = ConversionPipeline::new(config).unwrap().run(&checkpoint, None).unwrap_err();

    assert_eq!(err.stage(), ConversionStage::Instantiate);
    match err {
        ConversionError::Parameters(ParameterLoadError::ShapeMismatch(mismatch)) => {
            assert_eq!(mismatch.name, "conv_input.weight");
        }
        other => panic!("expected a shape mismatch, got {other:?}"),
    }
    assert!(!dir.path().join("brandubh_model.onnx").exists());
}

// ---------------------------------------------------------------------------
// Quantization
// ---------------------------------------------------------------------------

#[test]
fn quantized_artifact_is_smaller_valid_and_runs() {
    let dir = tempfile::tempdir().unwrap();
    let arch = Architecture::new(2, 32, NetworkVariant::Plain);
    let (checkpoint, _) = write_checkpoint(dir.path(), &arch);

    let config = ExportConfig::builder().verify(true).quantize(true).calibration_samples(8).calibration_seed(7).build().unwrap();
    let outcome = ConversionPipeline::new(config).unwrap().run(&checkpoint, None).unwrap();

    let fp32 = dir.path().join("brandubh_model.onnx");
    let int8 = dir.path().join("brandubh_model.quant.onnx");
    let Some(QuantizationOutcome::Completed { report, verification }) = &outcome.quantization else {
        panic!("quantization did not complete: {:?}", outcome.quantization);
    };
    assert_eq!(report.output, int8);
    assert_eq!(report.calibration_samples, 8);
    assert!(fs::metadata(&int8).unwrap().len() < fs::metadata(&fp32).unwrap().len());

    let model = load_model(&int8).unwrap();
    assert!(ArtifactChecker::default().check_model(&model).into_result().is_ok());
    let verification = verification.as_ref().unwrap();
    assert!(verification.passed(), "{:?}", verification.warnings);
    assert_eq!(verification.policy_shape, vec![1, 1176]);

    let (policy, value) = run_artifact(&int8, &board());
    assert!((policy.iter().sum::<f32>() - 1.0).abs() < 1e-3);
    assert!((-1.0..=1.0).contains(&value[0]));
}

#[test]
fn quantization_failure_keeps_the_fp32_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, _) = write_checkpoint(dir.path(), &Architecture::new(1, 8, NetworkVariant::Plain));

    // a non-empty directory where the quantized file should go
    let fp32 = dir.path().join("brandubh_model.onnx");
    let blocked = quantized_artifact_path(&fp32);
    fs::create_dir(&blocked).unwrap();
    fs::write(blocked.join("keep"), b"x").unwrap();

    let config = ExportConfig::builder().quantize(true).calibration_samples(2).build().unwrap();
    let outcome = ConversionPipeline::new(config).unwrap().run(&checkpoint, None).unwrap();

    assert!(outcome.quantization_failed());
    assert!(fp32.is_file());
    assert!(blocked.is_dir());
    match &outcome.quantization {
        Some(QuantizationOutcome::Failed { output, error }) => {
            assert_eq!(output, &blocked);
            assert!(!error.is_empty());
        }
        other => panic!("expected a failed quantization, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[test]
fn outcome_serializes_as_a_report() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, _) = write_checkpoint(dir.path(), &Architecture::new(1, 8, NetworkVariant::Plain));

    let config = ExportConfig::builder().quantize(true).calibration_samples(2).build().unwrap();
    let outcome = ConversionPipeline::new(config).unwrap().run(&checkpoint, None).unwrap();
    let json = serde_json::to_value(&outcome).unwrap();

    assert_eq!(json["container"], "training_checkpoint");
    assert_eq!(json["iteration"], 1200);
    assert_eq!(json["export"]["opset"], 14);
    assert_eq!(json["quantization"]["status"], "completed");
    assert!(json["verification"].is_null());
    assert!(json["canonicalization"]["side_cars_removed"].as_array().unwrap().is_empty());
}
