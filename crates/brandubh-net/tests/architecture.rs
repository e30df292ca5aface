//! Architecture inference and strict loading against generated checkpoints.

use brandubh_net::{
    Architecture, ArchitectureInferenceError, ArchitectureOverrides, BrandubhNet, CheckpointContainer,
    ContainerKind, NetworkVariant, NumericMode, NumericStabilizer, ParameterLoadError, ParameterMap,
    StateStore, infer_architecture, parameter_specs, save_safetensors, synthetic_parameters,
};
use candle_core::{DType, Device, Tensor};
use proptest::prelude::*;

fn params_for(arch: &Architecture) -> ParameterMap {
    synthetic_parameters(arch, &Device::Cpu).unwrap()
}

fn infer(params: &ParameterMap, overrides: &ArchitectureOverrides) -> Result<Architecture, ArchitectureInferenceError> {
    infer_architecture(params.shapes(), None, overrides)
}

// ---------------------------------------------------------------------------
// Worked scenarios
// ---------------------------------------------------------------------------

#[test]
fn five_block_checkpoint_is_inferred() {
    let arch = Architecture::new(5, 32, NetworkVariant::Plain);
    let params = params_for(&arch);
    let inferred = infer(&params, &ArchitectureOverrides::default()).unwrap();
    assert_eq!((inferred.num_residual_blocks, inferred.num_channels), (5, 32));
    assert!(BrandubhNet::load(&inferred, &params).is_ok());
}

#[test]
fn conflicting_channel_override_fails_at_load() {
    let params = params_for(&Architecture::new(5, 32, NetworkVariant::Plain));
    let overrides = ArchitectureOverrides { num_channels: Some(64), ..Default::default() };
    let arch = infer(&params, &overrides).unwrap();
    assert_eq!((arch.num_residual_blocks, arch.num_channels), (5, 64));

    match BrandubhNet::load(&arch, &params) {
        Err(ParameterLoadError::ShapeMismatch(e)) => {
            assert_eq!(e.name, "conv_input.weight");
            assert_eq!(e.expected, vec![64, 4, 3, 3]);
            assert_eq!(e.actual, vec![32, 4, 3, 3]);
        }
        other => panic!("expected a shape mismatch, got {other:?}"),
    }
}

#[test]
fn checkpoint_without_residual_tower_names_the_signal() {
    let mut params = ParameterMap::new();
    params.insert("conv_input.weight", Tensor::zeros((32, 4, 3, 3), DType::F32, &Device::Cpu).unwrap());
    params.insert("fc_value1.weight", Tensor::zeros((64, 49), DType::F32, &Device::Cpu).unwrap());

    let err = infer(&params, &ArchitectureOverrides::default()).unwrap_err();
    assert!(matches!(err, ArchitectureInferenceError::NoResidualBlocks { .. }));
    assert!(err.to_string().contains("res_blocks.<i>.conv1.weight"), "{err}");
}

#[test]
fn stabilizer_clamps_only_large_variances() {
    let arch = Architecture::new(2, 8, NetworkVariant::SqueezeExcitation);
    let mut net = BrandubhNet::load(&arch, &params_for(&arch)).unwrap();
    net.res_blocks[1].bn2.running_var =
        Tensor::new(&[25.0f32, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0], &Device::Cpu).unwrap();
    net.bn_policy.running_var = Tensor::new(&[3.0f32, 0.1], &Device::Cpu).unwrap();

    let report = NumericStabilizer::default().stabilize(&mut net).unwrap();
    assert_eq!(report.layers_repaired, 1);
    assert_eq!(report.max_statistic_before_repair, 25.0);

    let var = net.res_blocks[1].bn2.running_var.to_vec1::<f32>().unwrap();
    assert_eq!(var.iter().cloned().fold(f32::MIN, f32::max), 10.0);
    assert_eq!(net.bn_policy.running_var.to_vec1::<f32>().unwrap(), vec![3.0, 0.1]);

    let (policy, value) = net.forward(&net.sample_input().unwrap(), NumericMode::default()).unwrap();
    assert_eq!((policy.dims(), value.dims()), (&[1, 1176][..], &[1, 1][..]));
}

// ---------------------------------------------------------------------------
// Checkpoint storage
// ---------------------------------------------------------------------------

#[test]
fn training_checkpoint_loads_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brandubh_model.safetensors");
    let arch = Architecture::new(3, 16, NetworkVariant::SqueezeExcitation).with_value_head_hidden_size(32);
    let container = CheckpointContainer::TrainingCheckpoint { parameters: params_for(&arch), iteration: Some(42) };
    save_safetensors(&container, &path).unwrap();

    let loaded = StateStore::default().read_container(&path).unwrap();
    assert_eq!(loaded.kind(), ContainerKind::TrainingCheckpoint);
    assert_eq!(loaded.iteration(), Some(42));

    let params = loaded.into_parameter_map();
    let inferred = infer(&params, &ArchitectureOverrides::default()).unwrap();
    assert_eq!(inferred, arch);
    BrandubhNet::load(&inferred, &params).unwrap();
}

#[test]
fn plain_one_block_parameter_specs() {
    let arch = Architecture::new(1, 8, NetworkVariant::Plain);
    let rendered = parameter_specs(&arch)
        .iter()
        .map(|s| format!("{} {:?}{}", s.name, s.shape, if s.required { "" } else { " optional" }))
        .collect::<Vec<_>>()
        .join("\n");
    insta::assert_snapshot!("plain_one_block_parameter_specs", rendered);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

fn arch_strategy() -> impl Strategy<Value = Architecture> {
    (1usize..4, 1usize..12, 1usize..24, any::<bool>()).prop_map(|(blocks, channels, hidden, se)| {
        let variant = if se { NetworkVariant::SqueezeExcitation } else { NetworkVariant::Plain };
        Architecture::new(blocks, channels, variant).with_value_head_hidden_size(hidden)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn generated_parameters_infer_back_and_load(arch in arch_strategy()) {
        let params = params_for(&arch);
        let inferred = infer(&params, &ArchitectureOverrides::default()).unwrap();
        prop_assert_eq!(inferred, arch);
        prop_assert!(BrandubhNet::load(&inferred, &params).is_ok());
    }

    #[test]
    fn overrides_apply_per_field(
        arch in arch_strategy(),
        blocks in proptest::option::of(1usize..9),
        channels in proptest::option::of(1usize..64),
        hidden in proptest::option::of(1usize..128),
    ) {
        let params = params_for(&arch);
        let overrides = ArchitectureOverrides {
            num_residual_blocks: blocks,
            num_channels: channels,
            value_head_hidden_size: hidden,
        };
        let inferred = infer(&params, &overrides).unwrap();
        prop_assert_eq!(inferred.num_residual_blocks, blocks.unwrap_or(arch.num_residual_blocks));
        prop_assert_eq!(inferred.num_channels, channels.unwrap_or(arch.num_channels));
        prop_assert_eq!(inferred.value_head_hidden_size, hidden.unwrap_or(arch.value_head_hidden_size));
        prop_assert_eq!(inferred.variant, arch.variant);
    }
}
