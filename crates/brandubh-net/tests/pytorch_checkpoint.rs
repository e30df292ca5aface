//! Reading `torch.save` zip archives written in-test.
//!
//! Archives follow the layout torch produces: `archive/data.pkl` holds a
//! protocol-2 pickle whose tensors are `_rebuild_tensor_v2` calls over
//! persistent storage ids, and each storage lives at `archive/data/<key>`.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use brandubh_net::{
    Architecture, ArchitectureOverrides, BrandubhNet, CheckpointLoadError, ContainerKind, NetworkVariant,
    NumericStabilizer, ParameterMap, StateStore, infer_architecture, synthetic_parameters,
};
use candle_core::{DType, Device, Tensor};
use zip::write::SimpleFileOptions;

// ---------------------------------------------------------------------------
// Pickle writer
// ---------------------------------------------------------------------------

/// Just enough of protocol 2 to describe a checkpoint.
struct Pickle {
    bytes: Vec<u8>,
    storages: Vec<(String, Vec<u8>)>,
}

impl Pickle {
    fn new() -> Self {
        Self { bytes: vec![0x80, 2], storages: Vec::new() }
    }

    fn op(&mut self, op: u8) -> &mut Self {
        self.bytes.push(op);
        self
    }

    fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.bytes.push(b'c');
        self.bytes.extend_from_slice(format!("{module}\n{name}\n").as_bytes());
        self
    }

    fn str(&mut self, s: &str) -> &mut Self {
        self.bytes.push(b'X');
        self.bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(s.as_bytes());
        self
    }

    fn int(&mut self, v: i32) -> &mut Self {
        self.bytes.push(b'J');
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn float(&mut self, v: f64) -> &mut Self {
        self.bytes.push(b'G');
        self.bytes.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn int_tuple(&mut self, values: &[usize]) -> &mut Self {
        self.op(b'(');
        for &v in values {
            self.int(v as i32);
        }
        self.op(b't')
    }

    fn ordered_dict(&mut self) -> &mut Self {
        self.global("collections", "OrderedDict").op(b')').op(b'R')
    }

    /// `_rebuild_tensor_v2(storage, 0, size, stride, False, OrderedDict())`
    fn tensor(&mut self, tensor: &Tensor) -> &mut Self {
        let key = self.storages.len().to_string();
        let (storage, data) = match tensor.dtype() {
            DType::I64 => {
                let values = tensor.flatten_all().unwrap().to_vec1::<i64>().unwrap();
                ("LongStorage", values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>())
            }
            _ => {
                let values = tensor.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
                ("FloatStorage", values.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
        };
        let dims = tensor.dims().to_vec();
        let mut stride = vec![1; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            stride[i] = stride[i + 1] * dims[i + 1];
        }

        self.global("torch._utils", "_rebuild_tensor_v2").op(b'(');
        self.op(b'(').str("storage").global("torch", storage).str(&key).str("cpu");
        self.int(tensor.elem_count() as i32).op(b't').op(b'Q');
        self.int(0).int_tuple(&dims).int_tuple(&stride).op(0x89).ordered_dict();
        self.op(b't').op(b'R');
        self.storages.push((key, data));
        self
    }

    /// A state dict as torch pickles it, including the `_metadata` state.
    fn state_dict(&mut self, params: &ParameterMap) -> &mut Self {
        self.ordered_dict().op(b'(');
        for (name, tensor) in params {
            self.str(name).tensor(tensor);
        }
        self.op(b'u');
        self.op(b'}').op(b'(').str("_metadata").ordered_dict();
        self.op(b'(').str("").op(b'}').op(b'(').str("version").int(1).op(b'u').op(b'u');
        self.op(b'u').op(b'b')
    }

    fn write(&mut self, path: &Path) {
        self.op(b'.');
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        zip.start_file("archive/data.pkl", options).unwrap();
        zip.write_all(&self.bytes).unwrap();
        for (key, data) in &self.storages {
            zip.start_file(format!("archive/data/{key}"), options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.start_file("archive/version", options).unwrap();
        zip.write_all(b"3\n").unwrap();
        zip.finish().unwrap();
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn arch() -> Architecture {
    Architecture::new(1, 4, NetworkVariant::Plain)
}

fn params() -> ParameterMap {
    synthetic_parameters(&arch(), &Device::Cpu).unwrap()
}

fn raw_archive(dir: &Path, params: &ParameterMap) -> PathBuf {
    let path = dir.join("raw.pt");
    Pickle::new().state_dict(params).write(&path);
    path
}

fn wrapped_archive(dir: &Path, params: &ParameterMap) -> PathBuf {
    let path = dir.join("wrapped.pth");
    let mut pickle = Pickle::new();
    pickle.op(b'}').op(b'(').str("state_dict").state_dict(params).op(b'u');
    pickle.write(&path);
    path
}

/// `{"model_state_dict", "optimizer_state_dict", "iteration"}` with Adam-like
/// optimizer state holding its own tensors.
fn training_archive(dir: &Path, params: &ParameterMap, iteration: i32) -> PathBuf {
    let path = dir.join("training.pt");
    let exp_avg = Tensor::ones((4, 4, 3, 3), DType::F32, &Device::Cpu).unwrap();
    let mut pickle = Pickle::new();
    pickle.op(b'}').op(b'(');
    pickle.str("model_state_dict").state_dict(params);
    pickle.str("optimizer_state_dict").op(b'}').op(b'(');
    pickle.str("state").op(b'}').op(b'(').int(0).op(b'}').op(b'(');
    pickle.str("step").int(3).str("exp_avg").tensor(&exp_avg).op(b'u');
    pickle.op(b'u');
    pickle.str("param_groups").op(b']').op(b'(').op(b'}').op(b'(').str("lr").float(1e-3).op(b'u').op(b'e');
    pickle.op(b'u');
    pickle.str("iteration").int(iteration);
    pickle.op(b'u');
    pickle.write(&path);
    path
}

fn assert_same_parameters(loaded: &ParameterMap, expected: &ParameterMap) {
    let names: Vec<&str> = loaded.keys().collect();
    let expected_names: Vec<&str> = expected.keys().collect();
    assert_eq!(names, expected_names);
    for (name, tensor) in expected {
        let actual = loaded.get(name).unwrap();
        assert_eq!(actual.dims(), tensor.dims(), "{name}");
        assert_eq!(actual.dtype(), tensor.dtype(), "{name}");
        let diff = (actual.to_dtype(DType::F64).unwrap() - tensor.to_dtype(DType::F64).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f64>()
            .unwrap();
        assert_eq!(diff, 0.0, "{name}");
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

#[test]
fn raw_state_dict_archive() {
    let dir = tempfile::tempdir().unwrap();
    let expected = params();
    let path = raw_archive(dir.path(), &expected);

    let container = StateStore::default().read_container(&path).unwrap();
    assert_eq!(container.kind(), ContainerKind::RawParameterMap);
    assert_eq!(container.iteration(), None);
    assert!(!container.parameters().contains_key("_metadata"));
    assert_same_parameters(container.parameters(), &expected);
}

#[test]
fn wrapped_state_dict_archive() {
    let dir = tempfile::tempdir().unwrap();
    let expected = params();
    let path = wrapped_archive(dir.path(), &expected);

    let container = StateStore::default().read_container(&path).unwrap();
    assert_eq!(container.kind(), ContainerKind::WrappedStateDict);
    assert_eq!(container.iteration(), None);
    assert_same_parameters(container.parameters(), &expected);
}

#[test]
fn training_checkpoint_archive_skips_optimizer_state() {
    let dir = tempfile::tempdir().unwrap();
    let expected = params();
    let path = training_archive(dir.path(), &expected, 1200);

    let container = StateStore::default().read_container(&path).unwrap();
    assert_eq!(container.kind(), ContainerKind::TrainingCheckpoint);
    assert_eq!(container.iteration(), Some(1200));
    assert_eq!(container.parameters().len(), expected.len());
    assert!(!container.parameters().keys().any(|k| k.contains("exp_avg") || k.starts_with('_')));
    assert_same_parameters(container.parameters(), &expected);

    let counter = container.parameters().get("bn_input.num_batches_tracked").unwrap();
    assert_eq!(counter.dtype(), DType::I64);
    assert_eq!(counter.dims(), &[] as &[usize]);
}

#[test]
fn training_archive_loads_and_is_stabilized() {
    let dir = tempfile::tempdir().unwrap();
    let mut expected = params();
    let mut var = vec![1.0f32; 4];
    var[2] = 25.0;
    expected.insert("bn_input.running_var", Tensor::from_vec(var, 4, &Device::Cpu).unwrap());
    let path = training_archive(dir.path(), &expected, 1200);

    let params = StateStore::default().open(&path).unwrap();
    let inferred = infer_architecture(params.shapes(), None, &ArchitectureOverrides::default()).unwrap();
    assert_eq!(inferred, arch());

    let mut net = BrandubhNet::load(&inferred, &params).unwrap();
    let report = NumericStabilizer::default().stabilize(&mut net).unwrap();
    assert_eq!(report.layers_repaired, 1);
    assert_eq!(report.repaired, ["bn_input"]);
    assert_eq!(report.max_statistic_before_repair, 25.0);
}

// ---------------------------------------------------------------------------
// Malformed archives
// ---------------------------------------------------------------------------

#[test]
fn archive_without_pickle_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.pt");
    let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
    zip.start_file("archive/version", SimpleFileOptions::default()).unwrap();
    zip.write_all(b"3\n").unwrap();
    zip.finish().unwrap();

    let err = StateStore::default().read_container(&path).unwrap_err();
    assert!(matches!(err, CheckpointLoadError::Corrupt { .. }), "{err}");
    assert!(err.to_string().contains("data.pkl"), "{err}");
}

#[test]
fn non_dictionary_root_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("list.pt");
    let mut pickle = Pickle::new();
    pickle.op(b']').op(b'(').int(1).int(2).op(b'e');
    pickle.write(&path);

    let err = StateStore::default().read_container(&path).unwrap_err();
    assert!(matches!(err, CheckpointLoadError::UnsupportedLayout { .. }), "{err}");
}
