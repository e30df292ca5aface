//! Checkpoint loading (StateStore).
//!
//! Two storage formats are accepted:
//!
//! - PyTorch zip archives (`.pt`, `.pth`, `.ckpt`) written by `torch.save`.
//!   The root pickle object decides the container kind; tensors are read
//!   through candle's pickle support.
//! - safetensors files. A wrapped container stores its parameters under the
//!   `model_state_dict.` or `state_dict.` key prefix and may carry the
//!   training iteration in the header metadata.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use candle_core::pickle::{Object, PthTensors, Stack};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::CheckpointLoadError;
use crate::params::ParameterMap;

/// Top-level key of a training checkpoint's parameters.
pub const TRAINING_CHECKPOINT_KEY: &str = "model_state_dict";
/// Top-level key of a generic state-dict wrapper.
pub const STATE_DICT_KEY: &str = "state_dict";
/// Optional training iteration stored next to the parameters.
pub const ITERATION_KEY: &str = "iteration";

type Result<T> = std::result::Result<T, CheckpointLoadError>;

/// Which wrapper, if any, surrounds the parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    TrainingCheckpoint,
    WrappedStateDict,
    RawParameterMap,
}

impl std::fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerKind::TrainingCheckpoint => write!(f, "training checkpoint"),
            ContainerKind::WrappedStateDict => write!(f, "wrapped state dict"),
            ContainerKind::RawParameterMap => write!(f, "raw parameter map"),
        }
    }
}

/// Classify a container from its set of top-level keys.
///
/// A training checkpoint wins over a generic wrapper when both keys exist.
///
/// ```
/// use brandubh_net::checkpoint::{ContainerKind, detect_container};
///
/// let keys = ["iteration", "model_state_dict", "optimizer_state_dict"];
/// assert_eq!(detect_container(keys), ContainerKind::TrainingCheckpoint);
/// assert_eq!(detect_container(["conv_input.weight"]), ContainerKind::RawParameterMap);
/// ```
pub fn detect_container<'a>(keys: impl IntoIterator<Item = &'a str>) -> ContainerKind {
    let mut kind = ContainerKind::RawParameterMap;
    for key in keys {
        match key {
            TRAINING_CHECKPOINT_KEY => return ContainerKind::TrainingCheckpoint,
            STATE_DICT_KEY => kind = ContainerKind::WrappedStateDict,
            _ => {}
        }
    }
    kind
}

/// A deserialized checkpoint.
#[derive(Debug, Clone)]
pub enum CheckpointContainer {
    TrainingCheckpoint { parameters: ParameterMap, iteration: Option<i64> },
    WrappedStateDict { parameters: ParameterMap },
    RawParameterMap(ParameterMap),
}

impl CheckpointContainer {
    pub fn kind(&self) -> ContainerKind {
        match self {
            CheckpointContainer::TrainingCheckpoint { .. } => ContainerKind::TrainingCheckpoint,
            CheckpointContainer::WrappedStateDict { .. } => ContainerKind::WrappedStateDict,
            CheckpointContainer::RawParameterMap(_) => ContainerKind::RawParameterMap,
        }
    }

    pub fn iteration(&self) -> Option<i64> {
        match self {
            CheckpointContainer::TrainingCheckpoint { iteration, .. } => *iteration,
            _ => None,
        }
    }

    pub fn parameters(&self) -> &ParameterMap {
        match self {
            CheckpointContainer::TrainingCheckpoint { parameters, .. }
            | CheckpointContainer::WrappedStateDict { parameters }
            | CheckpointContainer::RawParameterMap(parameters) => parameters,
        }
    }

    pub fn into_parameter_map(self) -> ParameterMap {
        match self {
            CheckpointContainer::TrainingCheckpoint { parameters, .. }
            | CheckpointContainer::WrappedStateDict { parameters }
            | CheckpointContainer::RawParameterMap(parameters) => parameters,
        }
    }

    fn from_parts(kind: ContainerKind, parameters: ParameterMap, iteration: Option<i64>) -> Self {
        match kind {
            ContainerKind::TrainingCheckpoint => {
                CheckpointContainer::TrainingCheckpoint { parameters, iteration }
            }
            ContainerKind::WrappedStateDict => CheckpointContainer::WrappedStateDict { parameters },
            ContainerKind::RawParameterMap => CheckpointContainer::RawParameterMap(parameters),
        }
    }
}

/// On-disk checkpoint encoding, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    PyTorch,
    SafeTensors,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pt" | "pth" | "ckpt" => Some(CheckpointFormat::PyTorch),
            "safetensors" => Some(CheckpointFormat::SafeTensors),
            _ => None,
        }
    }
}

/// Reads checkpoints into a [`CheckpointContainer`].
#[derive(Debug, Clone)]
pub struct StateStore {
    device: Device,
}

impl Default for StateStore {
    fn default() -> Self {
        Self { device: Device::Cpu }
    }
}

impl StateStore {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Deserialize `path` and unwrap it to the parameter map.
    pub fn open(&self, path: &Path) -> Result<ParameterMap> {
        Ok(self.read_container(path)?.into_parameter_map())
    }

    /// Deserialize `path` without discarding the wrapper information.
    pub fn read_container(&self, path: &Path) -> Result<CheckpointContainer> {
        if !path.is_file() {
            return Err(CheckpointLoadError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        let format = CheckpointFormat::from_path(path)
            .ok_or_else(|| CheckpointLoadError::UnsupportedFormat(path.to_path_buf()))?;

        let container = match format {
            CheckpointFormat::PyTorch => self.read_pytorch(path)?,
            CheckpointFormat::SafeTensors => self.read_safetensors(path)?,
        };
        if container.parameters().is_empty() {
            return Err(CheckpointLoadError::Empty { path: path.to_path_buf() });
        }

        match &container {
            CheckpointContainer::TrainingCheckpoint { iteration: Some(it), .. } => {
                info!("Loaded training checkpoint (iteration {it})");
            }
            other => info!("Loaded {}", other.kind()),
        }
        debug!(tensors = container.parameters().len(), "checkpoint parameters resolved");
        Ok(container)
    }

    // -----------------------------------------------------------------------
    // PyTorch zip archives
    // -----------------------------------------------------------------------

    fn read_pytorch(&self, path: &Path) -> Result<CheckpointContainer> {
        let root = read_pickle_root(path)?;
        let Object::Dict(entries) = root else {
            return Err(CheckpointLoadError::UnsupportedLayout {
                path: path.to_path_buf(),
                reason: "root object is not a dictionary".into(),
            });
        };

        let mut keys = Vec::with_capacity(entries.len());
        let mut iteration = None;
        for (key, value) in &entries {
            let Object::Unicode(key) = key else { continue };
            if key == ITERATION_KEY {
                iteration = match value {
                    Object::Int(i) => Some(i64::from(*i)),
                    _ => None,
                };
            }
            keys.push(key.as_str());
        }

        let kind = detect_container(keys.iter().copied());
        let wrapper = match kind {
            ContainerKind::TrainingCheckpoint => Some(TRAINING_CHECKPOINT_KEY),
            ContainerKind::WrappedStateDict => Some(STATE_DICT_KEY),
            ContainerKind::RawParameterMap => None,
        };

        let tensors = PthTensors::new(path, wrapper).map_err(|e| corrupt(path, e))?;
        let mut names: Vec<String> = tensors.tensor_infos().keys().cloned().collect();
        names.sort();

        let mut parameters = ParameterMap::new();
        for name in names {
            let Some(tensor) = tensors.get(&name).map_err(|e| corrupt(path, e))? else {
                continue;
            };
            parameters.insert(name, self.normalize(tensor)?);
        }
        Ok(CheckpointContainer::from_parts(kind, parameters, iteration))
    }

    // -----------------------------------------------------------------------
    // safetensors
    // -----------------------------------------------------------------------

    fn read_safetensors(&self, path: &Path) -> Result<CheckpointContainer> {
        let buf = std::fs::read(path)
            .map_err(|source| CheckpointLoadError::Io { path: path.to_path_buf(), source })?;
        let (_, metadata) = SafeTensors::read_metadata(&buf).map_err(|e| corrupt(path, e))?;
        let iteration = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(ITERATION_KEY))
            .and_then(|v| v.parse::<i64>().ok());

        let tensors = candle_core::safetensors::load_buffer(&buf, &self.device)
            .map_err(|e| corrupt(path, e))?;

        let heads: BTreeSet<&str> =
            tensors.keys().map(|k| k.split_once('.').map_or(k.as_str(), |(head, _)| head)).collect();
        let kind = detect_container(heads.iter().copied());
        let prefix = match kind {
            ContainerKind::TrainingCheckpoint => Some(TRAINING_CHECKPOINT_KEY),
            ContainerKind::WrappedStateDict => Some(STATE_DICT_KEY),
            ContainerKind::RawParameterMap => None,
        };

        let mut parameters = ParameterMap::new();
        for (name, tensor) in tensors {
            let name = match prefix {
                Some(prefix) => match name.strip_prefix(prefix).and_then(|n| n.strip_prefix('.')) {
                    Some(inner) => inner.to_string(),
                    None => continue,
                },
                None => name,
            };
            parameters.insert(name, self.normalize(tensor)?);
        }
        Ok(CheckpointContainer::from_parts(kind, parameters, iteration))
    }

    fn normalize(&self, tensor: Tensor) -> Result<Tensor> {
        // Integer counters keep their type; everything else computes in f32.
        let tensor = match tensor.dtype() {
            DType::F16 | DType::BF16 | DType::F64 => tensor.to_dtype(DType::F32)?,
            _ => tensor,
        };
        Ok(tensor.to_device(&self.device)?)
    }
}

fn corrupt(path: &Path, err: impl std::fmt::Display) -> CheckpointLoadError {
    CheckpointLoadError::Corrupt { path: path.to_path_buf(), reason: err.to_string() }
}

/// Decode the root object of the `data.pkl` entry in a `torch.save` archive.
fn read_pickle_root(path: &Path) -> Result<Object> {
    let file = File::open(path)
        .map_err(|source| CheckpointLoadError::Io { path: path.to_path_buf(), source })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(path, e))?;

    let entry_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_owned)
        .ok_or_else(|| corrupt(path, "archive has no data.pkl entry"))?;

    let mut buf = Vec::new();
    archive
        .by_name(&entry_name)
        .map_err(|e| corrupt(path, e))?
        .read_to_end(&mut buf)
        .map_err(|source| CheckpointLoadError::Io { path: path.to_path_buf(), source })?;

    let mut stack = Stack::empty();
    stack.read_loop(&mut buf.as_slice()).map_err(|e| corrupt(path, e))?;
    stack.finalize().map_err(|e| corrupt(path, e))
}

/// Write a container as safetensors, mirroring the wrapper as a key prefix.
pub fn save_safetensors(container: &CheckpointContainer, path: &Path) -> Result<PathBuf> {
    let prefix = match container.kind() {
        ContainerKind::TrainingCheckpoint => Some(TRAINING_CHECKPOINT_KEY),
        ContainerKind::WrappedStateDict => Some(STATE_DICT_KEY),
        ContainerKind::RawParameterMap => None,
    };
    let entries: Vec<(String, &Tensor)> = container
        .parameters()
        .iter()
        .map(|(name, tensor)| match prefix {
            Some(prefix) => (format!("{prefix}.{name}"), tensor),
            None => (name.clone(), tensor),
        })
        .collect();

    let metadata = container
        .iteration()
        .map(|it| HashMap::from([(ITERATION_KEY.to_string(), it.to_string())]));

    safetensors::serialize_to_file(entries, &metadata, path).map_err(|e| corrupt(path, e))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParameterMap {
        let dev = Device::Cpu;
        [
            ("conv_input.weight".to_string(), Tensor::ones((4, 4, 3, 3), DType::F32, &dev).unwrap()),
            ("bn_input.num_batches_tracked".to_string(), Tensor::new(&[3i64], &dev).unwrap()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn training_key_takes_precedence() {
        assert_eq!(
            detect_container(["state_dict", "model_state_dict"]),
            ContainerKind::TrainingCheckpoint
        );
        assert_eq!(detect_container(["state_dict", "epoch"]), ContainerKind::WrappedStateDict);
        assert_eq!(detect_container(std::iter::empty()), ContainerKind::RawParameterMap);
    }

    #[test]
    fn safetensors_training_checkpoint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let container =
            CheckpointContainer::TrainingCheckpoint { parameters: params(), iteration: Some(120) };
        save_safetensors(&container, &path).unwrap();

        let loaded = StateStore::default().read_container(&path).unwrap();
        assert_eq!(loaded.kind(), ContainerKind::TrainingCheckpoint);
        assert_eq!(loaded.iteration(), Some(120));
        let keys: Vec<&str> = loaded.parameters().keys().collect();
        assert_eq!(keys, ["bn_input.num_batches_tracked", "conv_input.weight"]);
    }

    #[test]
    fn safetensors_wrapped_and_raw_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let wrapped = dir.path().join("wrapped.safetensors");
        save_safetensors(&CheckpointContainer::WrappedStateDict { parameters: params() }, &wrapped)
            .unwrap();
        let raw = dir.path().join("raw.safetensors");
        save_safetensors(&CheckpointContainer::RawParameterMap(params()), &raw).unwrap();

        let store = StateStore::default();
        let wrapped = store.read_container(&wrapped).unwrap();
        assert_eq!(wrapped.kind(), ContainerKind::WrappedStateDict);
        assert!(wrapped.parameters().contains_key("conv_input.weight"));
        let raw = store.read_container(&raw).unwrap();
        assert_eq!(raw.kind(), ContainerKind::RawParameterMap);
        assert_eq!(raw.iteration(), None);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = StateStore::default().open(Path::new("/nonexistent/ckpt.pt")).unwrap_err();
        assert!(matches!(err, CheckpointLoadError::Io { .. }), "{err}");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        let err = StateStore::default().open(file.path()).unwrap_err();
        assert!(matches!(err, CheckpointLoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn corrupt_archive_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let pt = dir.path().join("broken.pt");
        std::fs::write(&pt, b"definitely not a zip archive").unwrap();
        let err = StateStore::default().open(&pt).unwrap_err();
        assert!(matches!(err, CheckpointLoadError::Corrupt { .. }), "{err}");

        let st = dir.path().join("broken.safetensors");
        std::fs::write(&st, [0xffu8; 16]).unwrap();
        let err = StateStore::default().open(&st).unwrap_err();
        assert!(matches!(err, CheckpointLoadError::Corrupt { .. }), "{err}");
    }
}
