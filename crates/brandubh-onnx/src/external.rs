//! ONNX external data: tensors whose payload lives in a side-car file.
//!
//! A tensor is external when `data_location == EXTERNAL`; its
//! `external_data` entries carry `location` (path relative to the model file),
//! and optionally `offset` and `length` in bytes.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::error::{OnnxError, Result};
use crate::io::write_atomic;
use crate::proto::{ModelProto, StringStringEntry};
use crate::tensor::{DATA_LOCATION_DEFAULT, DATA_LOCATION_EXTERNAL, TensorProto};

/// Conventional side-car path for an artifact: `<artifact>.data`.
pub fn side_car_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".data");
    artifact.with_file_name(name)
}

/// Parsed `external_data` entries of one tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDataRef {
    pub location: String,
    pub offset: u64,
    pub length: Option<u64>,
}

impl ExternalDataRef {
    /// `None` when the tensor is embedded.
    pub fn from_tensor(tensor: &TensorProto) -> Result<Option<Self>> {
        if !tensor.is_external() {
            return Ok(None);
        }
        let fail = |reason: String| OnnxError::ExternalData { name: tensor.name.clone(), reason };
        let mut location = None;
        let mut offset = 0;
        let mut length = None;
        for entry in &tensor.external_data {
            match entry.key.as_str() {
                "location" => location = Some(entry.value.clone()),
                "offset" => {
                    offset = entry
                        .value
                        .parse()
                        .map_err(|_| fail(format!("invalid offset `{}`", entry.value)))?;
                }
                "length" => {
                    length = Some(
                        entry
                            .value
                            .parse()
                            .map_err(|_| fail(format!("invalid length `{}`", entry.value)))?,
                    );
                }
                // checksum and other keys are informational
                _ => {}
            }
        }
        let location = location.ok_or_else(|| fail("missing `location` entry".into()))?;
        Ok(Some(Self { location, offset, length }))
    }

    fn to_entries(&self) -> Vec<StringStringEntry> {
        let mut entries = vec![
            StringStringEntry::new("location", self.location.clone()),
            StringStringEntry::new("offset", self.offset.to_string()),
        ];
        if let Some(length) = self.length {
            entries.push(StringStringEntry::new("length", length.to_string()));
        }
        entries
    }
}

/// Resolve an external `location` against the model directory.
///
/// Absolute paths and parent-directory components are rejected so a model
/// cannot make the loader read outside its own directory.
pub fn resolve_location(base_dir: &Path, tensor: &str, location: &str) -> Result<PathBuf> {
    let rel = Path::new(location);
    let escapes = rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if location.is_empty() || escapes {
        return Err(OnnxError::ExternalData {
            name: tensor.to_string(),
            reason: format!("location `{location}` must be a relative path inside the model directory"),
        });
    }
    Ok(base_dir.join(rel))
}

// ---------------------------------------------------------------------------
// Externalize
// ---------------------------------------------------------------------------

/// Result of moving initializer payloads to a side-car.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalizeSummary {
    pub side_car: Option<PathBuf>,
    pub tensors: usize,
    pub bytes: u64,
}

/// Move every initializer whose `raw_data` is at least `threshold` bytes to
/// the side-car `<artifact>.data`, rewriting the tensors as references.
pub fn externalize_initializers(
    model: &mut ModelProto,
    artifact: &Path,
    threshold: usize,
) -> Result<ExternalizeSummary> {
    let side_car = side_car_path(artifact);
    let location = side_car.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let mut blob: Vec<u8> = Vec::new();
    let mut summary = ExternalizeSummary::default();

    for tensor in &mut model.graph.initializer {
        if tensor.is_external() || tensor.raw_data.is_empty() || tensor.raw_data.len() < threshold {
            continue;
        }
        let reference = ExternalDataRef {
            location: location.clone(),
            offset: blob.len() as u64,
            length: Some(tensor.raw_data.len() as u64),
        };
        blob.append(&mut tensor.raw_data);
        tensor.external_data = reference.to_entries();
        tensor.data_location = DATA_LOCATION_EXTERNAL;
        summary.tensors += 1;
        debug!(tensor = %tensor.name, offset = reference.offset, "moved to external data");
    }

    if summary.tensors > 0 {
        write_atomic(&side_car, &blob)?;
        summary.bytes = blob.len() as u64;
        summary.side_car = Some(side_car);
        info!(tensors = summary.tensors, bytes = summary.bytes, "wrote external data side-car");
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Internalize
// ---------------------------------------------------------------------------

/// Result of embedding external payloads back into the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalizeSummary {
    pub tensors: usize,
    pub bytes: u64,
    /// Resolved side-car files that were referenced.
    pub locations: BTreeSet<PathBuf>,
}

/// Read every external payload into `raw_data` and clear the references.
pub fn internalize_initializers(
    model: &mut ModelProto,
    base_dir: &Path,
) -> Result<InternalizeSummary> {
    let mut files: HashMap<PathBuf, Vec<u8>> = HashMap::new();
    let mut summary = InternalizeSummary::default();

    let tensors = model.graph.initializer.iter_mut().chain(
        model.graph.node.iter_mut().flat_map(|n| n.attribute.iter_mut()).filter_map(|a| a.t.as_mut()),
    );
    for tensor in tensors {
        let Some(reference) = ExternalDataRef::from_tensor(tensor)? else {
            continue;
        };
        let path = resolve_location(base_dir, &tensor.name, &reference.location)?;
        if !files.contains_key(&path) {
            let data = fs::read(&path).map_err(|e| OnnxError::at_path(&path, e))?;
            files.insert(path.clone(), data);
        }
        let data = &files[&path];
        let start = reference.offset as usize;
        let end = match reference.length {
            Some(len) => start.checked_add(len as usize),
            None => Some(data.len()),
        };
        let payload = end.filter(|&end| start <= end && end <= data.len()).map(|end| &data[start..end]);
        let Some(payload) = payload else {
            return Err(OnnxError::ExternalData {
                name: tensor.name.clone(),
                reason: format!(
                    "range {}+{:?} exceeds {} ({} bytes)",
                    reference.offset,
                    reference.length,
                    path.display(),
                    data.len()
                ),
            });
        };
        tensor.raw_data = payload.to_vec();
        tensor.external_data.clear();
        tensor.data_location = DATA_LOCATION_DEFAULT;
        summary.tensors += 1;
        summary.bytes += payload.len() as u64;
        summary.locations.insert(path);
    }
    Ok(summary)
}
