//! Single-file artifact canonicalization.
//!
//! Browser runtimes cannot resolve external-data side-cars, so after export
//! every tensor payload is pulled back into the model file and the side-cars
//! are deleted.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use brandubh_onnx::{internalize_initializers, load_model, save_model, side_car_path};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::CanonicalizationError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CanonicalizationReport {
    pub tensors_embedded: usize,
    pub bytes_embedded: u64,
    pub side_cars_removed: Vec<PathBuf>,
    /// Whether the artifact file itself was rewritten.
    pub rewritten: bool,
}

impl CanonicalizationReport {
    pub fn changed_anything(&self) -> bool {
        self.rewritten || !self.side_cars_removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactCanonicalizer;

impl ArtifactCanonicalizer {
    /// Embed every external tensor of `artifact` and remove its side-cars.
    ///
    /// The artifact is rewritten atomically and only when a tensor was
    /// embedded, so a second run is a no-op.
    pub fn canonicalize(&self, artifact: &Path) -> Result<CanonicalizationReport, CanonicalizationError> {
        let mut model = load_model(artifact)
            .map_err(|source| CanonicalizationError::Load { path: artifact.to_path_buf(), source })?;
        let base_dir = artifact.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));

        let embedded = internalize_initializers(&mut model, base_dir)
            .map_err(|source| CanonicalizationError::Embed { path: artifact.to_path_buf(), source })?;

        let mut report = CanonicalizationReport {
            tensors_embedded: embedded.tensors,
            bytes_embedded: embedded.bytes,
            ..Default::default()
        };
        if embedded.tensors > 0 {
            save_model(&model, artifact)
                .map_err(|source| CanonicalizationError::Write { path: artifact.to_path_buf(), source })?;
            report.rewritten = true;
        }

        let mut candidates: BTreeSet<PathBuf> = embedded.locations;
        candidates.insert(side_car_path(artifact));
        for path in candidates {
            if is_same_file(&path, artifact) || !path.is_file() {
                continue;
            }
            fs::remove_file(&path)
                .map_err(|source| CanonicalizationError::RemoveSideCar { path: path.clone(), source })?;
            debug!(side_car = %path.display(), "removed side-car");
            report.side_cars_removed.push(path);
        }

        if report.changed_anything() {
            info!(
                tensors = report.tensors_embedded,
                bytes = report.bytes_embedded,
                side_cars = report.side_cars_removed.len(),
                "Canonicalized {} to a single file",
                artifact.display()
            );
        } else {
            debug!(artifact = %artifact.display(), "artifact already self-contained");
        }
        Ok(report)
    }
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brandubh_onnx::{
        DataType, Dim, GraphProto, ModelProto, NodeProto, OperatorSetId, Session, SessionOptions, TensorProto,
        ValueInfoProto, externalize_initializers,
    };
    use candle_core::{Device, Tensor};

    fn add_model() -> ModelProto {
        let float = DataType::Float.as_i32();
        let weights: Vec<f32> = (0..64).map(|i| i as f32 * 0.25).collect();
        ModelProto {
            ir_version: 7,
            opset_import: vec![OperatorSetId { domain: String::new(), version: 14 }],
            graph: GraphProto {
                node: vec![NodeProto::new("Add", "add", vec!["x".into(), "w".into()], vec!["y".into()])],
                initializer: vec![TensorProto::from_f32("w", &[64], &weights)],
                input: vec![ValueInfoProto::tensor("x", float, vec![Dim::Value(64)])],
                output: vec![ValueInfoProto::tensor("y", float, vec![Dim::Value(64)])],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn write_external(path: &Path) {
        let mut model = add_model();
        let summary = externalize_initializers(&mut model, path, 16).unwrap();
        assert_eq!(summary.tensors, 1);
        save_model(&model, path).unwrap();
    }

    #[test]
    fn embeds_and_removes_side_car() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        write_external(&path);
        let side_car = side_car_path(&path);
        assert!(side_car.is_file());

        let report = ArtifactCanonicalizer.canonicalize(&path).unwrap();
        assert_eq!(report.tensors_embedded, 1);
        assert_eq!(report.bytes_embedded, 64 * 4);
        assert!(report.rewritten);
        assert_eq!(report.side_cars_removed, vec![side_car.clone()]);
        assert!(!side_car.exists());

        let model = load_model(&path).unwrap();
        assert!(!model.graph.initializer[0].is_external());
        let session = Session::new(model, SessionOptions::default()).unwrap();
        let x = Tensor::ones(64, candle_core::DType::F32, &Device::Cpu).unwrap();
        let y = session.run(&[("x", x)]).unwrap().remove("y").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(y[4], 2.0);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        write_external(&path);
        ArtifactCanonicalizer.canonicalize(&path).unwrap();
        let bytes = fs::read(&path).unwrap();

        let report = ArtifactCanonicalizer.canonicalize(&path).unwrap();
        assert_eq!(report, CanonicalizationReport::default());
        assert!(!report.changed_anything());
        assert_eq!(fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn stale_side_car_is_removed_without_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        save_model(&add_model(), &path).unwrap();
        fs::write(side_car_path(&path), b"stale").unwrap();

        let report = ArtifactCanonicalizer.canonicalize(&path).unwrap();
        assert!(!report.rewritten);
        assert_eq!(report.side_cars_removed.len(), 1);
        assert!(!side_car_path(&path).exists());
    }

    #[test]
    fn escaping_location_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        let mut model = add_model();
        externalize_initializers(&mut model, &path, 16).unwrap();
        for entry in &mut model.graph.initializer[0].external_data {
            if entry.key == "location" {
                entry.value = "../outside.data".to_string();
            }
        }
        save_model(&model, &path).unwrap();

        let err = ArtifactCanonicalizer.canonicalize(&path).unwrap_err();
        assert!(matches!(err, CanonicalizationError::Embed { .. }));
        // the artifact is left untouched on failure
        assert!(load_model(&path).unwrap().graph.initializer[0].is_external());
    }

    #[test]
    fn missing_artifact_is_a_load_error() {
        let err = ArtifactCanonicalizer.canonicalize(Path::new("/nonexistent/model.onnx")).unwrap_err();
        assert!(matches!(err, CanonicalizationError::Load { .. }));
    }
}
