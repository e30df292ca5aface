//! Reading and writing model files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{OnnxError, Result};
use crate::proto::ModelProto;

/// Load and decode a model file. External data is not resolved.
pub fn load_model(path: impl AsRef<Path>) -> Result<ModelProto> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| OnnxError::at_path(path, e))?;
    debug!(path = %path.display(), bytes = bytes.len(), "decoding ONNX model");
    ModelProto::decode(&bytes)
}

/// Encode and write a model, replacing `path` atomically.
pub fn save_model(model: &ModelProto, path: impl AsRef<Path>) -> Result<u64> {
    let bytes = model.encode_to_vec();
    write_atomic(path.as_ref(), &bytes)?;
    Ok(bytes.len() as u64)
}

/// Write `bytes` to a temporary sibling, flush it, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_with(path, |file| file.write_all(bytes))?;
    debug!(path = %path.display(), bytes = bytes.len(), "wrote file");
    Ok(())
}

/// Like [`write_atomic`], with `fill` producing the contents. The temporary
/// sibling is removed on every failure, and `path` is untouched unless the
/// rename succeeds.
pub fn write_atomic_with<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    let tmp = temp_sibling(path);
    let written = fs::File::create(&tmp).and_then(|mut file| {
        fill(&mut file)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(OnnxError::at_path(&tmp, e));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(OnnxError::at_path(path, e));
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::GraphProto;
    use tempfile::TempDir;

    #[test]
    fn save_then_load_returns_same_model() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.onnx");
        let model = ModelProto {
            ir_version: 8,
            graph: GraphProto { name: "g".into(), ..Default::default() },
            ..Default::default()
        };
        let written = save_model(&model, &path).unwrap();
        assert_eq!(written, fs::metadata(&path).unwrap().len());
        assert_eq!(load_model(&path).unwrap(), model);
        assert!(!dir.path().join(".m.onnx.tmp").exists());
    }

    #[test]
    fn failed_write_leaves_no_temporary_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.onnx");
        fs::write(&path, b"previous").unwrap();

        let err = write_atomic_with(&path, |file| {
            file.write_all(b"partial")?;
            Err(io::Error::other("disk full"))
        })
        .unwrap_err();

        assert!(err.to_string().contains(".m.onnx.tmp"));
        assert!(!dir.path().join(".m.onnx.tmp").exists());
        assert_eq!(fs::read(&path).unwrap(), b"previous");
    }

    #[test]
    fn failed_rename_leaves_no_temporary_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocked.onnx");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        assert!(write_atomic(&path, b"model").is_err());
        assert!(!dir.path().join(".blocked.onnx.tmp").exists());
        assert!(path.join("keep").is_file());
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let err = load_model(dir.path().join("absent.onnx")).unwrap_err();
        assert!(err.to_string().contains("absent.onnx"));
    }
}
