//! Persisted array metadata.
//!
//! A persistent array root holds UTF-8 JSON descriptors under `meta/`:
//! `storage` records everything needed to interpret the chunk files (element
//! type, compression parameters, chunk length, expected length, default
//! value) and `sizes` records the current shape and byte accounting. Both are
//! terminated with a single newline.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::blosc::Cparams;
use crate::error::CarrayError;

pub(crate) const DATA_DIR: &str = "data";
pub(crate) const META_DIR: &str = "meta";
pub(crate) const ATTRS_DIR: &str = "attrs";
pub(crate) const STORAGE_FILE: &str = "storage";
pub(crate) const SIZES_FILE: &str = "sizes";

/// The `meta/storage` descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct StorageMeta {
    /// Canonical element type descriptor.
    pub dtype: String,
    /// Compression parameters.
    pub cparams: Cparams,
    /// Rows per full chunk.
    pub chunklen: usize,
    /// The expected length the chunk length was derived from.
    pub expectedlen: usize,
    /// Default fill value, encoded per the element type's JSON bridge.
    pub dflt: serde_json::Value,
}

/// The `meta/sizes` descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SizesMeta {
    /// Logical shape, leading dimension first.
    pub shape: Vec<u64>,
    /// Logical uncompressed size in bytes.
    pub nbytes: u64,
    /// Compressed size in bytes, tail buffer accounted at capacity.
    pub cbytes: u64,
}

pub(crate) fn meta_path(rootdir: &Path, file: &str) -> PathBuf {
    rootdir.join(META_DIR).join(file)
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CarrayError> {
    let mut encoded = serde_json::to_string(value)?;
    encoded.push('\n');
    std::fs::write(path, encoded)?;
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CarrayError> {
    let bytes = std::fs::read(path).map_err(|e| {
        CarrayError::Io(std::io::Error::new(
            e.kind(),
            format!("metadata file {}: {e}", path.display()),
        ))
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_meta_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        std::fs::create_dir(dir.path().join(META_DIR))?;
        let meta = StorageMeta {
            dtype: "i4".to_string(),
            cparams: Cparams::default(),
            chunklen: 4096,
            expectedlen: 100_000,
            dflt: serde_json::json!(0),
        };
        let path = meta_path(dir.path(), STORAGE_FILE);
        write_json(&path, &meta)?;

        let raw = std::fs::read_to_string(&path)?;
        assert!(raw.ends_with('\n'));
        assert!(!raw.trim_end().ends_with('\n'));

        assert_eq!(read_json::<StorageMeta>(&path)?, meta);
        Ok(())
    }

    #[test]
    fn sizes_meta_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        std::fs::create_dir(dir.path().join(META_DIR))?;
        let sizes = SizesMeta {
            shape: vec![1000, 3],
            nbytes: 12000,
            cbytes: 640,
        };
        let path = meta_path(dir.path(), SIZES_FILE);
        write_json(&path, &sizes)?;
        assert_eq!(read_json::<SizesMeta>(&path)?, sizes);
        Ok(())
    }

    #[test]
    fn missing_metadata_is_io() {
        let err = read_json::<SizesMeta>(Path::new("/nonexistent/meta/sizes")).unwrap_err();
        assert!(matches!(err, CarrayError::Io(_)));
    }
}
