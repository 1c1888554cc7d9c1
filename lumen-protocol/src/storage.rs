//! Atomic file persistence.
//!
//! Every JSON file the host owns (`state.json`, `apps.json`, credentials)
//! is written with the same discipline: serialize into `<path>.tmp`, then
//! rename over the target so readers never observe a half-written file.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

/// Write raw bytes atomically via a sibling temp file + rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    debug!("wrote {} ({} bytes)", path.display(), data.len());
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data)
}

/// Read and deserialize a JSON file. Returns `Ok(None)` when the file
/// does not exist; parse errors are surfaced to the caller, which may
/// attempt a migration.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Read a JSON file into an untyped value, for tolerant/migrating parsers.
pub fn read_json_value(path: &Path) -> Result<Option<serde_json::Value>> {
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn json_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.json");

        let value = Sample { name: "host".into(), count: 3 };
        write_json_atomic(&path, &value).unwrap();

        let loaded: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, value);

        // No stray temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Sample> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/state.json");
        write_json_atomic(&path, &Sample { name: "n".into(), count: 0 }).unwrap();
        assert!(path.exists());
    }
}
