//! Durable storage for runs, checkpoints, and artifacts.
//!
//! Every store in this module shares the same discipline:
//! - keys are partitioned by run id, one directory per run
//! - every write goes to a temporary file and is renamed into place, so a
//!   crash mid-write leaves the previous valid record intact
//! - io failures surface as `StoreError::Unavailable` and are retried by the
//!   coordinator on the long-backoff profile, never here

pub mod artifact;
pub mod checkpoint;
pub mod lock;

pub use artifact::{Artifact, ArtifactStore};
pub use checkpoint::{Checkpoint, CheckpointStore, StageStats};
pub use lock::RunLocks;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

use crate::errors::StoreError;

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// The temporary file lives in the same directory as the target so the
/// rename is a same-filesystem atomic replace.
pub(crate) fn atomic_write_json<T: Serialize>(
    path: &Path,
    what: &str,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialize {
        what: what.to_string(),
        source,
    })?;

    let unavailable = |source: std::io::Error| StoreError::Unavailable {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().ok_or_else(|| {
        unavailable(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "store path has no parent directory",
        ))
    })?;
    std::fs::create_dir_all(parent).map_err(unavailable)?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).map_err(unavailable)?;
    std::fs::rename(&tmp, path).map_err(unavailable)?;
    Ok(())
}

/// Read and deserialize a JSON record, or `Ok(None)` if it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<Result<T, serde_json::Error>>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|source| StoreError::Unavailable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(serde_json::from_str(&content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        value: u32,
    }

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");
        atomic_write_json(&path, "record", &Record { value: 7 }).unwrap();
        let loaded: Record = read_json(&path).unwrap().unwrap().unwrap();
        assert_eq!(loaded, Record { value: 7 });
    }

    #[test]
    fn atomic_write_replaces_prior_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        atomic_write_json(&path, "record", &Record { value: 1 }).unwrap();
        atomic_write_json(&path, "record", &Record { value: 2 }).unwrap();
        let loaded: Record = read_json(&path).unwrap().unwrap().unwrap();
        assert_eq!(loaded.value, 2);
        // No stray temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn read_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result: Option<Result<Record, _>> =
            read_json(&dir.path().join("absent.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn read_garbage_surfaces_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        std::fs::write(&path, "{not json").unwrap();
        let result: Option<Result<Record, _>> = read_json(&path).unwrap();
        assert!(result.unwrap().is_err());
    }
}
