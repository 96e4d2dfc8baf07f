//! Completion markers for finished outputs.
//!
//! A finished output `foo.bin` is accompanied by `foo.bin.complete`, a small
//! JSON record of when it was finished and how large it was. An output counts
//! as complete only when both exist and the recorded size matches the file.

use crate::types::{ChipletResult, Dtype};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

const MARKER_SUFFIX: &str = ".complete";

/// Contents of a completion marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub completed_at: DateTime<Utc>,
    pub bytes: u64,
    pub dtype: Option<Dtype>,
    pub shape: Vec<usize>,
}

/// Path of the marker that accompanies `path`
pub fn marker_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(MARKER_SUFFIX);
    PathBuf::from(name)
}

/// Whether `path` was fully written by an earlier run
pub fn is_complete(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match read_record(path) {
        Some(record) => match fs::metadata(path) {
            Ok(meta) if meta.len() == record.bytes => true,
            Ok(meta) => {
                log::warn!(
                    "Marker for {} records {} bytes but file holds {}; treating as incomplete",
                    path.display(),
                    record.bytes,
                    meta.len()
                );
                false
            }
            Err(_) => false,
        },
        None => false,
    }
}

/// Marker record for `path`, if there is a readable one
pub fn read_record(path: &Path) -> Option<CompletionRecord> {
    let text = fs::read_to_string(marker_path(path)).ok()?;
    serde_json::from_str(&text).ok()
}

/// Record `path` as finished. With `protect`, the file is also made read-only.
pub fn mark_complete(
    path: &Path,
    dtype: Option<Dtype>,
    shape: &[usize],
    protect: bool,
) -> ChipletResult<()> {
    let record = CompletionRecord {
        completed_at: Utc::now(),
        bytes: fs::metadata(path)?.len(),
        dtype,
        shape: shape.to_vec(),
    };

    let marker = marker_path(path);
    let mut tmp_name: OsString = marker.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    fs::write(&tmp, serde_json::to_string_pretty(&record)?)?;
    fs::rename(&tmp, &marker)?;

    if protect {
        protect_path(path)?;
    }

    log::debug!("Marked {} complete", path.display());
    Ok(())
}

/// Remove a stale output and its marker so it can be rebuilt from scratch
pub fn clear(path: &Path) -> ChipletResult<()> {
    let marker = marker_path(path);
    if marker.exists() {
        fs::remove_file(&marker)?;
    }
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Make a file read-only
pub fn protect_path(path: &Path) -> ChipletResult<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        assert!(!is_complete(&path));

        fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(!is_complete(&path));

        mark_complete(&path, Some(Dtype::U8), &[4, 4, 4], false).unwrap();
        assert!(is_complete(&path));
        assert_eq!(read_record(&path).unwrap().shape, vec![4, 4, 4]);

        clear(&path).unwrap();
        assert!(!path.exists());
        assert!(!marker_path(&path).exists());
    }

    #[test]
    fn test_size_mismatch_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        fs::write(&path, vec![0u8; 64]).unwrap();
        mark_complete(&path, None, &[64], false).unwrap();

        fs::write(&path, vec![0u8; 32]).unwrap();
        assert!(!is_complete(&path));
    }

    #[test]
    fn test_protect_sets_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        fs::write(&path, "{}").unwrap();

        mark_complete(&path, None, &[], true).unwrap();
        assert!(fs::metadata(&path).unwrap().permissions().readonly());

        // read-only files can still be cleared for a rebuild
        clear(&path).unwrap();
        assert!(!path.exists());
    }
}
