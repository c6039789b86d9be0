//! Per-file and per-directory metadata persistence
//!
//! Metadata read from list extras (and from the agent's metadata stream) is
//! stored as JSON blobs in the hashes tree: beside the hash sidecar for
//! files, under a reserved file name inside each directory.

use super::write_atomic;
use crate::error::Result;
use crate::list::Extras;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Reserved file name for directory metadata inside the hashes tree
pub const METADATA_DIR_FN: &str = ".dir_metadata";

/// File-name suffix of per-file metadata blobs
pub const METADATA_FILE_EXT: &str = "metadata";

/// Metadata blob path for a stored file: `<name>.metadata` in the hashes tree
#[must_use]
pub fn metadata_blob_path(hashes_file: &std::path::Path) -> std::path::PathBuf {
    let mut name = hashes_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(METADATA_FILE_EXT);
    hashes_file.with_file_name(name)
}

/// Attributes of one backed-up file or directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Any metadata was present on the list entry
    pub exists: bool,
    /// `orig_path` was carried explicitly rather than synthesised
    pub has_orig_path: bool,
    /// Path on the agent in its native separator
    pub orig_path: String,
    /// Unix permission bits
    pub permissions: Option<u32>,
    /// Modification time (agent clock)
    pub modified: Option<i64>,
    /// Access time
    pub accessed: Option<i64>,
    /// Creation time, where the agent filesystem has one
    pub created: Option<i64>,
}

impl FileMetadata {
    /// Extract metadata from list-entry extras
    #[must_use]
    pub fn read(extras: &Extras) -> Self {
        let orig_path = extras.get("orig_path").cloned();
        let permissions = extras.get("mode").and_then(|v| v.parse().ok());
        let modified = extras.get("mod").and_then(|v| v.parse().ok());
        let accessed = extras.get("accessed").and_then(|v| v.parse().ok());
        let created = extras.get("created").and_then(|v| v.parse().ok());
        let has_orig_path = orig_path.is_some();
        let exists = has_orig_path
            || permissions.is_some()
            || modified.is_some()
            || accessed.is_some()
            || created.is_some();
        Self {
            exists,
            has_orig_path,
            orig_path: orig_path.unwrap_or_default(),
            permissions,
            modified,
            accessed,
            created,
        }
    }
}

/// Atomic writer for metadata blobs
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataWriter;

impl MetadataWriter {
    /// Persist `metadata` at `path`
    ///
    /// With `overwrite` unset an existing blob is left untouched. I/O
    /// failures surface as `BackupError::Disk`; the orchestrator escalates
    /// them to a disk error on the whole backup.
    pub async fn write(path: &Path, metadata: &FileMetadata, overwrite: bool) -> Result<()> {
        if !overwrite && tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        let blob = serde_json::to_vec(metadata)
            .map_err(|e| crate::error::BackupError::Disk(format!("encoding metadata: {e}")))?;
        write_atomic(path, &blob).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extras(pairs: &[(&str, &str)]) -> Extras {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn read_synthesised_when_no_orig_path() {
        let m = FileMetadata::read(&extras(&[("mode", "420"), ("mod", "1700000000")]));
        assert!(m.exists);
        assert!(!m.has_orig_path);
        assert_eq!(m.permissions, Some(420));
        assert_eq!(m.modified, Some(1_700_000_000));
    }

    #[test]
    fn read_with_orig_path() {
        let m = FileMetadata::read(&extras(&[("orig_path", "C:\\Users\\x")]));
        assert!(m.exists);
        assert!(m.has_orig_path);
        assert_eq!(m.orig_path, "C:\\Users\\x");
    }

    #[test]
    fn empty_extras_mean_no_metadata() {
        let m = FileMetadata::read(&Extras::new());
        assert!(!m.exists);
    }

    #[tokio::test]
    async fn write_respects_overwrite_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(METADATA_DIR_FN);
        let first = FileMetadata {
            exists: true,
            orig_path: "one".to_string(),
            ..Default::default()
        };
        let second = FileMetadata {
            exists: true,
            orig_path: "two".to_string(),
            ..Default::default()
        };
        MetadataWriter::write(&path, &first, false).await.expect("write");
        MetadataWriter::write(&path, &second, false).await.expect("no-op");
        let read: FileMetadata =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(read.orig_path, "one");

        MetadataWriter::write(&path, &second, true).await.expect("overwrite");
        let read: FileMetadata =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(read.orig_path, "two");
    }
}
