//! On-disk stores beside the backup tree
//!
//! The hashes tree parallels the backup tree: per-file hash sidecars and
//! metadata blobs, plus the dedup link store that turns known content hashes
//! into hard links instead of transfers.

pub mod link_store;
pub mod metadata;

pub use link_store::{LinkOutcome, LinkStore};
pub use metadata::{FileMetadata, MetadataWriter, METADATA_DIR_FN};

use crate::error::{BackupError, Result};
use base64ct::{Base64, Encoding};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// File-name suffix of content hash sidecars
pub const HASH_SIDECAR_EXT: &str = "sha512";

/// Decode a dash-encoded base64 digest from the agent list
///
/// Dash encoding is standard base64 with `+` replaced by `-` so digests can
/// travel inside the `&`-separated extras field.
#[must_use]
pub fn decode_hash_dash(s: &str) -> Option<Vec<u8>> {
    let standard = s.replace('-', "+");
    Base64::decode_vec(&standard).ok()
}

/// Encode a digest for the agent list format
#[must_use]
pub fn encode_hash_dash(digest: &[u8]) -> String {
    Base64::encode_string(digest).replace('+', "-")
}

/// Sidecar path for a stored file: `<name>.sha512` in the hashes tree
#[must_use]
pub fn hash_sidecar_path(hashes_file: &Path) -> PathBuf {
    let mut name = hashes_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(HASH_SIDECAR_EXT);
    hashes_file.with_file_name(name)
}

/// Write `bytes` to `path` atomically: temp sibling, fsync, rename
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tmp_name.push_str(".new");
    let tmp = path.with_file_name(tmp_name);

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| BackupError::Disk(format!("creating {}: {e}", tmp.display())))?;
    file.write_all(bytes)
        .await
        .map_err(|e| BackupError::Disk(format!("writing {}: {e}", tmp.display())))?;
    file.sync_all()
        .await
        .map_err(|e| BackupError::Disk(format!("syncing {}: {e}", tmp.display())))?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        BackupError::Disk(format!(
            "renaming {} to {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dash_encoding_round_trips() {
        let digest: Vec<u8> = (0u8..=255).collect();
        let encoded = encode_hash_dash(&digest);
        assert!(!encoded.contains('+'));
        assert_eq!(decode_hash_dash(&encoded).expect("decodes"), digest);
    }

    #[test]
    fn bad_digest_is_none() {
        assert!(decode_hash_dash("not valid base64 !!").is_none());
    }

    #[test]
    fn sidecar_path_appends_extension() {
        assert_eq!(
            hash_sidecar_path(Path::new("/h/Volume/a.txt")),
            PathBuf::from("/h/Volume/a.txt.sha512")
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob");
        write_atomic(&path, b"one").await.expect("first write");
        write_atomic(&path, b"two").await.expect("second write");
        assert_eq!(std::fs::read(&path).expect("read"), b"two");
        // No temp litter left behind
        assert_eq!(std::fs::read_dir(dir.path()).expect("dir").count(), 1);
    }
}
