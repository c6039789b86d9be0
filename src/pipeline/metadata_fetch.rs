//! Concurrent metadata sidecar download
//!
//! Agents stream a separate metadata file so per-file attributes are on the
//! server before hashing finishes. The stream is length-framed:
//! `[u32 path-len][path bytes][u32 blob-len][blob bytes]`, repeated. Each
//! blob lands in the hashes tree beside the file it describes. Failures here
//! degrade the backup's metadata, not its content, so they warn instead of
//! aborting.

use crate::client::{FileClient, METADATA_REMOTE_NAME};
use crate::store::metadata::metadata_blob_path;
use crate::store::write_atomic;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Background task pulling the agent's metadata stream
pub struct MetadataDownloader {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MetadataDownloader {
    /// Start the download onto `hashes_path`, staging in `staging_dir`
    ///
    /// The agent gates its metadata stream on the server token.
    pub fn spawn(
        client: Arc<dyn FileClient>,
        hashes_path: PathBuf,
        staging_dir: PathBuf,
        hashed_transfer: bool,
        server_token: String,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let staging = staging_dir.join("metadata-stream.tmp");
            let remote = format!("{METADATA_REMOTE_NAME}|{server_token}");
            let fetch = fetch_and_apply(client, &remote, &staging, &hashes_path, hashed_transfer);
            tokio::select! {
                () = fetch => {}
                changed = stop_rx.changed() => {
                    let _ = changed;
                    debug!("metadata download stopped before completion");
                }
            }
            let _ = tokio::fs::remove_file(&staging).await;
        });
        Self { stop_tx, handle }
    }

    /// Signal the task and wait for it to finish
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn fetch_and_apply(
    client: Arc<dyn FileClient>,
    remote: &str,
    staging: &Path,
    hashes_path: &Path,
    hashed_transfer: bool,
) {
    match client
        .get_file(remote, staging, hashed_transfer, false)
        .await
    {
        Ok(()) => {}
        Err(e) => {
            debug!("agent offers no metadata stream: {e}");
            return;
        }
    }
    let bytes = match tokio::fs::read(staging).await {
        Ok(b) => b,
        Err(e) => {
            warn!("reading staged metadata stream: {e}");
            return;
        }
    };
    apply_stream(&bytes, hashes_path).await;
}

async fn apply_stream(bytes: &[u8], hashes_path: &Path) {
    let mut offset = 0usize;
    while offset < bytes.len() {
        let Some((path, blob, next)) = next_frame(bytes, offset) else {
            warn!("metadata stream truncated at offset {offset}");
            return;
        };
        offset = next;
        let Some(rel) = sanitize_stream_path(path) else {
            warn!("metadata stream names unsafe path {path:?}, skipping");
            continue;
        };
        let blob_path = metadata_blob_path(&hashes_path.join(rel));

        if let Some(parent) = blob_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("creating metadata directory {}: {e}", parent.display());
                continue;
            }
        }
        if let Err(e) = write_atomic(&blob_path, blob).await {
            warn!("storing metadata blob {}: {e}", blob_path.display());
        }
    }
}

fn next_frame(bytes: &[u8], offset: usize) -> Option<(&str, &[u8], usize)> {
    let read_len = |at: usize| -> Option<(usize, usize)> {
        let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
        Some((u32::from_le_bytes(raw) as usize, at + 4))
    };
    let (path_len, at) = read_len(offset)?;
    let path = bytes.get(at..at + path_len)?;
    let (blob_len, at) = read_len(at + path_len)?;
    let blob = bytes.get(at..at + blob_len)?;
    let path = std::str::from_utf8(path).ok()?;
    Some((path, blob, at + blob_len))
}

/// Accept only plain relative paths from the agent stream
fn sanitize_stream_path(path: &str) -> Option<PathBuf> {
    let p = Path::new(path);
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(path: &str, blob: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(path.len() as u32).to_le_bytes());
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        out.extend_from_slice(blob);
        out
    }

    #[tokio::test]
    async fn frames_land_beside_the_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stream = frame("Volume/a.txt", b"{\"modified\":1}");
        stream.extend(frame("Volume/sub/b.txt", b"{\"modified\":2}"));
        apply_stream(&stream, dir.path()).await;
        assert_eq!(
            std::fs::read(dir.path().join("Volume/a.txt.metadata")).expect("blob a"),
            b"{\"modified\":1}"
        );
        assert_eq!(
            std::fs::read(dir.path().join("Volume/sub/b.txt.metadata")).expect("blob b"),
            b"{\"modified\":2}"
        );
    }

    #[tokio::test]
    async fn unsafe_paths_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stream = frame("../escape", b"x");
        stream.extend(frame("/absolute", b"y"));
        stream.extend(frame("ok.txt", b"z"));
        apply_stream(&stream, dir.path()).await;
        assert!(!dir.path().join("../escape.metadata").exists());
        assert!(dir.path().join("ok.txt.metadata").exists());
    }

    #[tokio::test]
    async fn truncated_stream_stops_quietly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stream = frame("a", b"1");
        stream.extend_from_slice(&[9, 0, 0, 0]);
        apply_stream(&stream, dir.path()).await;
        assert!(dir.path().join("a.metadata").exists());
    }
}
