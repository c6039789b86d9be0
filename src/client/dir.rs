//! Directory-backed agent
//!
//! Serves the full agent contract from a local directory: list construction
//! walks the tree and writes a real list file (with content hashes), and
//! file transfers are local copies. This gives the whole pipeline an
//! end-to-end path without network infrastructure, for integration tests and
//! demos; production transports implement the same traits over the wire.

use super::{
    filelist_remote_name, AgentConnection, FileClient, ListRequestError, ProtocolVersions,
    TransferError,
};
use crate::list::escape_extra;
use crate::store::{encode_hash_dash, FileMetadata};
use async_trait::async_trait;
use sha2::{Digest, Sha512};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::debug;

/// One transfer stream over a local directory
pub struct DirFileClient {
    root: PathBuf,
    received: AtomicU64,
    transferred: AtomicU64,
}

impl DirFileClient {
    /// Serve files from `root`
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            received: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
        }
    }

    fn resolve(&self, remote_name: &str) -> Option<PathBuf> {
        // Anything after '|' is a token or transfer argument
        let name = remote_name.split('|').next().unwrap_or(remote_name);
        let mut out = self.root.clone();
        for comp in Path::new(name).components() {
            match comp {
                Component::Normal(seg) => out.push(seg),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(out)
    }
}

#[async_trait]
impl FileClient for DirFileClient {
    async fn get_file(
        &self,
        remote_name: &str,
        local_sink: &Path,
        _hashed_transfer: bool,
        _resume: bool,
    ) -> Result<(), TransferError> {
        let Some(source) = self.resolve(remote_name) else {
            return Err(TransferError::FileNotFound);
        };
        if !matches!(tokio::fs::try_exists(&source).await, Ok(true)) {
            return Err(TransferError::FileNotFound);
        }
        let bytes = tokio::fs::copy(&source, local_sink)
            .await
            .map_err(|_| TransferError::SocketError)?;
        self.received.fetch_add(bytes, Ordering::Relaxed);
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn received_bytes(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    fn real_transferred_bytes(&self) -> u64 {
        0
    }

    fn reset_received_bytes(&self) {
        self.received.store(0, Ordering::Relaxed);
    }
}

/// Control connection over a local directory
pub struct DirAgent {
    root: PathBuf,
}

impl DirAgent {
    /// An agent exposing `root` as its single backup volume set
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl AgentConnection for DirAgent {
    async fn request_filelist_construct(
        &self,
        _full: bool,
        group: i32,
    ) -> Result<(), ListRequestError> {
        if !self.root.is_dir() {
            return Err(ListRequestError::ConnectFail);
        }
        let root = self.root.clone();
        let result = tokio::task::spawn_blocking(move || build_agent_files(&root, group))
            .await
            .map_err(|e| ListRequestError::Other(e.to_string()))?;
        result.map_err(|e| ListRequestError::Other(e.to_string()))
    }

    async fn connect_file_client(
        &self,
        _timeout: Duration,
    ) -> Result<Arc<dyn FileClient>, TransferError> {
        if !self.root.is_dir() {
            return Err(TransferError::ConnectFailed);
        }
        Ok(Arc::new(DirFileClient::new(self.root.clone())))
    }

    fn is_internet_connection(&self) -> bool {
        false
    }

    fn protocol_versions(&self) -> ProtocolVersions {
        ProtocolVersions::default()
    }

    async fn begin_shadow_copy(&self, volume: &str) -> Result<(), TransferError> {
        debug!("local agent: shadow copy begin for \"{volume}\"");
        Ok(())
    }

    async fn end_shadow_copy(&self, volume: &str) -> Result<(), TransferError> {
        debug!("local agent: shadow copy end for \"{volume}\"");
        Ok(())
    }

    async fn send_backup_okay(&self, ok: bool) -> Result<(), TransferError> {
        debug!("local agent: backup okay = {ok}");
        Ok(())
    }
}

/// Walk the directory and write the list plus the metadata stream
fn build_agent_files(root: &Path, group: i32) -> std::io::Result<()> {
    let mut list = String::new();
    let mut meta_stream: Vec<u8> = Vec::new();
    walk(root, root, &mut list, &mut meta_stream)?;

    let control_dir = root.join("urbackup");
    std::fs::create_dir_all(&control_dir)?;
    let list_name = filelist_remote_name(group);
    std::fs::write(root.join(list_name), list)?;
    std::fs::write(control_dir.join("metadata.ub"), meta_stream)?;
    Ok(())
}

fn walk(
    root: &Path,
    dir: &Path,
    list: &mut String,
    meta_stream: &mut Vec<u8>,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if dir == root && name == "urbackup" {
            continue;
        }
        let path = entry.path();
        let md = std::fs::symlink_metadata(&path)?;
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if md.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            list.push_str(&format!(
                "f{} 0 {mtime}#sym_target={}&orig_sep=/\n",
                quote_name(&name),
                escape_extra(&target.to_string_lossy())
            ));
        } else if md.is_dir() {
            list.push_str(&format!(
                "d{} 0 {mtime}#mod={mtime}&orig_sep=/\n",
                quote_name(&name)
            ));
            walk(root, &path, list, meta_stream)?;
            list.push_str("d\"..\" 0 0\n");
        } else {
            let contents = std::fs::read(&path)?;
            let digest = Sha512::digest(&contents);
            let mode = unix_mode(&md);
            list.push_str(&format!(
                "f{} {} {mtime}#sha512={}&mode={mode}&mod={mtime}&orig_sep=/\n",
                quote_name(&name),
                contents.len(),
                encode_hash_dash(&digest)
            ));
            push_metadata_frame(meta_stream, root, &path, mode, mtime);
        }
    }
    Ok(())
}

fn quote_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(unix)]
fn unix_mode(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

fn push_metadata_frame(
    meta_stream: &mut Vec<u8>,
    root: &Path,
    path: &Path,
    mode: u32,
    mtime: i64,
) {
    let Ok(rel) = path.strip_prefix(root) else {
        return;
    };
    let rel = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
    let metadata = FileMetadata {
        exists: true,
        has_orig_path: true,
        orig_path: format!("/{rel}"),
        permissions: Some(mode),
        modified: Some(mtime),
        accessed: None,
        created: None,
    };
    let Ok(blob) = serde_json::to_vec(&metadata) else {
        return;
    };
    meta_stream.extend_from_slice(&(rel.len() as u32).to_le_bytes());
    meta_stream.extend_from_slice(rel.as_bytes());
    meta_stream.extend_from_slice(&(blob.len() as u32).to_le_bytes());
    meta_stream.extend_from_slice(&blob);
}
