//! Hash-indexed dedup store
//!
//! Given a content hash the agent declared, the link store asks the backup
//! index for prior on-disk copies and tries to hard-link (or reflink) one of
//! them into the new backup, substituting a local link for a network
//! transfer. Freshly stored files are registered back into the index so
//! future backups can link against them.

use super::{hash_sidecar_path, write_atomic};
use crate::dao::BackupDao;
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a dedup attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// A prior copy was linked into place; no transfer needed
    Linked,
    /// No usable prior copy
    Miss,
}

/// Hook reordering or filtering dedup candidates before linking
pub type CandidateFilter = dyn Fn(Vec<PathBuf>) -> Vec<PathBuf> + Send + Sync;

/// Dedup store over the backup index
pub struct LinkStore {
    dao: Arc<dyn BackupDao>,
    backupfolder: PathBuf,
    use_reflink: bool,
    candidate_filter: Option<Arc<CandidateFilter>>,
}

impl LinkStore {
    /// Create a store confined to `backupfolder`
    ///
    /// Candidates outside `backupfolder` are never linked, whatever the
    /// index claims.
    pub fn new(dao: Arc<dyn BackupDao>, backupfolder: PathBuf, use_reflink: bool) -> Self {
        Self {
            dao,
            backupfolder,
            use_reflink,
            candidate_filter: None,
        }
    }

    /// Install a candidate choice hook (backup-strategy supplied)
    #[must_use]
    pub fn with_candidate_filter(mut self, filter: Arc<CandidateFilter>) -> Self {
        self.candidate_filter = Some(filter);
        self
    }

    /// Try to satisfy `target` from a prior copy of `(hash, size)`
    ///
    /// On success the hash sidecar is written beside `hashes_target` and the
    /// new path is registered for future dedup. Failures degrade to `Miss`;
    /// dedup is an optimisation, never a correctness requirement.
    pub async fn try_link(
        &self,
        hash: &[u8],
        size: i64,
        target: &Path,
        hashes_target: &Path,
    ) -> LinkOutcome {
        let mut candidates = match self.dao.link_candidates(hash, size).await {
            Ok(c) => c,
            Err(e) => {
                warn!("dedup candidate lookup failed: {e}");
                return LinkOutcome::Miss;
            }
        };
        if let Some(filter) = &self.candidate_filter {
            candidates = filter(candidates);
        }

        for candidate in candidates {
            if !candidate.starts_with(&self.backupfolder) {
                debug!(
                    "skipping dedup candidate outside backup folder: {}",
                    candidate.display()
                );
                continue;
            }
            match self.link_once(&candidate, target) {
                Ok(()) => {
                    let sidecar = hash_sidecar_path(hashes_target);
                    let mut line = hex::encode(hash);
                    line.push('\n');
                    if let Err(e) = write_atomic(&sidecar, line.as_bytes()).await {
                        warn!("writing hash sidecar for linked file: {e}");
                    }
                    if let Err(e) = self.dao.register_linked(hash, size, target).await {
                        warn!("registering linked file: {e}");
                    }
                    debug!(
                        "linked {} from {}",
                        target.display(),
                        candidate.display()
                    );
                    return LinkOutcome::Linked;
                }
                Err(e) => {
                    debug!(
                        "dedup candidate {} unusable: {e}",
                        candidate.display()
                    );
                }
            }
        }
        LinkOutcome::Miss
    }

    /// Make a freshly stored file discoverable for future dedup
    pub async fn register(&self, hash: &[u8], size: i64, path: &Path) -> Result<()> {
        self.dao.register_linked(hash, size, path).await
    }

    fn link_once(&self, src: &Path, dst: &Path) -> std::io::Result<()> {
        if self.use_reflink {
            match reflink(src, dst) {
                Ok(()) => return Ok(()),
                Err(e) => debug!("reflink {} failed, trying hard link: {e}", src.display()),
            }
        }
        std::fs::hard_link(src, dst)
    }
}

/// Clone file content via the `FICLONE` ioctl (same-filesystem block sharing)
fn reflink(src: &Path, dst: &Path) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    const FICLONE: libc::c_ulong = 0x4004_9409;

    let src_file = std::fs::File::open(src)?;
    let dst_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)?;
    let rc = unsafe {
        libc::ioctl(
            dst_file.as_raw_fd(),
            FICLONE as libc::c_ulong,
            src_file.as_raw_fd(),
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        drop(dst_file);
        let _ = std::fs::remove_file(dst);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::FullDuration;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedDao {
        candidates: Vec<PathBuf>,
        registered: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl BackupDao for FixedDao {
        async fn last_full_durations(&self, _client_id: i64) -> Result<Vec<FullDuration>> {
            Ok(Vec::new())
        }
        async fn new_file_backup(
            &self,
            _incremental: i32,
            _client_id: i64,
            _path: &str,
            _tgroup: i32,
            _indexing_ms: i64,
            _group: i32,
        ) -> Result<i64> {
            Ok(1)
        }
        async fn update_file_backup_running(&self, _backup_id: i64) -> Result<()> {
            Ok(())
        }
        async fn set_file_backup_done(&self, _backup_id: i64) -> Result<()> {
            Ok(())
        }
        async fn link_candidates(&self, _hash: &[u8], _size: i64) -> Result<Vec<PathBuf>> {
            Ok(self.candidates.clone())
        }
        async fn register_linked(&self, _hash: &[u8], _size: i64, path: &Path) -> Result<()> {
            self.registered
                .lock()
                .expect("lock")
                .push(path.to_path_buf());
            Ok(())
        }
        async fn commit_backup(
            &self,
            _backup_id: i64,
            _list_new: &Path,
            _list_final: &Path,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn links_first_usable_candidate_and_registers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let old = root.join("old_backup");
        std::fs::create_dir_all(&old).expect("mkdir");
        let source = old.join("payload.bin");
        std::fs::write(&source, b"0123456789").expect("write source");

        let new = root.join("new_backup");
        let new_hashes = root.join("new_backup.hashes");
        std::fs::create_dir_all(&new).expect("mkdir");
        std::fs::create_dir_all(&new_hashes).expect("mkdir");

        let dao = Arc::new(FixedDao {
            candidates: vec![root.join("missing.bin"), source.clone()],
            registered: Mutex::new(Vec::new()),
        });
        let store = LinkStore::new(dao.clone(), root, false);

        let target = new.join("payload.bin");
        let hashes_target = new_hashes.join("payload.bin");
        let hash = [7u8; 64];
        let outcome = store.try_link(&hash, 10, &target, &hashes_target).await;
        assert_eq!(outcome, LinkOutcome::Linked);
        assert_eq!(std::fs::read(&target).expect("linked content"), b"0123456789");

        let sidecar = hash_sidecar_path(&hashes_target);
        let sidecar_text = std::fs::read_to_string(&sidecar).expect("sidecar");
        assert_eq!(sidecar_text.trim(), hex::encode(hash));

        assert_eq!(&*dao.registered.lock().expect("lock"), &vec![target]);
    }

    #[tokio::test]
    async fn candidates_outside_backup_folder_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("tempdir");
        let stray = outside.path().join("stray.bin");
        std::fs::write(&stray, b"data").expect("write");

        let dao = Arc::new(FixedDao {
            candidates: vec![stray],
            registered: Mutex::new(Vec::new()),
        });
        let store = LinkStore::new(dao, dir.path().to_path_buf(), false);
        let outcome = store
            .try_link(
                &[1u8; 64],
                4,
                &dir.path().join("t"),
                &dir.path().join("t.h"),
            )
            .await;
        assert_eq!(outcome, LinkOutcome::Miss);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dao = Arc::new(FixedDao {
            candidates: Vec::new(),
            registered: Mutex::new(Vec::new()),
        });
        let store = LinkStore::new(dao, dir.path().to_path_buf(), false);
        let outcome = store
            .try_link(
                &[2u8; 64],
                1,
                &dir.path().join("t"),
                &dir.path().join("t.h"),
            )
            .await;
        assert_eq!(outcome, LinkOutcome::Miss);
    }
}
