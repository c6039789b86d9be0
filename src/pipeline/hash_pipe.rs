//! Two-stage hashing pipeline
//!
//! Stage 1 ("prepare") moves a staged download into its final location,
//! fsyncing before the rename, and streams the stored file through SHA-512.
//! Stage 2 ("finalize") writes the hash sidecar and registers the file with
//! the dedup store. Both stages latch errors instead of stopping: a single
//! bad file must not stall the queues behind it, but any latched error marks
//! the whole backup as having a disk error.

use crate::error::{BackupError, Result};
use crate::store::{hash_sidecar_path, write_atomic, LinkStore};
use sha2::{Digest, Sha512};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

/// Work handed from the download worker to stage 1
#[derive(Debug)]
pub struct PrepareJob {
    /// Freshly downloaded staging file
    pub staging: PathBuf,
    /// Final location inside the backup tree
    pub target: PathBuf,
    /// Matching location inside the hashes tree
    pub hashes_target: PathBuf,
}

#[derive(Debug)]
struct FinalizeJob {
    target: PathBuf,
    hashes_target: PathBuf,
    hash: Vec<u8>,
    size: u64,
}

#[derive(Default)]
struct PipeShared {
    prepare_depth: AtomicUsize,
    finalize_depth: AtomicUsize,
    error: AtomicBool,
}

/// Counting sender into stage 1; clones share the depth gauge
#[derive(Clone)]
pub struct PrepareSender {
    tx: mpsc::Sender<PrepareJob>,
    shared: Arc<PipeShared>,
}

impl PrepareSender {
    /// Enqueue a job, blocking while stage 1 is full
    ///
    /// Returns `false` when the pipe has shut down.
    pub async fn send(&self, job: PrepareJob) -> bool {
        self.shared.prepare_depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(job).await.is_err() {
            self.shared.prepare_depth.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

/// The two hashing stages and their queues
pub struct HashPipe {
    sender: PrepareSender,
    shared: Arc<PipeShared>,
    prepare_handle: JoinHandle<()>,
    finalize_handle: JoinHandle<()>,
}

impl HashPipe {
    /// Spawn both stages with bounded queues of `capacity`
    #[must_use]
    pub fn spawn(link_store: Arc<LinkStore>, capacity: usize) -> Self {
        let shared = Arc::new(PipeShared::default());
        let (prepare_tx, prepare_rx) = mpsc::channel(capacity.max(1));
        let (finalize_tx, finalize_rx) = mpsc::channel(capacity.max(1));

        let prepare_handle = tokio::spawn(run_prepare(prepare_rx, finalize_tx, shared.clone()));
        let finalize_handle = tokio::spawn(run_finalize(finalize_rx, link_store, shared.clone()));

        Self {
            sender: PrepareSender {
                tx: prepare_tx,
                shared: shared.clone(),
            },
            shared,
            prepare_handle,
            finalize_handle,
        }
    }

    /// Sender for the download worker
    #[must_use]
    pub fn sender(&self) -> PrepareSender {
        self.sender.clone()
    }

    /// Current queue depths `(prepare, finalize)`
    #[must_use]
    pub fn queue_depths(&self) -> (usize, usize) {
        (
            self.shared.prepare_depth.load(Ordering::Relaxed),
            self.shared.finalize_depth.load(Ordering::Relaxed),
        )
    }

    /// Whether either stage has latched an error
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.shared.error.load(Ordering::Relaxed)
    }

    /// Close the pipe and wait for both stages to drain
    ///
    /// All other [`PrepareSender`] clones must be dropped first or the pipe
    /// never sees end of input.
    pub async fn join(self) -> bool {
        drop(self.sender);
        let _ = self.prepare_handle.await;
        let _ = self.finalize_handle.await;
        !self.shared.error.load(Ordering::Relaxed)
    }
}

async fn run_prepare(
    mut rx: mpsc::Receiver<PrepareJob>,
    finalize_tx: mpsc::Sender<FinalizeJob>,
    shared: Arc<PipeShared>,
) {
    while let Some(job) = rx.recv().await {
        shared.prepare_depth.fetch_sub(1, Ordering::Relaxed);
        match prepare_one(&job).await {
            Ok((hash, size)) => {
                shared.finalize_depth.fetch_add(1, Ordering::Relaxed);
                let sent = finalize_tx
                    .send(FinalizeJob {
                        target: job.target,
                        hashes_target: job.hashes_target,
                        hash,
                        size,
                    })
                    .await;
                if sent.is_err() {
                    shared.finalize_depth.fetch_sub(1, Ordering::Relaxed);
                    break;
                }
            }
            Err(e) => {
                error!("hash prepare of {} failed: {e}", job.target.display());
                shared.error.store(true, Ordering::Relaxed);
            }
        }
    }
}

/// Move the staged file into place and hash the stored content
async fn prepare_one(job: &PrepareJob) -> Result<(Vec<u8>, u64)> {
    let staged = tokio::fs::File::open(&job.staging)
        .await
        .map_err(|e| BackupError::Disk(format!("opening {}: {e}", job.staging.display())))?;
    staged
        .sync_all()
        .await
        .map_err(|e| BackupError::Disk(format!("syncing {}: {e}", job.staging.display())))?;
    drop(staged);

    if tokio::fs::rename(&job.staging, &job.target).await.is_err() {
        // Staging on a different filesystem; fall back to copy + rename
        let mut via = job.target.as_os_str().to_owned();
        via.push(".new");
        let via = PathBuf::from(via);
        tokio::fs::copy(&job.staging, &via).await.map_err(|e| {
            BackupError::Disk(format!(
                "copying {} to {}: {e}",
                job.staging.display(),
                via.display()
            ))
        })?;
        tokio::fs::rename(&via, &job.target).await.map_err(|e| {
            BackupError::Disk(format!("renaming into {}: {e}", job.target.display()))
        })?;
        let _ = tokio::fs::remove_file(&job.staging).await;
    }

    let mut file = tokio::fs::File::open(&job.target)
        .await
        .map_err(|e| BackupError::Disk(format!("opening {}: {e}", job.target.display())))?;
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| BackupError::Disk(format!("reading {}: {e}", job.target.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize().to_vec(), size))
}

async fn run_finalize(
    mut rx: mpsc::Receiver<FinalizeJob>,
    link_store: Arc<LinkStore>,
    shared: Arc<PipeShared>,
) {
    while let Some(job) = rx.recv().await {
        shared.finalize_depth.fetch_sub(1, Ordering::Relaxed);
        let sidecar = hash_sidecar_path(&job.hashes_target);
        let mut line = hex::encode(&job.hash);
        line.push('\n');
        if let Err(e) = write_atomic(&sidecar, line.as_bytes()).await {
            error!("writing hash sidecar {}: {e}", sidecar.display());
            shared.error.store(true, Ordering::Relaxed);
            continue;
        }
        if let Err(e) = link_store
            .register(&job.hash, job.size as i64, &job.target)
            .await
        {
            error!("registering {} for dedup: {e}", job.target.display());
            shared.error.store(true, Ordering::Relaxed);
        }
    }
}
