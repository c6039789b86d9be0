//! Download queue and its worker
//!
//! The enumerator pushes file items, directory-close items and shadow-copy
//! control events into one bounded queue. A single worker drains it: shadow
//! events go to the agent control connection in order, file items become
//! transfers through the file client into staging files, and completed
//! staging files are handed to the hash pipe. With a protocol version of 3
//! or newer the worker keeps several transfers in flight; completion order
//! is not the enqueue order, so per-line outcomes are the only truth about
//! what succeeded.

use crate::client::{AgentConnection, FileClient};
use crate::error::{BackupError, Result};
use crate::pipeline::hash_pipe::{PrepareJob, PrepareSender};
use crate::store::metadata::metadata_blob_path;
use crate::store::{FileMetadata, MetadataWriter};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Command queue capacity; producers block when it is full
const QUEUE_CAPACITY: usize = 1000;

/// Sentinel predicted size used when download queueing is disabled
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// One enumerated file or directory-close event
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Monotonic ordinal of the list entry within this backup
    pub line: u64,
    /// Entry name as the agent sees it
    pub logical_path: String,
    /// Sanitised entry name
    pub os_path: String,
    /// Logical path of the containing directory, `/`-separated
    pub container_path: String,
    /// Sanitised path of the containing directory, `/`-separated
    pub container_os_path: String,
    /// Declared size, or [`UNKNOWN_SIZE`] when queueing is disabled
    pub predicted_size: u64,
    /// Metadata carried on the list entry
    pub metadata: FileMetadata,
    /// Entry lives under the reserved script directory
    pub is_script_dir: bool,
    /// Directory-close metadata item rather than a file
    pub is_dir: bool,
    /// Content already satisfied locally (dedup link or symlink)
    pub already_linked: bool,
}

impl WorkItem {
    /// Remote name the agent serves this entry under
    #[must_use]
    pub fn remote_name(&self) -> String {
        let container = self.container_path.trim_start_matches('/');
        if container.is_empty() {
            self.logical_path.clone()
        } else {
            format!("{container}/{}", self.logical_path)
        }
    }

    /// Path of this entry relative to the backup root
    #[must_use]
    pub fn os_rel(&self) -> PathBuf {
        let mut p: PathBuf = self
            .container_os_path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        p.push(&self.os_path);
        p
    }
}

/// Per-line transfer outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Fully transferred or satisfied locally
    Ok,
    /// Interrupted but kept (resumable-transfer configuration only)
    Partial,
    /// Failed; nothing stored
    Failed,
    /// Never attempted (cancel or offline drain)
    Skipped,
}

/// Recorded completion of one work item
#[derive(Debug, Clone, Copy)]
pub struct TransferResult {
    /// The item's list line
    pub line: u64,
    /// What happened
    pub outcome: TransferOutcome,
    /// Bytes that reached the staging file
    pub bytes_transferred: u64,
}

#[derive(Debug)]
enum QueueCommand {
    Full(WorkItem),
    ShadowBegin(String),
    ShadowEnd(String),
    Stop { abort: bool },
}

/// Fixed configuration of one download queue
#[derive(Debug, Clone)]
pub struct DownloadQueueConfig {
    /// Backup tree root
    pub backup_path: PathBuf,
    /// Hashes tree root
    pub hashes_path: PathBuf,
    /// Separate staging directory, if temporary files are configured
    pub staging_dir: Option<PathBuf>,
    /// Use per-block integrity hashes on transfers
    pub hashed_transfer: bool,
    /// Keep interrupted transfers as partial results
    pub save_incomplete: bool,
    /// Maximum transfers in flight
    pub pipeline_depth: usize,
    /// Consecutive retryable failures before the queue is declared offline
    pub offline_threshold: u32,
}

struct QueueShared {
    results: DashMap<u64, TransferResult>,
    max_ok_line: AtomicU64,
    offline: AtomicBool,
    skip: AtomicBool,
    disk_error: AtomicBool,
    consecutive_retryable: AtomicU32,
    save_incomplete: bool,
}

impl QueueShared {
    fn record(&self, line: u64, outcome: TransferOutcome, bytes_transferred: u64) {
        self.results.insert(
            line,
            TransferResult {
                line,
                outcome,
                bytes_transferred,
            },
        );
        if outcome == TransferOutcome::Ok {
            self.max_ok_line.fetch_max(line, Ordering::Relaxed);
        }
    }
}

/// Handle owned by the orchestrator
pub struct DownloadQueue {
    tx: Option<mpsc::Sender<QueueCommand>>,
    shared: Arc<QueueShared>,
    handle: Option<JoinHandle<()>>,
}

impl DownloadQueue {
    /// Spawn the worker
    #[must_use]
    pub fn spawn(
        client: Arc<dyn FileClient>,
        agent: Arc<dyn AgentConnection>,
        prepare: PrepareSender,
        config: DownloadQueueConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let shared = Arc::new(QueueShared {
            results: DashMap::new(),
            max_ok_line: AtomicU64::new(0),
            offline: AtomicBool::new(false),
            skip: AtomicBool::new(false),
            disk_error: AtomicBool::new(false),
            consecutive_retryable: AtomicU32::new(0),
            save_incomplete: config.save_incomplete,
        });
        let worker = Worker {
            rx,
            client,
            agent,
            prepare,
            shared: shared.clone(),
            config: Arc::new(config),
        };
        let handle = tokio::spawn(worker.run());
        Self {
            tx: Some(tx),
            shared,
            handle: Some(handle),
        }
    }

    /// Push a file or directory-close item, blocking while the queue is full
    pub async fn enqueue_full(&self, item: WorkItem) -> Result<()> {
        self.send(QueueCommand::Full(item)).await
    }

    /// Order a volume snapshot start relative to the queued items
    pub async fn enqueue_shadow_begin(&self, volume: &str) -> Result<()> {
        self.send(QueueCommand::ShadowBegin(volume.to_string()))
            .await
    }

    /// Order a volume snapshot release relative to the queued items
    pub async fn enqueue_shadow_end(&self, volume: &str) -> Result<()> {
        self.send(QueueCommand::ShadowEnd(volume.to_string())).await
    }

    async fn send(&self, cmd: QueueCommand) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(BackupError::Disk("download queue already stopped".into()));
        };
        tx.send(cmd)
            .await
            .map_err(|_| BackupError::Disk("download queue worker gone".into()))
    }

    /// Drain remaining transfers without storing anything
    pub fn queue_skip(&self) {
        self.shared.skip.store(true, Ordering::Relaxed);
    }

    /// Announce end of input; the worker drains and exits
    pub async fn queue_stop(&mut self, abort: bool) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(QueueCommand::Stop { abort }).await;
        }
    }

    /// Take the worker handle for the drain wait
    pub fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }

    /// Transport-level disconnect observed
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.shared.offline.load(Ordering::Relaxed)
    }

    /// A metadata write inside the worker failed
    #[must_use]
    pub fn has_disk_error(&self) -> bool {
        self.shared.disk_error.load(Ordering::Relaxed)
    }

    /// The line's content is stored (fully, or partially under a resumable
    /// configuration)
    #[must_use]
    pub fn is_download_ok(&self, line: u64) -> bool {
        self.shared
            .results
            .get(&line)
            .map(|r| matches!(r.outcome, TransferOutcome::Ok | TransferOutcome::Partial))
            .unwrap_or(false)
    }

    /// The line was kept as a partial transfer
    #[must_use]
    pub fn is_download_partial(&self, line: u64) -> bool {
        self.shared
            .results
            .get(&line)
            .map(|r| r.outcome == TransferOutcome::Partial)
            .unwrap_or(false)
    }

    /// High-water mark of fully-ok lines (not a claim about earlier lines)
    #[must_use]
    pub fn max_ok_line(&self) -> u64 {
        self.shared.max_ok_line.load(Ordering::Relaxed)
    }

    /// Sum of bytes recorded against completed items
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.shared
            .results
            .iter()
            .map(|r| r.bytes_transferred)
            .sum()
    }
}

struct Worker {
    rx: mpsc::Receiver<QueueCommand>,
    client: Arc<dyn FileClient>,
    agent: Arc<dyn AgentConnection>,
    prepare: PrepareSender,
    shared: Arc<QueueShared>,
    config: Arc<DownloadQueueConfig>,
}

impl Worker {
    async fn run(mut self) {
        let sem = Arc::new(Semaphore::new(self.config.pipeline_depth.max(1)));
        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut abort = false;

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                QueueCommand::ShadowBegin(volume) => {
                    if let Err(e) = self.agent.begin_shadow_copy(&volume).await {
                        warn!("starting shadow copy of \"{volume}\": {e}");
                    }
                }
                QueueCommand::ShadowEnd(volume) => {
                    if let Err(e) = self.agent.end_shadow_copy(&volume).await {
                        warn!("stopping shadow copy of \"{volume}\": {e}");
                    }
                }
                QueueCommand::Stop { abort: a } => {
                    abort = a;
                    break;
                }
                QueueCommand::Full(item) => {
                    if item.is_dir || item.already_linked {
                        self.finish_local(&item).await;
                        continue;
                    }
                    if self.shared.skip.load(Ordering::Relaxed)
                        || self.shared.offline.load(Ordering::Relaxed)
                    {
                        self.shared.record(item.line, TransferOutcome::Skipped, 0);
                        continue;
                    }
                    let Ok(permit) = sem.clone().acquire_owned().await else {
                        break;
                    };
                    let client = self.client.clone();
                    let prepare = self.prepare.clone();
                    let shared = self.shared.clone();
                    let config = self.config.clone();
                    inflight.spawn(async move {
                        let _permit = permit;
                        transfer_one(client, prepare, shared, config, item).await;
                    });
                }
            }
        }

        if abort {
            inflight.abort_all();
        }
        while inflight.join_next().await.is_some() {}
    }

    /// Record an item that needs no transfer, persisting its metadata
    async fn finish_local(&self, item: &WorkItem) {
        if !item.is_dir && item.metadata.exists {
            let blob = metadata_blob_path(&self.config.hashes_path.join(item.os_rel()));
            if let Err(e) = MetadataWriter::write(&blob, &item.metadata, true).await {
                warn!("writing metadata for {}: {e}", item.remote_name());
                self.shared.disk_error.store(true, Ordering::Relaxed);
            }
        }
        self.shared.record(item.line, TransferOutcome::Ok, 0);
    }
}

async fn transfer_one(
    client: Arc<dyn FileClient>,
    prepare: PrepareSender,
    shared: Arc<QueueShared>,
    config: Arc<DownloadQueueConfig>,
    item: WorkItem,
) {
    if shared.skip.load(Ordering::Relaxed) || shared.offline.load(Ordering::Relaxed) {
        shared.record(item.line, TransferOutcome::Skipped, 0);
        return;
    }

    let rel = item.os_rel();
    let target = config.backup_path.join(&rel);
    let hashes_target = config.hashes_path.join(&rel);
    let staging = match &config.staging_dir {
        Some(dir) => dir.join(format!("dl-{}.tmp", item.line)),
        None => {
            let mut name = target.as_os_str().to_owned();
            name.push(".dl");
            PathBuf::from(name)
        }
    };
    let remote = item.remote_name();

    match client
        .get_file(&remote, &staging, config.hashed_transfer, false)
        .await
    {
        Ok(()) => {
            shared.consecutive_retryable.store(0, Ordering::Relaxed);
            let bytes = tokio::fs::metadata(&staging)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            store_metadata(&shared, &item, &hashes_target).await;
            if prepare
                .send(PrepareJob {
                    staging,
                    target,
                    hashes_target,
                })
                .await
            {
                shared.record(item.line, TransferOutcome::Ok, bytes);
            } else {
                shared.disk_error.store(true, Ordering::Relaxed);
                shared.record(item.line, TransferOutcome::Failed, 0);
            }
        }
        Err(err) => {
            if err.is_retryable() {
                let failures = shared.consecutive_retryable.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= config.offline_threshold {
                    shared.offline.store(true, Ordering::Relaxed);
                }
            } else {
                shared.consecutive_retryable.store(0, Ordering::Relaxed);
            }
            let staged = tokio::fs::metadata(&staging)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            if shared.save_incomplete && staged > 0 {
                warn!(
                    "partial transfer of {remote}: {}",
                    client.error_string(err)
                );
                store_metadata(&shared, &item, &hashes_target).await;
                if prepare
                    .send(PrepareJob {
                        staging,
                        target,
                        hashes_target,
                    })
                    .await
                {
                    shared.record(item.line, TransferOutcome::Partial, staged);
                } else {
                    shared.disk_error.store(true, Ordering::Relaxed);
                    shared.record(item.line, TransferOutcome::Failed, 0);
                }
            } else {
                debug!("transfer of {remote} failed: {}", client.error_string(err));
                let _ = tokio::fs::remove_file(&staging).await;
                shared.record(item.line, TransferOutcome::Failed, staged);
            }
        }
    }
}

async fn store_metadata(shared: &QueueShared, item: &WorkItem, hashes_target: &std::path::Path) {
    if !item.metadata.exists {
        return;
    }
    let blob = metadata_blob_path(hashes_target);
    if let Err(e) = MetadataWriter::write(&blob, &item.metadata, true).await {
        warn!("writing metadata for {}: {e}", item.remote_name());
        shared.disk_error.store(true, Ordering::Relaxed);
    }
}
