//! Full file backup orchestrator
//!
//! Drives one full backup for one client and group through its whole
//! lifecycle: request the agent's file list, pull it into staging, open the
//! backup row, start the workers, enumerate the list (creating directories,
//! linking deduplicated content and queueing downloads), drain, verify,
//! rewrite the file list to reflect what actually arrived, commit and
//! publish. Cancellation, offline detection and disk errors are latched
//! flags, checked at the documented points; every exit path joins the
//! workers it started.

use super::publish::{self, TOKENS_LOCAL_NAME};
use super::strategy::{BackupMode, BackupStrategy, WriteItemCtx};
use super::{clientlist_name, clientlist_new_name, pretty_bytes, POST_HOOK_SCRIPT, SCRIPT_DIR_NAME};
use crate::client::{
    filelist_remote_name, AgentConnection, ListRequestError, TOKENS_REMOTE_NAME,
};
use crate::context::ServerContext;
use crate::dao::{interpolate_durations, BackupDao};
use crate::error::{BackupError, Outcome, Result};
use crate::list::{fix_for_os, FileListParser, FileListWriter, PathStack};
use crate::pipeline::{
    DownloadQueue, DownloadQueueConfig, HashPipe, MetadataDownloader, Progress, RunningUpdater,
    WorkItem, UNKNOWN_SIZE,
};
use crate::settings::{ServerSettings, GROUP_CONTINUOUS, GROUP_DEFAULT};
use crate::status::ServerStatus;
use crate::store::{decode_hash_dash, hash_sidecar_path, LinkOutcome, LinkStore, MetadataWriter};
use crate::store::{FileMetadata, METADATA_DIR_FN};
use rand::Rng;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, warn};

/// Budget for opening a transfer stream to the agent
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// In-flight transfers when the protocol allows pipelining
const PIPELINE_DEPTH: usize = 8;
/// Consecutive retryable transfer failures before the client counts as offline
const OFFLINE_RETRYABLE_THRESHOLD: u32 = 3;
/// Bound of each hash pipe stage
const HASH_QUEUE_CAPACITY: usize = 100;
/// Default agent-side path separator when the list does not name one
const DEFAULT_ORIG_SEP: &str = "\\";

/// Summary of one finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Terminal outcome; publication happened only on `Success`
    pub outcome: Outcome,
    /// Backup row id, when one was created
    pub backup_id: Option<i64>,
    /// Root of the new backup tree, when it was created
    pub backup_path: Option<PathBuf>,
    /// Payload bytes moved over the wire
    pub transferred_bytes: u64,
    /// Bytes satisfied by dedup links instead of transfer
    pub linked_bytes: u64,
    /// Continuous-backup sequence numbers observed per top-level directory
    pub continuous_sequences: HashMap<String, (i64, i64)>,
}

impl RunReport {
    fn aborted(outcome: Outcome) -> Self {
        Self {
            outcome,
            backup_id: None,
            backup_path: None,
            transferred_bytes: 0,
            linked_bytes: 0,
            continuous_sequences: HashMap::new(),
        }
    }

    /// The success boolean reported to callers
    #[must_use]
    pub const fn success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Orchestrator for one full backup of one client
pub struct FullFileBackup {
    ctx: ServerContext,
    settings: Arc<ServerSettings>,
    dao: Arc<dyn BackupDao>,
    status: Arc<ServerStatus>,
    agent: Arc<dyn AgentConnection>,
    strategy: Arc<dyn BackupStrategy>,
    client_id: i64,
    client_name: String,
    status_id: u64,
    group: i32,
}

impl FullFileBackup {
    /// Wire up an orchestrator; nothing runs until [`run`](Self::run)
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: ServerContext,
        settings: Arc<ServerSettings>,
        dao: Arc<dyn BackupDao>,
        status: Arc<ServerStatus>,
        agent: Arc<dyn AgentConnection>,
        strategy: Arc<dyn BackupStrategy>,
        client_id: i64,
        client_name: impl Into<String>,
        status_id: u64,
        group: i32,
    ) -> Self {
        Self {
            ctx,
            settings,
            dao,
            status,
            agent,
            strategy,
            client_id,
            client_name: client_name.into(),
            status_id,
            group,
        }
    }

    /// Run the backup to a terminal outcome
    #[allow(clippy::too_many_lines)]
    pub async fn run(&self) -> RunReport {
        info!("Starting full file backup...");
        let identity = self
            .agent
            .session_identity()
            .unwrap_or_else(|| self.ctx.server_identity.clone());
        debug!("{}: using server identity \"{identity}\"", self.client_name);

        let durations = match self.dao.last_full_durations(self.client_id).await {
            Ok(d) => d,
            Err(e) => {
                warn!("reading previous backup durations: {e}");
                Vec::new()
            }
        };
        let estimate = interpolate_durations(&durations);
        let mut progress = Progress::new(
            self.status.clone(),
            self.client_name.clone(),
            self.status_id,
            Duration::from_millis(self.settings.status_update_interval_ms),
            Duration::from_millis(self.settings.eta_update_interval_ms),
        );
        progress.seed_eta(estimate.indexing_ms + estimate.duration_s * 1000);

        let indexing_start = Instant::now();
        if let Err(e) = self.agent.request_filelist_construct(true, self.group).await {
            let log_backup = !matches!(
                e,
                ListRequestError::NoBackupDirs | ListRequestError::ConnectFail
            );
            error!(
                "Constructing of file list of \"{}\" failed: {e}",
                self.client_name
            );
            return RunReport::aborted(Outcome::EarlyAbort { log_backup });
        }

        let internet = self.agent.is_internet_connection();
        let hashed_transfer = self.settings.hashed_transfer(internet);
        let save_incomplete = self.settings.save_incomplete_files(internet);
        if hashed_transfer {
            debug!("{}: Doing backup with hashed transfer...", self.client_name);
        } else {
            debug!(
                "{}: Doing backup without hashed transfer...",
                self.client_name
            );
        }

        let client = match self.agent.connect_file_client(CONNECT_TIMEOUT).await {
            Ok(c) => c,
            Err(_) => {
                error!(
                    "Full Backup of \"{}\" failed - CONNECT error",
                    self.client_name
                );
                return RunReport::aborted(Outcome::EarlyAbort { log_backup: false });
            }
        };

        let staging_dir = self.settings.staging_dir();
        if let Err(e) = tokio::fs::create_dir_all(&staging_dir).await {
            error!(
                "Error creating staging directory \"{}\": {e}",
                staging_dir.display()
            );
            return RunReport::aborted(Outcome::DiskError);
        }
        let list_file_path = staging_dir.join(format!(
            "filelist-{}-{}-{:08x}.ub",
            fix_for_os(&self.client_name),
            self.group,
            rand::rng().random::<u32>()
        ));

        info!("{}: Loading file list...", self.client_name);
        let transfer_start = Instant::now();
        if let Err(e) = client
            .get_file(
                &filelist_remote_name(self.group),
                &list_file_path,
                hashed_transfer,
                false,
            )
            .await
        {
            error!(
                "Error getting filelist of \"{}\". Errorcode: {} ({e:?})",
                self.client_name,
                client.error_string(e)
            );
            let _ = tokio::fs::remove_file(&list_file_path).await;
            return RunReport::aborted(Outcome::EarlyAbort { log_backup: true });
        }

        let (backup_path_single, backup_path, hashes_path) = match self.create_backup_dirs().await
        {
            Ok(paths) => paths,
            Err(e) => {
                error!("{e}");
                let _ = tokio::fs::remove_file(&list_file_path).await;
                return RunReport::aborted(Outcome::DiskError);
            }
        };

        // Token file feeds user views on publish; absence is normal
        if let Err(e) = client
            .get_file(
                TOKENS_REMOTE_NAME,
                &hashes_path.join(TOKENS_LOCAL_NAME),
                hashed_transfer,
                false,
            )
            .await
        {
            debug!("token file not available: {}", client.error_string(e));
        }

        let incremental = match self.strategy.mode() {
            BackupMode::Full => 0,
            BackupMode::Incremental => 1,
        };
        let indexing_ms = indexing_start.elapsed().as_millis() as i64;
        let backup_id = match self
            .dao
            .new_file_backup(
                incremental,
                self.client_id,
                &backup_path_single,
                self.group,
                indexing_ms,
                self.group,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!("Creating backup row failed: {e}");
                let _ = tokio::fs::remove_file(&list_file_path).await;
                return RunReport::aborted(Outcome::EarlyAbort { log_backup: true });
            }
        };

        if self
            .status
            .get_process(&self.client_name, self.status_id)
            .stop
        {
            error!("Server admin stopped backup.");
            let _ = tokio::fs::remove_file(&list_file_path).await;
            return RunReport {
                outcome: Outcome::UserCancelled,
                backup_id: Some(backup_id),
                backup_path: Some(backup_path),
                transferred_bytes: client.transferred_bytes(),
                linked_bytes: 0,
                continuous_sequences: HashMap::new(),
            };
        }

        let meta_client = match self.agent.connect_file_client(CONNECT_TIMEOUT).await {
            Ok(c) => c,
            Err(_) => {
                error!("Error starting file metadata download thread");
                let _ = tokio::fs::remove_file(&list_file_path).await;
                return RunReport {
                    backup_id: Some(backup_id),
                    backup_path: Some(backup_path),
                    ..RunReport::aborted(Outcome::EarlyAbort { log_backup: true })
                };
            }
        };
        let metadata_dl = MetadataDownloader::spawn(
            meta_client,
            hashes_path.clone(),
            staging_dir.clone(),
            hashed_transfer,
            self.ctx.server_token.clone(),
        );

        let mut list_file = match tokio::fs::File::open(&list_file_path).await {
            Ok(f) => f,
            Err(e) => {
                error!("Opening staged file list failed: {e}");
                metadata_dl.stop().await;
                let _ = tokio::fs::remove_file(&list_file_path).await;
                return RunReport {
                    backup_id: Some(backup_id),
                    backup_path: Some(backup_path),
                    ..RunReport::aborted(Outcome::DiskError)
                };
            }
        };

        // First streaming walk: byte total for progress, entry total for the
        // line-totality check of the rewrite pass
        let (files_size, total_entries) = match self.count_list(&mut list_file).await {
            Ok(t) => t,
            Err(e) => {
                error!("File list of \"{}\" is corrupt: {e}", self.client_name);
                metadata_dl.stop().await;
                let _ = tokio::fs::remove_file(&list_file_path).await;
                return RunReport {
                    backup_id: Some(backup_id),
                    backup_path: Some(backup_path),
                    ..RunReport::aborted(Outcome::ListCorrupt)
                };
            }
        };
        client.reset_received_bytes();

        let running = RunningUpdater::spawn(
            self.dao.clone(),
            backup_id,
            Duration::from_millis(self.settings.heartbeat_interval_ms),
        );
        let strategy = self.strategy.clone();
        let link_store = Arc::new(
            LinkStore::new(
                self.dao.clone(),
                self.settings.backupfolder.clone(),
                self.settings.use_reflink,
            )
            .with_candidate_filter(Arc::new(move |c| strategy.choose_candidates(c))),
        );
        let hash_pipe = HashPipe::spawn(link_store.clone(), HASH_QUEUE_CAPACITY);
        let queue_downloads = self.agent.protocol_versions().filesrv > 2;
        let mut queue = DownloadQueue::spawn(
            client.clone(),
            self.agent.clone(),
            hash_pipe.sender(),
            DownloadQueueConfig {
                backup_path: backup_path.clone(),
                hashes_path: hashes_path.clone(),
                staging_dir: self.settings.use_tmpfiles.then(|| staging_dir.clone()),
                hashed_transfer,
                save_incomplete,
                pipeline_depth: if queue_downloads { PIPELINE_DEPTH } else { 1 },
                offline_threshold: OFFLINE_RETRYABLE_THRESHOLD,
            },
        );

        info!("{}: Started loading files...", self.client_name);

        let mut parser = FileListParser::new();
        let mut stack = PathStack::new();
        let mut orig_sep = DEFAULT_ORIG_SEP.to_string();
        let mut continuous_sequences: HashMap<String, (i64, i64)> = HashMap::new();

        let mut line: u64 = 0;
        let mut max_ok_id: u64 = 0;
        let mut linked_bytes: u64 = 0;
        let mut r_done = false;
        let mut user_cancelled = false;
        let mut is_offline = false;
        let mut c_has_error = false;
        let mut list_corrupt = false;
        let mut disk_error = false;
        let mut script_dir = false;

        if list_file.seek(SeekFrom::Start(0)).await.is_err() {
            disk_error = true;
        }

        let mut buf = [0u8; 4096];
        'outer: while !disk_error {
            let read = match list_file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    error!("Reading staged file list failed: {e}");
                    disk_error = true;
                    break;
                }
            };
            for &byte in &buf[..read] {
                let entry = match parser.next_entry(byte) {
                    Ok(None) => continue,
                    Ok(Some(entry)) => entry,
                    Err(e) => {
                        error!("File list of \"{}\" is corrupt: {e}", self.client_name);
                        list_corrupt = true;
                        break 'outer;
                    }
                };

                let mut metadata = FileMetadata::read(&entry.extras);
                if metadata.has_orig_path {
                    stack.set_orig(metadata.orig_path.clone());
                    match entry.extras.get("orig_sep") {
                        Some(sep) if !sep.is_empty() => orig_sep = sep.clone(),
                        _ => orig_sep = DEFAULT_ORIG_SEP.to_string(),
                    }
                }

                if progress.status_due() {
                    if self
                        .status
                        .get_process(&self.client_name, self.status_id)
                        .stop
                    {
                        error!("Server admin stopped backup.");
                        r_done = true;
                        user_cancelled = true;
                        queue.queue_skip();
                        break 'outer;
                    }
                    progress.publish_status(
                        client.received_bytes() + linked_bytes,
                        files_size,
                        hash_pipe.queue_depths(),
                    );
                }
                progress.maybe_eta(client.received_bytes() + linked_bytes, files_size);

                if queue.is_offline() {
                    error!("Client {} went offline.", self.client_name);
                    is_offline = true;
                    r_done = true;
                    break 'outer;
                }

                let os_name = fix_for_os(&entry.name);
                if entry.is_dir {
                    if entry.name != ".." {
                        stack.enter(&entry.name, &os_name);
                        if !metadata.has_orig_path {
                            stack.push_orig(&orig_sep, &entry.name);
                            metadata.orig_path = stack.orig().to_string();
                            metadata.exists = true;
                            metadata.has_orig_path = true;
                        }
                        let local_rel = stack.os_rel();
                        let dir_path = backup_path.join(&local_rel);
                        if let Some(target) = entry.extras.get("sym_target") {
                            if let Err(e) =
                                create_agent_symlink(&dir_path, target, &orig_sep).await
                            {
                                error!(
                                    "Creating symlink at \"{}\" to \"{}\" failed. {e}",
                                    dir_path.display(),
                                    target
                                );
                                c_has_error = true;
                                break 'outer;
                            }
                        } else if let Err(e) = tokio::fs::create_dir(&dir_path).await {
                            error!(
                                "Creating directory \"{}\" failed. {e}",
                                dir_path.display()
                            );
                            c_has_error = true;
                            break 'outer;
                        }
                        let hashes_dir = hashes_path.join(&local_rel);
                        if let Err(e) = tokio::fs::create_dir(&hashes_dir).await {
                            error!(
                                "Creating directory \"{}\" failed. {e}",
                                hashes_dir.display()
                            );
                            c_has_error = true;
                            break 'outer;
                        }
                        if metadata.exists {
                            if let Err(e) = MetadataWriter::write(
                                &hashes_dir.join(METADATA_DIR_FN),
                                &metadata,
                                false,
                            )
                            .await
                            {
                                error!(
                                    "Writing directory metadata to \"{}\" failed. {e}",
                                    hashes_dir.join(METADATA_DIR_FN).display()
                                );
                                c_has_error = true;
                                break 'outer;
                            }
                        }
                        if stack.depth() == 1 {
                            if entry.name == SCRIPT_DIR_NAME {
                                script_dir = true;
                            } else {
                                debug!("Starting shadowcopy \"{}\".", entry.name);
                                if queue.enqueue_shadow_begin(&entry.name).await.is_err() {
                                    disk_error = true;
                                    break 'outer;
                                }
                                let seq_id = extra_i64(&entry.extras, "sequence_id");
                                let seq_next = extra_i64(&entry.extras, "sequence_next");
                                continuous_sequences
                                    .insert(entry.name.clone(), (seq_id, seq_next));
                            }
                        }
                    } else {
                        if self.agent.protocol_versions().file_meta > 0
                            && !script_dir
                            && stack.depth() > 0
                        {
                            let item = WorkItem {
                                line,
                                logical_path: stack
                                    .logical_leaf()
                                    .unwrap_or_default()
                                    .to_string(),
                                os_path: stack.os_leaf().unwrap_or_default().to_string(),
                                container_path: stack.logical_container(),
                                container_os_path: stack.os_container(),
                                predicted_size: 0,
                                metadata: metadata.clone(),
                                is_script_dir: script_dir,
                                is_dir: true,
                                already_linked: false,
                            };
                            if queue.enqueue_full(item).await.is_err() {
                                disk_error = true;
                                break 'outer;
                            }
                        }
                        if stack.depth() == 1 {
                            let top = stack.top().unwrap_or_default().to_string();
                            if top == SCRIPT_DIR_NAME {
                                script_dir = false;
                            } else {
                                debug!("Stopping shadowcopy \"{top}\".");
                                if queue.enqueue_shadow_end(&top).await.is_err() {
                                    disk_error = true;
                                    break 'outer;
                                }
                            }
                        }
                        if let Err(e) = stack.leave() {
                            error!("File list of \"{}\" is corrupt: {e}", self.client_name);
                            list_corrupt = true;
                            break 'outer;
                        }
                        if !metadata.has_orig_path {
                            stack.pop_orig(&orig_sep);
                        }
                    }
                } else {
                    if !metadata.has_orig_path {
                        metadata.orig_path =
                            format!("{}{}{}", stack.orig(), orig_sep, entry.name);
                    }

                    let mut file_ok = false;
                    if let Some(target) = entry.extras.get("sym_target") {
                        let symlink_path = backup_path.join(stack.os_rel()).join(&os_name);
                        if let Err(e) =
                            create_agent_symlink(&symlink_path, target, &orig_sep).await
                        {
                            error!(
                                "Creating symlink at \"{}\" to \"{}\" failed. {e}",
                                symlink_path.display(),
                                target
                            );
                            c_has_error = true;
                            break 'outer;
                        }
                        file_ok = true;
                    } else if let Some(hash_text) = entry.extras.get("sha512") {
                        match decode_hash_dash(hash_text) {
                            Some(hash) if hash.len() == 64 => {
                                let rel = stack.os_rel().join(&os_name);
                                let target = backup_path.join(&rel);
                                let hashes_target = hashes_path.join(&rel);
                                if link_store
                                    .try_link(&hash, entry.size, &target, &hashes_target)
                                    .await
                                    == LinkOutcome::Linked
                                {
                                    file_ok = true;
                                    linked_bytes += entry.size.max(0) as u64;
                                    if line > max_ok_id {
                                        max_ok_id = line;
                                    }
                                }
                            }
                            _ => {
                                warn!(
                                    "Client \"{}\" sent unusable content hash for \"{}\"",
                                    self.client_name, entry.name
                                );
                            }
                        }
                    }

                    let predicted_size = if file_ok {
                        0
                    } else if queue_downloads {
                        entry.size.max(0) as u64
                    } else {
                        UNKNOWN_SIZE
                    };
                    let item = WorkItem {
                        line,
                        logical_path: entry.name.clone(),
                        os_path: os_name,
                        container_path: stack.logical(),
                        container_os_path: stack.os_str(),
                        predicted_size,
                        metadata: metadata.clone(),
                        is_script_dir: script_dir,
                        is_dir: false,
                        already_linked: file_ok,
                    };
                    if queue.enqueue_full(item).await.is_err() {
                        disk_error = true;
                        break 'outer;
                    }
                }

                line += 1;
            }
        }

        queue.queue_stop(false).await;
        info!("Waiting for file transfers...");
        if let Some(mut handle) = queue.take_handle() {
            loop {
                tokio::select! {
                    _ = &mut handle => break,
                    () = tokio::time::sleep(Duration::from_secs(1)) => {
                        let done = client.received_bytes() + linked_bytes;
                        progress.publish_status(done, files_size, hash_pipe.queue_depths());
                        progress.maybe_eta(done, files_size);
                    }
                }
            }
        }
        progress.publish_status(
            client.received_bytes() + linked_bytes,
            files_size,
            hash_pipe.queue_depths(),
        );

        if queue.is_offline() && !is_offline {
            error!("Client {} went offline.", self.client_name);
            is_offline = true;
            r_done = true;
        }
        let max_line = line;

        if let Err(e) = self.agent.send_backup_okay(!r_done && !c_has_error).await {
            debug!("sending backup-okay signal: {e}");
        }

        running.stop().await;
        if let Err(e) = self.dao.update_file_backup_running(backup_id).await {
            warn!("final running heartbeat: {e}");
        }

        info!("Writing new file list...");
        let list_dir = self.settings.backupfolder.join(&self.client_name);
        let new_list_path = list_dir.join(clientlist_new_name(self.group));
        match self
            .write_new_list(
                &mut list_file,
                &new_list_path,
                max_line,
                max_ok_id,
                total_entries,
                &queue,
            )
            .await
        {
            Ok(()) => {}
            Err(BackupError::ListCorrupt(e)) => {
                error!("File list of \"{}\" is corrupt: {e}", self.client_name);
                list_corrupt = true;
            }
            Err(e) => {
                error!("Writing new file list failed: {e}");
                disk_error = true;
            }
        }

        info!("Waiting for file hashing and copying threads...");
        let pipe_ok = hash_pipe.join().await;
        if !pipe_ok || queue.has_disk_error() {
            disk_error = true;
        }

        let mut verification_ok = true;
        let verify_enabled = self.settings.end_to_end_file_backup_verification
            || (internet
                && self.settings.verify_using_client_hashes
                && self.settings.internet_calculate_filehashes_on_client);
        if !r_done && !c_has_error && !list_corrupt && !disk_error && verify_enabled {
            match self
                .verify_backup(&mut list_file, &hashes_path, &queue)
                .await
            {
                Ok(true) => info!("Backup verification ok"),
                Ok(false) | Err(_) => {
                    error!("Backup verification failed");
                    c_has_error = true;
                    verification_ok = false;
                }
            }
        }

        if !disk_error && !r_done && !c_has_error && !list_corrupt && verification_ok {
            let final_list = list_dir.join(clientlist_name(self.group));
            if let Err(e) = self
                .dao
                .commit_backup(backup_id, &new_list_path, &final_list)
                .await
            {
                error!("Sealing backup in index failed: {e}");
                disk_error = true;
            } else if self.group == GROUP_DEFAULT || self.group == GROUP_CONTINUOUS {
                publish::publish_backup(
                    &self.settings,
                    &self.client_name,
                    self.group,
                    &backup_path,
                    &hashes_path,
                )
                .await;
            }
        }

        let _ = tokio::fs::remove_file(&list_file_path).await;
        metadata_dl.stop().await;

        let transferred = client.transferred_bytes();
        let real_transferred = client.real_transferred_bytes();
        let passed_ms = transfer_start.elapsed().as_millis().max(1) as u64;
        info!(
            "Transferred {} - Average speed: {}/s",
            pretty_bytes(transferred),
            pretty_bytes(transferred.saturating_mul(1000) / passed_ms)
        );
        if real_transferred > 0 {
            info!(
                "(Before compression: {} ratio: {:.2})",
                pretty_bytes(real_transferred),
                real_transferred as f64 / transferred.max(1) as f64
            );
        }

        run_post_hook(&backup_path).await;

        let outcome = if list_corrupt {
            Outcome::ListCorrupt
        } else if disk_error {
            Outcome::DiskError
        } else if !verification_ok {
            Outcome::VerificationFailed
        } else if user_cancelled {
            Outcome::UserCancelled
        } else if is_offline {
            Outcome::Offline
        } else if c_has_error {
            Outcome::DiskError
        } else {
            Outcome::Success
        };

        RunReport {
            outcome,
            backup_id: Some(backup_id),
            backup_path: Some(backup_path),
            transferred_bytes: transferred,
            linked_bytes,
            continuous_sequences,
        }
    }

    /// Create the backup and hashes tree roots for this run
    async fn create_backup_dirs(&self) -> Result<(String, PathBuf, PathBuf)> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let backup_path_single = format!("full_{secs}-{:04x}", rand::rng().random::<u16>());
        let client_dir = self.settings.backupfolder.join(&self.client_name);
        let backup_path = client_dir.join(&backup_path_single);
        let hashes_path = client_dir.join(format!("{backup_path_single}.hashes"));
        for dir in [&backup_path, &hashes_path] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                BackupError::Disk(format!(
                    "Creating backup directory \"{}\" failed: {e}",
                    dir.display()
                ))
            })?;
        }
        Ok((backup_path_single, backup_path, hashes_path))
    }

    /// First walk: sum of declared file sizes and the number of entries
    async fn count_list(&self, list_file: &mut tokio::fs::File) -> Result<(u64, u64)> {
        list_file
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| BackupError::Disk(format!("seeking staged file list: {e}")))?;
        let mut parser = FileListParser::new();
        let mut buf = [0u8; 4096];
        let mut bytes: u64 = 0;
        let mut entries: u64 = 0;
        loop {
            let read = list_file
                .read(&mut buf)
                .await
                .map_err(|e| BackupError::Disk(format!("reading staged file list: {e}")))?;
            if read == 0 {
                break;
            }
            for &b in &buf[..read] {
                if let Some(entry) = parser.next_entry(b)? {
                    if !entry.is_dir {
                        bytes += entry.size.max(0) as u64;
                    }
                    entries += 1;
                }
            }
        }
        Ok((bytes, entries))
    }

    /// Second walk: emit the new list containing only what actually arrived
    async fn write_new_list(
        &self,
        list_file: &mut tokio::fs::File,
        new_list_path: &Path,
        max_line: u64,
        max_ok_id: u64,
        expected_entries: u64,
        queue: &DownloadQueue,
    ) -> Result<()> {
        if let Some(parent) = new_list_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BackupError::Disk(format!("creating {}: {e}", parent.display()))
            })?;
        }
        list_file
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| BackupError::Disk(format!("seeking staged file list: {e}")))?;
        let mut parser = FileListParser::new();
        let mut writer = FileListWriter::create(new_list_path).await?;
        let ok_line_cap = queue.max_ok_line().max(max_ok_id);
        let mut buf = [0u8; 4096];
        let mut line: u64 = 0;
        loop {
            let read = list_file
                .read(&mut buf)
                .await
                .map_err(|e| BackupError::Disk(format!("reading staged file list: {e}")))?;
            if read == 0 {
                break;
            }
            for &b in &buf[..read] {
                let Some(mut entry) = parser.next_entry(b)? else {
                    continue;
                };
                let ctx = WriteItemCtx {
                    line,
                    max_line,
                    ok_line_cap,
                    download_ok: queue.is_download_ok(line),
                };
                if self.strategy.keep_item(&entry, &ctx) {
                    if !entry.is_dir && queue.is_download_partial(line) {
                        entry.last_modified = poison_timestamp(entry.last_modified);
                    }
                    writer.write_item(&entry).await?;
                }
                line += 1;
            }
        }
        writer.finish().await?;
        if line != expected_entries {
            return Err(BackupError::ListCorrupt(format!(
                "list rewrite saw {line} entries, first walk saw {expected_entries}"
            )));
        }
        Ok(())
    }

    /// Third walk: cross-check stored hash sidecars against declared hashes
    async fn verify_backup(
        &self,
        list_file: &mut tokio::fs::File,
        hashes_path: &Path,
        queue: &DownloadQueue,
    ) -> Result<bool> {
        list_file
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| BackupError::Disk(format!("seeking staged file list: {e}")))?;
        let mut parser = FileListParser::new();
        let mut segments: Vec<String> = Vec::new();
        let mut buf = [0u8; 4096];
        let mut line: u64 = 0;
        loop {
            let read = list_file
                .read(&mut buf)
                .await
                .map_err(|e| BackupError::Disk(format!("reading staged file list: {e}")))?;
            if read == 0 {
                break;
            }
            for &b in &buf[..read] {
                let Some(entry) = parser.next_entry(b)? else {
                    continue;
                };
                if entry.is_dir {
                    if entry.name == ".." {
                        if segments.pop().is_none() {
                            return Ok(false);
                        }
                    } else {
                        segments.push(fix_for_os(&entry.name));
                    }
                } else if !entry.extras.contains_key("sym_target") {
                    if let Some(declared) = entry.extras.get("sha512") {
                        let fully_ok = queue.is_download_ok(line)
                            && !queue.is_download_partial(line);
                        if fully_ok {
                            let mut file: PathBuf = hashes_path.to_path_buf();
                            for seg in &segments {
                                file.push(seg);
                            }
                            file.push(fix_for_os(&entry.name));
                            let sidecar = hash_sidecar_path(&file);
                            let stored = match tokio::fs::read_to_string(&sidecar).await {
                                Ok(s) => s,
                                Err(e) => {
                                    error!(
                                        "Verification of \"{}\" failed: missing hash: {e}",
                                        entry.name
                                    );
                                    return Ok(false);
                                }
                            };
                            let declared = decode_hash_dash(declared).unwrap_or_default();
                            let stored = hex::decode(stored.trim()).unwrap_or_default();
                            if declared != stored {
                                error!(
                                    "Verification of \"{}\" failed: hash mismatch",
                                    entry.name
                                );
                                return Ok(false);
                            }
                        }
                    }
                }
                line += 1;
            }
        }
        Ok(true)
    }
}

fn extra_i64(extras: &crate::list::Extras, key: &str) -> i64 {
    extras
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

/// Any value guaranteed different from the original modification time, so a
/// later incremental treats the partially transferred file as changed
fn poison_timestamp(last_modified: i64) -> i64 {
    let mut rng = rand::rng();
    let factor: i64 = rng.random::<i64>() | 1;
    let poisoned = last_modified.wrapping_mul(factor);
    if poisoned != last_modified {
        return poisoned;
    }
    poisoned.wrapping_add(i64::from(rng.random::<u32>()) | 1)
}

/// Create a symlink whose target uses the agent's native separator
async fn create_agent_symlink(
    link_path: &Path,
    target: &str,
    orig_sep: &str,
) -> std::io::Result<()> {
    let converted = if orig_sep == "/" || orig_sep.is_empty() {
        target.to_string()
    } else {
        target.replace(orig_sep, "/")
    };
    match tokio::fs::symlink(&converted, link_path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            tokio::fs::remove_file(link_path).await?;
            tokio::fs::symlink(&converted, link_path).await
        }
        Err(e) => Err(e),
    }
}

/// Run the post-backup hook script, if the installation has one
async fn run_post_hook(backup_path: &Path) {
    if !matches!(tokio::fs::try_exists(POST_HOOK_SCRIPT).await, Ok(true)) {
        return;
    }
    match tokio::process::Command::new(POST_HOOK_SCRIPT)
        .arg(backup_path)
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("post-backup hook exited with {status}"),
        Err(e) => warn!("running post-backup hook: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poisoned_timestamp_differs() {
        for original in [0i64, 1, -1, 1_700_000_000, i64::MAX, i64::MIN] {
            for _ in 0..32 {
                assert_ne!(poison_timestamp(original), original, "original {original}");
            }
        }
    }

    #[tokio::test]
    async fn agent_symlink_converts_separators() {
        let dir = tempfile::tempdir().expect("tempdir");
        let link = dir.path().join("link");
        create_agent_symlink(&link, "..\\target", "\\")
            .await
            .expect("symlink");
        assert_eq!(
            std::fs::read_link(&link).expect("read link"),
            PathBuf::from("../target")
        );
    }

    #[tokio::test]
    async fn agent_symlink_replaces_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let link = dir.path().join("link");
        create_agent_symlink(&link, "one", "/").await.expect("first");
        create_agent_symlink(&link, "two", "/").await.expect("second");
        assert_eq!(
            std::fs::read_link(&link).expect("read link"),
            PathBuf::from("two")
        );
    }
}
