//! Shared fixtures for the orchestrator scenario tests

use async_trait::async_trait;
use backhaul::client::{
    AgentConnection, FileClient, ListRequestError, ProtocolVersions, TransferError,
};
use backhaul::dao::{BackupDao, FullDuration};
use backhaul::error::Result;
use backhaul::list::{FileListParser, ListEntry};
use backhaul::settings::ServerSettings;
use backhaul::store::encode_hash_dash;
use sha2::{Digest, Sha512};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Settings
// ============================================================================

/// Settings pointing at a per-test backup folder, with the cancellation poll
/// firing on every entry so scenario timing is deterministic
#[allow(dead_code)]
pub fn test_settings(root: &Path) -> ServerSettings {
    ServerSettings {
        backupfolder: root.join("backups"),
        status_update_interval_ms: 0,
        eta_update_interval_ms: 50,
        heartbeat_interval_ms: 1000,
        ..Default::default()
    }
}

// ============================================================================
// List building
// ============================================================================

#[allow(dead_code)]
pub fn dir_line(name: &str) -> String {
    format!("d\"{name}\" 0 100\n")
}

#[allow(dead_code)]
pub fn leave_line() -> String {
    "d\"..\" 0 0\n".to_string()
}

#[allow(dead_code)]
pub fn file_line(name: &str, size: i64, mtime: i64, extras: &[(&str, &str)]) -> String {
    let mut line = format!("f\"{name}\" {size} {mtime}");
    let mut first = true;
    for (k, v) in extras {
        line.push(if first { '#' } else { '&' });
        first = false;
        line.push_str(k);
        line.push('=');
        line.push_str(v);
    }
    line.push('\n');
    line
}

/// File line declaring the real hash of `content`
#[allow(dead_code)]
pub fn hashed_file_line(name: &str, content: &[u8], mtime: i64) -> String {
    let digest = Sha512::digest(content);
    let encoded = encode_hash_dash(&digest);
    file_line(
        name,
        content.len() as i64,
        mtime,
        &[("sha512", encoded.as_str())],
    )
}

#[allow(dead_code)]
pub fn parse_list(bytes: &[u8]) -> Vec<ListEntry> {
    let mut parser = FileListParser::new();
    let mut out = Vec::new();
    for &b in bytes {
        if let Some(e) = parser.next_entry(b).expect("list parses") {
            out.push(e);
        }
    }
    out
}

/// Whether `candidate` is a subsequence of `input` (by entry equality,
/// ignoring the modification time files may have had perturbed)
#[allow(dead_code)]
pub fn is_subsequence(input: &[ListEntry], candidate: &[ListEntry]) -> bool {
    let mut it = input.iter();
    'outer: for c in candidate {
        for i in it.by_ref() {
            if i.name == c.name && i.is_dir == c.is_dir && i.size == c.size {
                continue 'outer;
            }
        }
        return false;
    }
    true
}

// ============================================================================
// In-memory DAO
// ============================================================================

#[allow(dead_code)]
pub struct BackupRow {
    pub id: i64,
    pub incremental: i32,
    pub client_id: i64,
    pub path: String,
    pub group: i32,
    pub done: bool,
    pub heartbeats: u32,
}

/// In-memory backup index with scripted dedup candidates
#[derive(Default)]
pub struct MemoryDao {
    pub rows: Mutex<Vec<BackupRow>>,
    pub candidates: Mutex<HashMap<Vec<u8>, Vec<PathBuf>>>,
    pub registered: Mutex<Vec<(Vec<u8>, i64, PathBuf)>>,
}

#[allow(dead_code)]
impl MemoryDao {
    pub fn with_candidate(hash: &[u8], path: PathBuf) -> Self {
        let dao = Self::default();
        dao.candidates
            .lock()
            .expect("lock")
            .insert(hash.to_vec(), vec![path]);
        dao
    }

    pub fn done(&self, backup_id: i64) -> bool {
        self.rows
            .lock()
            .expect("lock")
            .iter()
            .any(|r| r.id == backup_id && r.done)
    }
}

#[async_trait]
impl BackupDao for MemoryDao {
    async fn last_full_durations(&self, _client_id: i64) -> Result<Vec<FullDuration>> {
        Ok(Vec::new())
    }

    async fn new_file_backup(
        &self,
        incremental: i32,
        client_id: i64,
        path: &str,
        _tgroup: i32,
        _indexing_ms: i64,
        group: i32,
    ) -> Result<i64> {
        let mut rows = self.rows.lock().expect("lock");
        let id = rows.len() as i64 + 1;
        rows.push(BackupRow {
            id,
            incremental,
            client_id,
            path: path.to_string(),
            group,
            done: false,
            heartbeats: 0,
        });
        Ok(id)
    }

    async fn update_file_backup_running(&self, backup_id: i64) -> Result<()> {
        let mut rows = self.rows.lock().expect("lock");
        if let Some(row) = rows.iter_mut().find(|r| r.id == backup_id) {
            row.heartbeats += 1;
        }
        Ok(())
    }

    async fn set_file_backup_done(&self, backup_id: i64) -> Result<()> {
        let mut rows = self.rows.lock().expect("lock");
        if let Some(row) = rows.iter_mut().find(|r| r.id == backup_id) {
            row.done = true;
        }
        Ok(())
    }

    async fn link_candidates(&self, hash: &[u8], _size: i64) -> Result<Vec<PathBuf>> {
        Ok(self
            .candidates
            .lock()
            .expect("lock")
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn register_linked(&self, hash: &[u8], size: i64, path: &Path) -> Result<()> {
        self.registered
            .lock()
            .expect("lock")
            .push((hash.to_vec(), size, path.to_path_buf()));
        Ok(())
    }

    async fn commit_backup(
        &self,
        backup_id: i64,
        list_new: &Path,
        list_final: &Path,
    ) -> Result<()> {
        let _ = std::fs::rename(list_new, list_final);
        self.set_file_backup_done(backup_id).await
    }
}

// ============================================================================
// Scripted agent
// ============================================================================

/// Gate that can hold transfers open until the test releases them
#[allow(dead_code)]
pub struct TransferGate {
    pub release_tx: watch::Sender<bool>,
    pub blocked_rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<String>>,
}

#[allow(dead_code)]
impl TransferGate {
    pub async fn wait_for_blocked(&self) -> String {
        self.blocked_rx
            .lock()
            .expect("lock")
            .recv()
            .await
            .expect("a transfer blocks")
    }

    pub fn release(&self) {
        let _ = self.release_tx.send(true);
    }
}

struct GateInner {
    release_rx: watch::Receiver<bool>,
    blocked_tx: tokio::sync::mpsc::UnboundedSender<String>,
    /// Payload transfers pass freely until this many calls have happened
    free_calls: usize,
}

/// File client serving scripted content, with per-name failure injection
/// and an optional blocking gate
pub struct MockClient {
    files: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
    partial: HashSet<String>,
    gate: Option<GateInner>,
    payload_calls: AtomicUsize,
    per_name_calls: Mutex<HashMap<String, usize>>,
    received: AtomicU64,
    transferred: AtomicU64,
}

#[async_trait]
impl FileClient for MockClient {
    async fn get_file(
        &self,
        remote_name: &str,
        local_sink: &Path,
        _hashed_transfer: bool,
        _resume: bool,
    ) -> std::result::Result<(), TransferError> {
        let name = remote_name.split('|').next().unwrap_or(remote_name);
        *self
            .per_name_calls
            .lock()
            .expect("lock")
            .entry(name.to_string())
            .or_insert(0) += 1;

        let Some(content) = self.files.get(name) else {
            return Err(TransferError::FileNotFound);
        };

        let control = name.starts_with("urbackup/");
        if !control {
            let call = self.payload_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                if call > gate.free_calls {
                    let mut release = gate.release_rx.clone();
                    if !*release.borrow() {
                        let _ = gate.blocked_tx.send(name.to_string());
                        while !*release.borrow_and_update() {
                            if release.changed().await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            if self.failing.contains(name) {
                return Err(TransferError::SocketError);
            }
            if self.partial.contains(name) {
                let half = &content[..content.len() / 2];
                tokio::fs::write(local_sink, half)
                    .await
                    .map_err(|_| TransferError::Internal)?;
                self.received
                    .fetch_add(half.len() as u64, Ordering::Relaxed);
                return Err(TransferError::Timeout);
            }
        }

        tokio::fs::write(local_sink, content)
            .await
            .map_err(|_| TransferError::Internal)?;
        if !control {
            self.received
                .fetch_add(content.len() as u64, Ordering::Relaxed);
            self.transferred
                .fetch_add(content.len() as u64, Ordering::Relaxed);
        }
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

/// Scripted agent handing out one shared [`MockClient`]
pub struct MockAgent {
    pub client: Arc<MockClient>,
    protocol: ProtocolVersions,
    list_request_error: Option<ListRequestError>,
}

#[allow(dead_code)]
pub struct MockAgentBuilder {
    list: String,
    files: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
    partial: HashSet<String>,
    protocol: ProtocolVersions,
    gate_free_calls: Option<usize>,
    list_request_error: Option<ListRequestError>,
}

#[allow(dead_code)]
impl MockAgent {
    pub fn builder(list: impl Into<String>) -> MockAgentBuilder {
        MockAgentBuilder {
            list: list.into(),
            files: HashMap::new(),
            failing: HashSet::new(),
            partial: HashSet::new(),
            protocol: ProtocolVersions::default(),
            gate_free_calls: None,
            list_request_error: None,
        }
    }

    /// Payload transfers attempted against a given remote name
    pub fn calls_for(&self, name: &str) -> usize {
        self.client
            .per_name_calls
            .lock()
            .expect("lock")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[allow(dead_code)]
impl MockAgentBuilder {
    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.files.insert(name.to_string(), content.to_vec());
        self
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn partial(mut self, name: &str) -> Self {
        self.partial.insert(name.to_string());
        self
    }

    pub fn protocol(mut self, filesrv: u32) -> Self {
        self.protocol = ProtocolVersions {
            filesrv,
            ..ProtocolVersions::default()
        };
        self
    }

    pub fn gated_after(mut self, free_calls: usize) -> Self {
        self.gate_free_calls = Some(free_calls);
        self
    }

    pub fn list_request_error(mut self, e: ListRequestError) -> Self {
        self.list_request_error = Some(e);
        self
    }

    pub fn build(mut self) -> (Arc<MockAgent>, Option<TransferGate>) {
        self.files
            .insert("urbackup/filelist.ub".to_string(), self.list.into_bytes());
        let (gate_inner, gate) = match self.gate_free_calls {
            Some(free_calls) => {
                let (release_tx, release_rx) = watch::channel(false);
                let (blocked_tx, blocked_rx) = tokio::sync::mpsc::unbounded_channel();
                (
                    Some(GateInner {
                        release_rx,
                        blocked_tx,
                        free_calls,
                    }),
                    Some(TransferGate {
                        release_tx,
                        blocked_rx: Mutex::new(blocked_rx),
                    }),
                )
            }
            None => (None, None),
        };
        let client = Arc::new(MockClient {
            files: self.files,
            failing: self.failing,
            partial: self.partial,
            gate: gate_inner,
            payload_calls: AtomicUsize::new(0),
            per_name_calls: Mutex::new(HashMap::new()),
            received: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
        });
        (
            Arc::new(MockAgent {
                client,
                protocol: self.protocol,
                list_request_error: self.list_request_error,
            }),
            gate,
        )
    }
}

#[async_trait]
impl AgentConnection for MockAgent {
    async fn request_filelist_construct(
        &self,
        _full: bool,
        _group: i32,
    ) -> std::result::Result<(), ListRequestError> {
        match &self.list_request_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn connect_file_client(
        &self,
        _timeout: Duration,
    ) -> std::result::Result<Arc<dyn FileClient>, TransferError> {
        Ok(self.client.clone())
    }

    fn is_internet_connection(&self) -> bool {
        false
    }

    fn protocol_versions(&self) -> ProtocolVersions {
        self.protocol
    }

    async fn begin_shadow_copy(&self, _volume: &str) -> std::result::Result<(), TransferError> {
        Ok(())
    }

    async fn end_shadow_copy(&self, _volume: &str) -> std::result::Result<(), TransferError> {
        Ok(())
    }

    async fn send_backup_okay(&self, _ok: bool) -> std::result::Result<(), TransferError> {
        Ok(())
    }
}
