//! File-transfer client contract
//!
//! The wire protocol to agents lives behind two traits. [`AgentConnection`]
//! is the control side: ask the agent to build its file list, open transfer
//! streams, start and stop volume shadow copies. [`FileClient`] is one
//! transfer stream pulling remote files into local sinks while counting
//! bytes. [`dir::DirFileClient`] implements both against a local directory,
//! in the same spirit as a pipe transport: full pipeline behavior without
//! network infrastructure.

pub mod dir;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Remote name of the agent's file list for a backup group
#[must_use]
pub fn filelist_remote_name(group: i32) -> String {
    if group > 0 {
        format!("urbackup/filelist_{group}.ub")
    } else {
        "urbackup/filelist.ub".to_string()
    }
}

/// Remote name of the agent's metadata sidecar stream
pub const METADATA_REMOTE_NAME: &str = "urbackup/metadata.ub";

/// Remote name of the agent's access token file
pub const TOKENS_REMOTE_NAME: &str = "urbackup/tokens";

/// Transfer failure codes reported by a file client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Could not open a connection to the agent
    #[error("CONNECT error")]
    ConnectFailed,
    /// The transfer stalled past the client's deadline
    #[error("timeout")]
    Timeout,
    /// The agent does not have the requested file
    #[error("file does not exist")]
    FileNotFound,
    /// The connection broke mid-transfer
    #[error("socket error")]
    SocketError,
    /// Block hashes did not match during hashed transfer
    #[error("hash mismatch")]
    HashMismatch,
    /// The transfer was abandoned on purpose
    #[error("aborted")]
    Aborted,
    /// Anything else
    #[error("internal error")]
    Internal,
}

impl TransferError {
    /// Whether retrying the same transfer can plausibly succeed
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectFailed | Self::Timeout | Self::SocketError)
    }
}

/// Protocol capabilities negotiated with an agent
#[derive(Debug, Clone, Copy)]
pub struct ProtocolVersions {
    /// File-server protocol version; `>= 3` allows pipelined downloads
    pub filesrv: u32,
    /// Metadata protocol version; `> 0` means the agent streams metadata
    pub file_meta: u32,
}

impl Default for ProtocolVersions {
    fn default() -> Self {
        Self {
            filesrv: 3,
            file_meta: 1,
        }
    }
}

/// Why the agent could not produce a file list
#[derive(Debug, Clone, Error)]
pub enum ListRequestError {
    /// The agent has no directories configured for this group
    #[error("no backup directories configured")]
    NoBackupDirs,
    /// The agent could not be reached
    #[error("connecting to agent failed")]
    ConnectFail,
    /// The agent reported some other failure
    #[error("file list construction failed: {0}")]
    Other(String),
}

/// One transfer stream to an agent
///
/// Byte counters are cumulative across the life of the stream and readable
/// from other tasks; `received_bytes` resets via [`FileClient::reset_received_bytes`]
/// so progress can be measured per phase.
#[async_trait]
pub trait FileClient: Send + Sync {
    /// Pull `remote_name` into the local file `local_sink`
    ///
    /// # Errors
    ///
    /// Returns the transfer failure code; bytes already written to
    /// `local_sink` are left in place for the caller to keep or discard.
    async fn get_file(
        &self,
        remote_name: &str,
        local_sink: &Path,
        hashed_transfer: bool,
        resume: bool,
    ) -> Result<(), TransferError>;

    /// Payload bytes received since the last reset
    fn received_bytes(&self) -> u64;

    /// Total payload bytes moved over this stream
    fn transferred_bytes(&self) -> u64;

    /// Bytes on the wire before decompression, `0` when not compressed
    fn real_transferred_bytes(&self) -> u64;

    /// Reset the per-phase received counter
    fn reset_received_bytes(&self);

    /// Human-readable description of a failure code
    fn error_string(&self, err: TransferError) -> String {
        err.to_string()
    }
}

/// Control connection to one agent
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Ask the agent to enumerate its filesystem and write the list file
    async fn request_filelist_construct(
        &self,
        full: bool,
        group: i32,
    ) -> Result<(), ListRequestError>;

    /// Open a transfer stream, observing the connect budget
    async fn connect_file_client(
        &self,
        timeout: Duration,
    ) -> Result<Arc<dyn FileClient>, TransferError>;

    /// Whether this agent is reached over the internet rather than the LAN
    fn is_internet_connection(&self) -> bool;

    /// Negotiated protocol capabilities
    fn protocol_versions(&self) -> ProtocolVersions;

    /// Per-session identity override, if the agent negotiated one
    fn session_identity(&self) -> Option<String> {
        None
    }

    /// Ask the agent to snapshot a volume before its files are pulled
    async fn begin_shadow_copy(&self, volume: &str) -> Result<(), TransferError>;

    /// Release a volume snapshot
    async fn end_shadow_copy(&self, volume: &str) -> Result<(), TransferError>;

    /// Tell the agent whether the backup completed okay
    async fn send_backup_okay(&self, ok: bool) -> Result<(), TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransferError::Timeout.is_retryable());
        assert!(TransferError::SocketError.is_retryable());
        assert!(!TransferError::FileNotFound.is_retryable());
        assert!(!TransferError::HashMismatch.is_retryable());
    }

    #[test]
    fn filelist_names_by_group() {
        assert_eq!(filelist_remote_name(0), "urbackup/filelist.ub");
        assert_eq!(filelist_remote_name(2), "urbackup/filelist_2.ub");
    }
}
