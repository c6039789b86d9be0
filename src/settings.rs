//! Server settings controlling transfer modes, verification and publication
//!
//! Settings load from a TOML file with per-field defaults; the CLI can
//! override individual fields. Transfer mode enums double as `clap`
//! value enums so the same names work on the command line and in the file.

use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Backup group number for the "default" schedule
pub const GROUP_DEFAULT: i32 = 0;
/// Backup group number for the "continuous" schedule
pub const GROUP_CONTINUOUS: i32 = 1;

/// How file content travels from agent to server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Plain byte stream
    Raw,
    /// Transfer with integrity hashes per block
    Hashed,
    /// Block-hash transfer; interrupted files stay resumable
    Blockhash,
}

/// Server-wide backup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Root directory holding all client backup trees
    pub backupfolder: PathBuf,

    /// Full-backup transfer mode for internet clients
    pub internet_full_file_transfer_mode: TransferMode,
    /// Incremental transfer mode for internet clients (controls resumability)
    pub internet_incr_file_transfer_mode: TransferMode,
    /// Full-backup transfer mode for LAN clients
    pub local_full_file_transfer_mode: TransferMode,
    /// Incremental transfer mode for LAN clients
    pub local_incr_file_transfer_mode: TransferMode,

    /// Re-read stored files after the backup and cross-check declared hashes
    pub end_to_end_file_backup_verification: bool,
    /// Trust client-computed hashes for verification
    pub verify_using_client_hashes: bool,
    /// Whether internet clients compute file hashes themselves
    pub internet_calculate_filehashes_on_client: bool,

    /// Build per-user symlink views on publish
    pub create_linked_user_views: bool,

    /// Stage downloads in a separate temporary directory
    pub use_tmpfiles: bool,
    /// Directory for temporary files when `use_tmpfiles` is set
    pub tmpfile_path: Option<PathBuf>,
    /// Use block-sharing reflinks instead of hard links where supported
    pub use_reflink: bool,

    /// Cadence of percent/queue status updates, doubling as the
    /// cancellation poll interval (milliseconds)
    pub status_update_interval_ms: u64,
    /// Cadence of ETA re-estimation (milliseconds)
    pub eta_update_interval_ms: u64,
    /// Cadence of the backup-row running heartbeat (milliseconds)
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            backupfolder: PathBuf::from("/var/backups/backhaul"),
            internet_full_file_transfer_mode: TransferMode::Hashed,
            internet_incr_file_transfer_mode: TransferMode::Hashed,
            local_full_file_transfer_mode: TransferMode::Hashed,
            local_incr_file_transfer_mode: TransferMode::Hashed,
            end_to_end_file_backup_verification: false,
            verify_using_client_hashes: false,
            internet_calculate_filehashes_on_client: false,
            create_linked_user_views: false,
            use_tmpfiles: false,
            tmpfile_path: None,
            use_reflink: false,
            status_update_interval_ms: 500,
            eta_update_interval_ms: 20_000,
            heartbeat_interval_ms: 60_000,
        }
    }
}

impl ServerSettings {
    /// Load settings from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `BackupError::Config` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        toml::from_str(&raw).map_err(|e| {
            BackupError::Config(format!("cannot parse settings file {}: {e}", path.display()))
        })
    }

    /// Transfer uses per-block integrity hashes for this connection type
    #[must_use]
    pub fn hashed_transfer(&self, internet: bool) -> bool {
        let mode = if internet {
            self.internet_full_file_transfer_mode
        } else {
            self.local_full_file_transfer_mode
        };
        mode != TransferMode::Raw
    }

    /// Partially transferred files are kept as resumable
    #[must_use]
    pub fn save_incomplete_files(&self, internet: bool) -> bool {
        let mode = if internet {
            self.internet_incr_file_transfer_mode
        } else {
            self.local_incr_file_transfer_mode
        };
        mode == TransferMode::Blockhash
    }

    /// Directory used for staging temporary files
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        if self.use_tmpfiles {
            if let Some(tmp) = &self.tmpfile_path {
                return tmp.clone();
            }
        }
        self.backupfolder.join("tmp")
    }
}
