//! Error types and terminal outcomes for backup runs
//!
//! Per-file failures are recorded against the individual work item and never
//! surface here; `BackupError` is for pipeline-wide conditions. A finished run
//! is summarised by an [`Outcome`], which is the single source of truth for
//! whether publication may happen.

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, BackupError>;

/// Pipeline-wide error conditions
#[derive(Debug, Error)]
pub enum BackupError {
    /// The agent's file list could not be decoded
    #[error("file list corrupt: {0}")]
    ListCorrupt(String),

    /// A local write, rename or hash-pipe failure
    #[error("disk error: {0}")]
    Disk(String),

    /// Backup index database failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File transfer failure reported by the file client
    #[error("transfer failed: {0}")]
    Transfer(#[from] crate::client::TransferError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Terminal outcome of one full backup run
///
/// Publication (symlink swap and index commit) happens only for `Success`.
/// The success boolean reported to callers is `outcome.is_success()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Backup completed, verified (if enabled) and published
    Success,
    /// Operator stop observed; graceful drain, no publish
    UserCancelled,
    /// Transport gave up; graceful drain, no publish
    Offline,
    /// The file list could not be parsed
    ListCorrupt,
    /// The run ended before meaningful progress was made
    EarlyAbort {
        /// Whether the failed run should still be logged as a backup attempt
        log_backup: bool,
    },
    /// A local write, rename or hash-pipe error; backup row left undone
    DiskError,
    /// Stored hashes disagree with the hashes the agent declared
    VerificationFailed,
}

impl Outcome {
    /// Whether the run may be published
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::UserCancelled => write!(f, "cancelled by operator"),
            Self::Offline => write!(f, "client went offline"),
            Self::ListCorrupt => write!(f, "file list corrupt"),
            Self::EarlyAbort { .. } => write!(f, "aborted before transfer"),
            Self::DiskError => write!(f, "disk error"),
            Self::VerificationFailed => write!(f, "verification failed"),
        }
    }
}
