//! Backup drivers
//!
//! The orchestrator composes the list parser, path stack, download queue,
//! hash pipe and link store into one full-backup lifecycle. The strategy
//! seam exists so an incremental driver can reuse the same machinery; only
//! the full strategy ships.

pub mod full;
pub mod publish;
pub mod strategy;

pub use full::{FullFileBackup, RunReport};
pub use strategy::{BackupMode, BackupStrategy, FullBackupStrategy, WriteItemCtx};

/// Reserved top-level directory whose contents are backed up without
/// volume snapshots
pub const SCRIPT_DIR_NAME: &str = "urbackup_backup_scripts";

/// Hook script invoked with the backup path after a run
pub const POST_HOOK_SCRIPT: &str = "urbackup/post_full_filebackup";

/// Server-side file list name for a backup group
#[must_use]
pub fn clientlist_name(group: i32) -> String {
    format!("clientlist_{group}.ub")
}

/// Pre-commit name of the server-side file list
#[must_use]
pub fn clientlist_new_name(group: i32) -> String {
    format!("clientlist_{group}.ub.new")
}

/// Human-readable byte count for log lines
#[must_use]
pub fn pretty_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
