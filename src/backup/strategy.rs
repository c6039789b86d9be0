//! Backup strategy seam
//!
//! Instead of a driver class hierarchy, the orchestrator takes a small
//! capability set: the backup mode, the dedup candidate choice and the
//! policy deciding which lines the rewritten file list keeps.

use crate::list::ListEntry;
use std::path::PathBuf;

/// Kind of backup a strategy drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Transfer everything the agent lists
    Full,
    /// Transfer only changes against a prior backup
    Incremental,
}

/// Facts about one line during the new-list pass
#[derive(Debug, Clone, Copy)]
pub struct WriteItemCtx {
    /// The entry's ordinal
    pub line: u64,
    /// Number of entries the enumeration actually processed
    pub max_line: u64,
    /// Highest line confirmed ok by the queue or linked locally
    pub ok_line_cap: u64,
    /// The queue recorded this line's content as stored
    pub download_ok: bool,
}

/// Capabilities that differ between backup kinds
pub trait BackupStrategy: Send + Sync {
    /// The mode recorded on the backup row
    fn mode(&self) -> BackupMode;

    /// Order or filter dedup candidates before linking is attempted
    fn choose_candidates(&self, candidates: Vec<PathBuf>) -> Vec<PathBuf> {
        candidates
    }

    /// Whether the rewritten file list keeps this entry
    fn keep_item(&self, entry: &ListEntry, ctx: &WriteItemCtx) -> bool;
}

/// The full-backup strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct FullBackupStrategy;

impl BackupStrategy for FullBackupStrategy {
    fn mode(&self) -> BackupMode {
        BackupMode::Full
    }

    fn keep_item(&self, entry: &ListEntry, ctx: &WriteItemCtx) -> bool {
        if entry.is_dir {
            ctx.line < ctx.max_line
        } else {
            ctx.line <= ctx.ok_line_cap && ctx.download_ok
        }
    }
}
