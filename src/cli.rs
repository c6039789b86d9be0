//! Command-line interface definitions
//!
//! Arguments are grouped by the component that consumes them: paths for the
//! agent directory and server folders, backup identity, transfer overrides,
//! and output control.

use crate::settings::{ServerSettings, TransferMode};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Server-side full file backup orchestrator
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Source and destination paths
    #[command(flatten)]
    pub paths: PathsConfig,

    /// Backup identity (client, group)
    #[command(flatten)]
    pub backup: BackupConfig,

    /// Transfer-mode overrides
    #[command(flatten)]
    pub transfer: TransferConfig,

    /// Output and logging configuration
    #[command(flatten)]
    pub output: OutputConfig,
}

/// Paths configuration
///
/// Used by: `main()`, `DirAgent`, `SqliteBackupDao`
#[derive(clap::Args, Debug, Clone)]
pub struct PathsConfig {
    /// Directory served as the agent's filesystem
    #[arg(value_name = "AGENT_DIR")]
    pub agent_dir: PathBuf,

    /// Root directory for all client backup trees (overrides settings file)
    #[arg(long)]
    pub backupfolder: Option<PathBuf>,

    /// Settings file (TOML)
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,
}

/// Backup identity configuration
///
/// Used by: `FullFileBackup::new()`
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "Backup Identity")]
pub struct BackupConfig {
    /// Client name the backup is filed under
    #[arg(long, default_value = "localclient")]
    pub client_name: String,

    /// Client id in the backup index
    #[arg(long, default_value = "1")]
    pub client_id: i64,

    /// Backup group (0 = default schedule)
    #[arg(long, default_value = "0")]
    pub group: i32,

    /// Status id shown to operators
    #[arg(long, default_value = "1")]
    pub status_id: u64,

    /// Identity this server presents to agents
    #[arg(long, default_value = "backhaul-server")]
    pub server_identity: String,

    /// Token agents require for metadata access
    #[arg(long, default_value = "")]
    pub server_token: String,
}

/// Transfer overrides
///
/// Used by: `ServerSettings`
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "Transfer Options")]
pub struct TransferConfig {
    /// Override the full-backup transfer mode for LAN clients
    #[arg(long, value_enum)]
    pub local_transfer_mode: Option<TransferMode>,

    /// Use block-sharing reflinks instead of hard links for dedup
    #[arg(long)]
    pub use_reflink: bool,

    /// Re-read stored files after the backup and cross-check hashes
    #[arg(long)]
    pub verify: bool,
}

/// Output and logging configuration
///
/// Used by: `main()`
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "Output Options")]
pub struct OutputConfig {
    /// Increase log verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// Resolve settings: file (if any), then CLI overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be read or parsed.
    pub fn resolve_settings(&self) -> Result<ServerSettings> {
        let mut settings = match &self.paths.settings {
            Some(path) => ServerSettings::from_file(path)?,
            None => ServerSettings::default(),
        };
        if let Some(folder) = &self.paths.backupfolder {
            settings.backupfolder = folder.clone();
        }
        if let Some(mode) = self.transfer.local_transfer_mode {
            settings.local_full_file_transfer_mode = mode;
        }
        if self.transfer.use_reflink {
            settings.use_reflink = true;
        }
        if self.transfer.verify {
            settings.end_to_end_file_backup_verification = true;
        }
        Ok(settings)
    }

    /// Tracing filter directive for the chosen verbosity
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        if self.output.quiet {
            "error"
        } else {
            match self.output.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let args = Args::parse_from([
            "backhaul",
            "/srv/agent",
            "--backupfolder",
            "/srv/backups",
            "--local-transfer-mode",
            "raw",
            "--verify",
        ]);
        let settings = args.resolve_settings().expect("settings");
        assert_eq!(settings.backupfolder, PathBuf::from("/srv/backups"));
        assert_eq!(settings.local_full_file_transfer_mode, TransferMode::Raw);
        assert!(settings.end_to_end_file_backup_verification);
        assert!(!settings.use_reflink);
    }

    #[test]
    fn verbosity_maps_to_filter() {
        let args = Args::parse_from(["backhaul", "/srv/agent", "-v"]);
        assert_eq!(args.log_filter(), "debug");
        let args = Args::parse_from(["backhaul", "/srv/agent", "--quiet"]);
        assert_eq!(args.log_filter(), "error");
    }
}
