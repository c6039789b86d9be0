//! Server-side full file backup orchestrator
//!
//! `backhaul` coordinates one full backup for one client and group: it pulls
//! the agent's file list, drives parallel file retrieval with backpressure,
//! deduplicates against earlier backups via hash-based hard links, persists
//! metadata beside a parallel hash tree, verifies integrity and publishes
//! the result as the client's new current snapshot.
//!
//! The collaborators at the edges - the backup index ([`dao::BackupDao`]),
//! the transfer client ([`client::FileClient`]) and the operator status
//! registry ([`status::ServerStatus`]) - are traits, so the orchestrator is
//! testable without a wire protocol. [`client::dir::DirAgent`] implements the
//! agent contract over a local directory for tests and demos.

pub mod backup;
pub mod cli;
pub mod client;
pub mod context;
pub mod dao;
pub mod error;
pub mod list;
pub mod pipeline;
pub mod settings;
pub mod status;
pub mod store;

pub use backup::{FullBackupStrategy, FullFileBackup, RunReport};
pub use context::ServerContext;
pub use error::{BackupError, Outcome, Result};
pub use settings::ServerSettings;
pub use status::ServerStatus;
