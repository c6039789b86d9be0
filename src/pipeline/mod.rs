//! Concurrent backup pipeline
//!
//! The orchestrator enumerates the file list and feeds work into bounded
//! queues; the download worker pulls bytes from the agent, hands staged
//! files to the two-stage hash pipe, and a separate stream fetches the
//! agent's metadata sidecar. Producers block when a queue is full, which is
//! the only backpressure mechanism in the system.

pub mod download;
pub mod hash_pipe;
pub mod metadata_fetch;
pub mod progress;
pub mod running;

pub use download::{
    DownloadQueue, DownloadQueueConfig, TransferOutcome, TransferResult, WorkItem, UNKNOWN_SIZE,
};
pub use hash_pipe::{HashPipe, PrepareJob, PrepareSender};
pub use metadata_fetch::MetadataDownloader;
pub use progress::Progress;
pub use running::RunningUpdater;
