//! Per-process status registry
//!
//! Tracks percent-done, hash queue depths, ETA and the operator stop flag for
//! every running backup process, keyed by `(client name, status id)`. Readers
//! and writers live on different tasks; the registry is a [`DashMap`] so no
//! lock is held across awaits.

use dashmap::DashMap;

/// Snapshot of one backup process as shown to operators
#[derive(Debug, Clone, Default)]
pub struct ProcessStatus {
    /// Percent done in `[0, 100]`
    pub pc_done: u8,
    /// Entries waiting in the hash-finalize queue
    pub queue_hash: u32,
    /// Entries waiting in the hash-prepare queue
    pub queue_prepare: u32,
    /// Estimated remaining milliseconds
    pub eta_ms: i64,
    /// Unix milliseconds at which `eta_ms` was computed
    pub eta_set_time: i64,
    /// Operator requested this process to stop
    pub stop: bool,
}

/// Registry of running backup processes
#[derive(Debug, Default)]
pub struct ServerStatus {
    processes: DashMap<(String, u64), ProcessStatus>,
}

impl ServerStatus {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update percent done, clamped to `[0, 100]` and monotone within a run
    pub fn set_process_pc_done(&self, client: &str, status_id: u64, pc: u8) {
        let mut entry = self
            .processes
            .entry((client.to_string(), status_id))
            .or_default();
        entry.pc_done = entry.pc_done.max(pc.min(100));
    }

    /// Update the hash pipe queue depths
    pub fn set_process_queuesize(&self, client: &str, status_id: u64, hash: u32, prepare: u32) {
        let mut entry = self
            .processes
            .entry((client.to_string(), status_id))
            .or_default();
        entry.queue_hash = hash;
        entry.queue_prepare = prepare;
    }

    /// Publish a new ETA estimate
    pub fn set_process_eta(&self, client: &str, status_id: u64, eta_ms: i64, set_time: i64) {
        let mut entry = self
            .processes
            .entry((client.to_string(), status_id))
            .or_default();
        entry.eta_ms = eta_ms;
        entry.eta_set_time = set_time;
    }

    /// Read the current status (default when the process is unknown)
    #[must_use]
    pub fn get_process(&self, client: &str, status_id: u64) -> ProcessStatus {
        self.processes
            .get(&(client.to_string(), status_id))
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Set the operator stop flag for a process
    pub fn request_stop(&self, client: &str, status_id: u64) {
        let mut entry = self
            .processes
            .entry((client.to_string(), status_id))
            .or_default();
        entry.stop = true;
    }

    /// Drop a finished process from the registry
    pub fn remove_process(&self, client: &str, status_id: u64) {
        self.processes.remove(&(client.to_string(), status_id));
    }
}
