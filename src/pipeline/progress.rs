//! Debounced progress and ETA publication
//!
//! Two independent cadences: the status update (percent done plus hash queue
//! depths) and the ETA re-estimate. The ETA uses an exponentially smoothed
//! transfer speed measured between updates; linked bytes count as if they
//! had been transferred so dedup-heavy backups do not look stalled.

use crate::status::ServerStatus;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Percent done in `[0, 100]`, rounded to nearest; an empty backup is done
#[must_use]
pub fn percent_done(done_bytes: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 100;
    }
    let pc = (done_bytes.saturating_mul(100) + total_bytes / 2) / total_bytes;
    pc.min(100) as u8
}

/// Debounced progress publisher for one backup process
pub struct Progress {
    status: Arc<ServerStatus>,
    client: String,
    status_id: u64,
    status_interval: Duration,
    eta_interval: Duration,
    last_status: Option<Instant>,
    last_eta: Option<Instant>,
    last_eta_done_bytes: u64,
    smoothed_speed: f64, // bytes per millisecond
}

impl Progress {
    /// Create a publisher with the configured cadences
    pub fn new(
        status: Arc<ServerStatus>,
        client: impl Into<String>,
        status_id: u64,
        status_interval: Duration,
        eta_interval: Duration,
    ) -> Self {
        Self {
            status,
            client: client.into(),
            status_id,
            status_interval,
            eta_interval,
            last_status: None,
            last_eta: None,
            last_eta_done_bytes: 0,
            smoothed_speed: 0.0,
        }
    }

    /// Whether the status cadence has elapsed (first call always fires)
    #[must_use]
    pub fn status_due(&self) -> bool {
        self.last_status
            .is_none_or(|t| t.elapsed() >= self.status_interval)
    }

    /// Publish percent done and queue depths now
    pub fn publish_status(&mut self, done_bytes: u64, total_bytes: u64, queues: (usize, usize)) {
        self.last_status = Some(Instant::now());
        self.status.set_process_pc_done(
            &self.client,
            self.status_id,
            percent_done(done_bytes, total_bytes),
        );
        let (prepare, hash) = queues;
        self.status.set_process_queuesize(
            &self.client,
            self.status_id,
            hash as u32,
            prepare as u32,
        );
    }

    /// Re-estimate and publish the ETA when its cadence has elapsed
    pub fn maybe_eta(&mut self, done_bytes: u64, total_bytes: u64) {
        let now = Instant::now();
        let Some(last) = self.last_eta else {
            self.last_eta = Some(now);
            self.last_eta_done_bytes = done_bytes;
            return;
        };
        let elapsed = now.duration_since(last);
        if elapsed < self.eta_interval {
            return;
        }
        let elapsed_ms = elapsed.as_millis().max(1) as f64;
        let speed = done_bytes.saturating_sub(self.last_eta_done_bytes) as f64 / elapsed_ms;
        self.smoothed_speed = if self.smoothed_speed > 0.0 {
            self.smoothed_speed * 0.9 + speed * 0.1
        } else {
            speed
        };
        self.last_eta = Some(now);
        self.last_eta_done_bytes = done_bytes;

        if self.smoothed_speed > 0.0 {
            let remaining = total_bytes.saturating_sub(done_bytes) as f64;
            let eta_ms = (remaining / self.smoothed_speed) as i64;
            self.status
                .set_process_eta(&self.client, self.status_id, eta_ms, unix_ms());
        }
    }

    /// Publish an absolute ETA (used to seed the estimate from history)
    pub fn seed_eta(&self, eta_ms: i64) {
        self.status
            .set_process_eta(&self.client, self.status_id, eta_ms, unix_ms());
    }
}
