use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatConfig;
use crate::job::log_line;
use crate::store::JobStore;

/// Tracks log growth and decides when a synthetic progress line is due.
#[derive(Debug)]
pub struct SilenceTracker {
    threshold: Duration,
    last_size: Option<u64>,
    last_activity: Instant,
}

impl SilenceTracker {
    pub fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            last_size: None,
            last_activity: now,
        }
    }

    /// Record the current log size. Returns true when the log has not grown
    /// for at least the threshold; at most once per silent window.
    pub fn observe(&mut self, size: u64, now: Instant) -> bool {
        if self.last_size != Some(size) {
            self.last_size = Some(size);
            self.last_activity = now;
            return false;
        }
        if now.saturating_duration_since(self.last_activity) >= self.threshold {
            self.last_activity = now;
            return true;
        }
        false
    }
}

/// Keeps a running job's metadata fresh and its log alive.
///
/// Each tick touches `updated_at` (only while the job is not terminal) and
/// writes `Running... elapsed=Ns` when the log has been silent too long.
/// Failures are logged and never end the loop.
pub struct HeartbeatMonitor {
    store: JobStore,
    job_id: String,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(store: JobStore, job_id: impl Into<String>, config: HeartbeatConfig) -> Self {
        Self {
            store,
            job_id: job_id.into(),
            config,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let started = Instant::now();
        let mut silence = SilenceTracker::new(self.config.silence_threshold, started);
        let mut interval = tokio::time::interval(self.config.interval);
        // First tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.tick(&mut silence, started),
            }
        }
        tracing::debug!(job_id = %self.job_id, "Heartbeat stopped");
    }

    fn tick(&self, silence: &mut SilenceTracker, started: Instant) {
        let touched = self.store.update(&self.job_id, |job| {
            if !job.is_terminal() {
                job.touch();
            }
            Ok(())
        });
        let job = match touched {
            Ok(job) => job,
            Err(e) => {
                tracing::debug!(job_id = %self.job_id, error = %e, "Heartbeat touch failed");
                return;
            }
        };
        if job.is_terminal() {
            return;
        }

        let size = match self.store.log_size(&self.job_id) {
            Ok(size) => size.unwrap_or(0),
            Err(e) => {
                tracing::debug!(job_id = %self.job_id, error = %e, "Heartbeat could not stat log");
                return;
            }
        };
        if silence.observe(size, Instant::now()) {
            let elapsed = started.elapsed().as_secs();
            let line = log_line(format!("Running... elapsed={elapsed}s"));
            if let Err(e) = self.store.append_log(&self.job_id, &line) {
                tracing::debug!(job_id = %self.job_id, error = %e, "Heartbeat log write failed");
            }
        }
    }
}
