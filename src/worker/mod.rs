//! Per-job execution.
//!
//! Every submitted job runs in its own OS process (`pf-orchestrator run-job`),
//! so an engine crash or hang never takes down the caller:
//! - [`process`]: spawning that process and signalling it on stop
//! - [`launcher`]: what the process does, from `queued` to a terminal state
//! - [`engine`]: the [`Engine`] seam and the external-command implementation
//! - [`heartbeat`]: liveness updates and silence lines while the engine runs

pub mod engine;
pub mod heartbeat;
pub mod launcher;
pub mod process;

pub use engine::{CommandEngine, Engine, EngineInvocation};
pub use heartbeat::{HeartbeatMonitor, SilenceTracker};
pub use launcher::run_job;
pub use process::{terminate, WorkerArgs, WorkerSpawner};

use crate::error::Result;
use crate::job::JobState;
use crate::store::JobStore;

/// Append-only handle on one job's log.
///
/// Write failures are reported through `tracing` and otherwise ignored: losing
/// a log line must never fail the job.
#[derive(Debug, Clone)]
pub struct JobLog {
    store: JobStore,
    job_id: String,
}

impl JobLog {
    pub fn new(store: JobStore, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn append(&self, text: &str) {
        if let Err(e) = self.store.append_log(&self.job_id, text) {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to append to job log");
        }
    }

    pub fn read_all(&self) -> Result<String> {
        let raw = std::fs::read(self.store.log_path(&self.job_id)?)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

/// Entry point of the per-job process.
pub async fn run_worker(args: &WorkerArgs) -> Result<JobState> {
    let store = JobStore::open(&args.store_root)?;
    let engine = CommandEngine::new(args.engine_config());
    run_job(&store, &args.job_id, &engine, args.heartbeat_config()).await
}
