use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::{log_line, JobState};
use crate::store::JobStore;
use crate::worker::{Engine, EngineInvocation, HeartbeatMonitor, JobLog};

const HEARTBEAT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Drive one job from `queued` to a terminal state.
///
/// Returns the state recorded in the store afterwards. If something else (a
/// stop request) already finished the job, the engine is not run, or its
/// outcome is discarded, and the recorded state is returned unchanged.
pub async fn run_job<E: Engine>(
    store: &JobStore,
    job_id: &str,
    engine: &E,
    heartbeat: HeartbeatConfig,
) -> Result<JobState> {
    let log = JobLog::new(store.clone(), job_id);

    let job = match store.update(job_id, |job| job.transition(JobState::Running)) {
        Ok(job) => job,
        Err(OrchestratorError::InvalidTransition { from, .. }) => {
            tracing::info!(job_id, state = %from, "Job no longer queued, not starting engine");
            return Ok(from);
        }
        Err(e) => return Err(e),
    };
    log.append(&log_line(format!("Starting job {job_id}")));

    let cancel = CancellationToken::new();
    let monitor = HeartbeatMonitor::new(store.clone(), job_id, heartbeat);
    let heartbeat_task = tokio::spawn(monitor.run(cancel.clone()));
    let stop_heartbeat = cancel.drop_guard();

    let invocation = EngineInvocation::from(&job);
    let outcome = engine.run(&invocation, &log).await;

    drop(stop_heartbeat);
    if tokio::time::timeout(HEARTBEAT_JOIN_TIMEOUT, heartbeat_task)
        .await
        .is_err()
    {
        tracing::warn!(job_id, "Heartbeat did not stop in time");
    }

    let (state, exit_code, error) = match &outcome {
        Ok(0) => (JobState::Succeeded, 0, None),
        Ok(code) => (JobState::Failed, *code, None),
        Err(e) => {
            tracing::error!(job_id, error = %e, "Engine failed");
            log.append(&log_line(format!("ERROR: {e}")));
            (JobState::Failed, 1, Some(e.to_string()))
        }
    };

    match store.update(job_id, |job| job.finish(state, exit_code, error)) {
        Ok(_) => {
            if outcome.is_ok() {
                log.append(&log_line(format!("Finished with exit_code={exit_code}")));
            }
            tracing::info!(job_id, state = %state, exit_code, "Job finished");
            Ok(state)
        }
        Err(OrchestratorError::InvalidTransition { from, .. }) => {
            tracing::info!(job_id, state = %from, "Job was finished elsewhere, keeping its state");
            Ok(from)
        }
        Err(e) => Err(e),
    }
}
