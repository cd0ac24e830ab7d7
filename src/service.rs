//! The orchestrator's query surface: submit, inspect, stop and delete jobs.
//!
//! [`JobService`] holds no in-memory job state. Every call reads or mutates
//! the [`JobStore`], so any number of services (an API server, a CLI
//! invocation) can work on the same store root concurrently.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::{log_line, Datatype, Job, JobState};
use crate::request::{overrides, JobRequest, ValidatedRequest};
use crate::results::{self, JobResults};
use crate::store::JobStore;
use crate::stream::{self, LogStream};
use crate::worker::{process, WorkerArgs, WorkerSpawner};

/// Number of jobs returned by [`JobService::list`] when no limit is given.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Folder, inside the job directory, holding the isolated copy of the input.
const WORK_DIR: &str = "work";

pub const STOPPED_BY_USER: &str = "stopped by user";
pub const NO_PID_TO_STOP: &str = "stop requested but no pid available";

/// Externally visible view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub datatype: Datatype,
    pub input_folder: PathBuf,
    pub working_folder: PathBuf,
    pub cpus: Option<u32>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            state: job.state,
            created_at: job.created_at,
            updated_at: job.updated_at,
            datatype: job.datatype,
            input_folder: job.input_folder.clone(),
            working_folder: job.working_folder.clone(),
            cpus: job.cpus(),
            exit_code: job.exit_code,
            error: job.error.clone(),
        }
    }
}

/// What a stop request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The job process was signalled and the job marked failed.
    Stopped,
    /// The job was already terminal; nothing changed.
    AlreadyFinished,
    /// No process was recorded; the job was marked failed without signalling.
    Failed,
}

impl StopOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StopOutcome::Stopped => "stopped",
            StopOutcome::AlreadyFinished => "already_finished",
            StopOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobService {
    store: JobStore,
    config: Arc<OrchestratorConfig>,
    spawner: WorkerSpawner,
}

impl JobService {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let store = JobStore::open(&config.store_root)?.with_retry(config.read_retry);
        let spawner = WorkerSpawner::new(config.worker.clone());
        Ok(Self {
            store,
            config: Arc::new(config),
            spawner,
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validate `request`, persist a queued job and start its process.
    ///
    /// Validation failures leave nothing behind. A job whose process cannot
    /// be started is still created, already failed, and its id returned.
    /// The filesystem work runs on the blocking pool.
    pub async fn submit(&self, request: &JobRequest) -> Result<String> {
        let request = request.clone();
        self.run_blocking(move |service| service.submit_blocking(&request))
            .await
    }

    fn submit_blocking(&self, request: &JobRequest) -> Result<String> {
        let validated = request.validate()?;
        let job_id = Job::new_id();
        let job_dir = self.store.create_job_dir(&job_id)?;

        let job = match self.stage(&job_id, &job_dir, request, validated) {
            Ok(job) => job,
            Err(e) => {
                if let Err(cleanup) = self.store.delete(&job_id) {
                    tracing::warn!(job_id = %job_id, error = %cleanup, "Failed to clean up after rejected submission");
                }
                return Err(e);
            }
        };
        tracing::info!(job_id = %job_id, argv = ?job.argv, "Job queued");

        self.launch(&job_id)?;
        Ok(job_id)
    }

    /// Prepare the working folder and persist the queued record.
    fn stage(
        &self,
        job_id: &str,
        job_dir: &Path,
        request: &JobRequest,
        validated: ValidatedRequest,
    ) -> Result<Job> {
        let working_folder = prepare_working_folder(job_dir, self.store.root(), request, &validated)?;
        let job = Job::queued(
            job_id.to_string(),
            request.datatype,
            validated.input_folder,
            working_folder,
            validated.argv,
        );
        self.store.write(&job)?;
        self.store.append_log(
            job_id,
            &log_line(format!("Queued job; working_folder={}", job.working_folder.display())),
        )?;
        Ok(job)
    }

    fn launch(&self, job_id: &str) -> Result<()> {
        let args = WorkerArgs::new(
            self.store.root(),
            job_id,
            &self.config.engine,
            self.config.heartbeat,
        );
        let log_path = self.store.log_path(job_id)?;

        match self.spawner.spawn(&args, &log_path) {
            Ok(pid) => {
                self.store.update(job_id, |job| {
                    job.pid = Some(pid);
                    job.touch();
                    Ok(())
                })?;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to start job process");
                let error = OrchestratorError::Spawn(e).to_string();
                self.store.append_log(job_id, &log_line(format!("ERROR: {error}")))?;
                self.store
                    .update(job_id, |job| job.finish(JobState::Failed, 1, Some(error)))?;
            }
        }
        Ok(())
    }

    pub fn status(&self, job_id: &str) -> Result<JobSummary> {
        Ok(JobSummary::from(&self.store.read(job_id)?))
    }

    /// Jobs, most recently updated first, at most `limit` of them.
    pub fn list(&self, limit: usize) -> Result<Vec<JobSummary>> {
        let mut jobs: Vec<Job> = self
            .store
            .list()?
            .into_iter()
            .filter_map(|id| match self.store.read(&id) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::debug!(job_id = %id, error = %e, "Skipping unreadable job");
                    None
                }
            })
            .collect();
        jobs.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs.truncate(limit);
        Ok(jobs.iter().map(JobSummary::from).collect())
    }

    pub fn results(&self, job_id: &str) -> Result<JobResults> {
        Ok(results::collect(&self.store.read(job_id)?))
    }

    /// Remove a job and everything it produced. Running jobs are refused.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        let removed = self.store.delete_with(job_id, |job| match job {
            Some(job) if job.state == JobState::Running => {
                Err(OrchestratorError::JobRunning(job_id.to_string()))
            }
            _ => Ok(()),
        })?;
        if !removed {
            return Err(OrchestratorError::JobNotFound(job_id.to_string()));
        }
        tracing::info!(job_id, "Job deleted");
        Ok(())
    }

    /// Best-effort stop. The terminal state is recorded before the signal is
    /// sent and process teardown is not awaited.
    pub fn stop(&self, job_id: &str) -> Result<StopOutcome> {
        if self.store.read(job_id)?.is_terminal() {
            return Ok(StopOutcome::AlreadyFinished);
        }

        let mut outcome = StopOutcome::AlreadyFinished;
        let mut target = None;
        self.store.update(job_id, |job| {
            if job.is_terminal() {
                return Ok(());
            }
            match job.pid {
                Some(pid) => {
                    job.finish(JobState::Failed, 1, Some(STOPPED_BY_USER.to_string()))?;
                    target = Some(pid);
                    outcome = StopOutcome::Stopped;
                }
                None => {
                    job.finish(JobState::Failed, 1, Some(NO_PID_TO_STOP.to_string()))?;
                    outcome = StopOutcome::Failed;
                }
            }
            Ok(())
        })?;

        if let Some(pid) = target {
            if let Err(e) = process::terminate(pid) {
                tracing::warn!(job_id, pid, error = %e, "Failed to signal job process");
            }
            self.store.append_log(job_id, &log_line("Stopped by user"))?;
        }
        tracing::info!(job_id, outcome = outcome.as_str(), "Stop requested");
        Ok(outcome)
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait(&self, job_id: &str, poll_interval: Duration) -> Result<JobSummary> {
        loop {
            let summary = self.status_async(job_id).await?;
            if summary.state.is_terminal() {
                return Ok(summary);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Submit, wait for completion and collect the results.
    pub async fn submit_and_wait(
        &self,
        request: &JobRequest,
        poll_interval: Duration,
    ) -> Result<JobResults> {
        let job_id = self.submit(request).await?;
        self.wait(&job_id, poll_interval).await?;
        self.results_async(&job_id).await
    }

    /// Follow the job's log. Fails immediately for unknown jobs.
    pub fn subscribe_log(&self, job_id: &str) -> Result<LogStream> {
        stream::subscribe(self.store.clone(), job_id, self.config.stream)
    }

    // -------------------------------------------------------------------------
    // Async versions
    //
    // Store calls poll a file lock and sleep between read retries, so async
    // callers go through `spawn_blocking`.
    // -------------------------------------------------------------------------

    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(JobService) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.clone();
        tokio::task::spawn_blocking(move || op(service))
            .await
            .map_err(|e| OrchestratorError::Internal(format!("spawn_blocking error: {e}")))?
    }

    pub async fn status_async(&self, job_id: &str) -> Result<JobSummary> {
        let job_id = job_id.to_string();
        self.run_blocking(move |service| service.status(&job_id)).await
    }

    pub async fn list_async(&self, limit: usize) -> Result<Vec<JobSummary>> {
        self.run_blocking(move |service| service.list(limit)).await
    }

    pub async fn results_async(&self, job_id: &str) -> Result<JobResults> {
        let job_id = job_id.to_string();
        self.run_blocking(move |service| service.results(&job_id)).await
    }

    pub async fn delete_async(&self, job_id: &str) -> Result<()> {
        let job_id = job_id.to_string();
        self.run_blocking(move |service| service.delete(&job_id)).await
    }

    pub async fn stop_async(&self, job_id: &str) -> Result<StopOutcome> {
        let job_id = job_id.to_string();
        self.run_blocking(move |service| service.stop(&job_id)).await
    }

    pub async fn subscribe_log_async(&self, job_id: &str) -> Result<LogStream> {
        let id = job_id.to_string();
        self.run_blocking(move |service| service.store.read(&id).map(|_| ()))
            .await?;
        Ok(stream::follow_log(self.store.clone(), job_id, self.config.stream))
    }
}

fn prepare_working_folder(
    job_dir: &Path,
    store_root: &Path,
    request: &JobRequest,
    validated: &ValidatedRequest,
) -> Result<PathBuf> {
    let working_folder = if request.copy_input {
        let target = job_dir.join(WORK_DIR);
        copy_dir(&validated.input_folder, &target, store_root)?;
        target
    } else {
        validated.input_folder.clone()
    };

    let config_path = working_folder.join(&validated.config_file);
    overrides::apply_to_file(&config_path, &request.overrides)?;
    Ok(working_folder)
}

/// Recursively copy `from` into a new directory `to`, following symlinks.
///
/// `skip` and everything below it is left out: a store root inside the input
/// folder would otherwise be copied into itself.
fn copy_dir(from: &Path, to: &Path, skip: &Path) -> Result<()> {
    let walker = WalkDir::new(from)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !entry.path().starts_with(skip));
    for entry in walker {
        let entry = entry.map_err(|e| {
            OrchestratorError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "symlink loop in input folder")
            }))
        })?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn copy_dir_copies_nested_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("partition_finder.cfg"), "search = greedy;\n").unwrap();
        fs::write(src.join("nested").join("aln.phy"), "2 4\n").unwrap();

        let dst = tmp.path().join("dst");
        copy_dir(&src, &dst, &tmp.path().join("elsewhere")).unwrap();

        assert_eq!(
            fs::read_to_string(dst.join("partition_finder.cfg")).unwrap(),
            "search = greedy;\n"
        );
        assert_eq!(fs::read_to_string(dst.join("nested").join("aln.phy")).unwrap(), "2 4\n");
    }

    #[test]
    fn copy_dir_leaves_out_nested_store_root() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let store_root = src.join(".pf_jobs");
        fs::create_dir_all(store_root.join("job1").join("work")).unwrap();
        fs::write(store_root.join("job1").join("meta.json"), "{}").unwrap();
        fs::write(src.join("partition_finder.cfg"), "search = greedy;\n").unwrap();

        let dst = store_root.join("job2").join("work");
        copy_dir(&src, &dst, &store_root).unwrap();

        assert!(dst.join("partition_finder.cfg").is_file());
        assert!(!dst.join(".pf_jobs").exists());
    }

    #[test]
    fn stop_outcome_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&StopOutcome::AlreadyFinished).unwrap(),
            "\"already_finished\""
        );
        assert_eq!(StopOutcome::Stopped.as_str(), "stopped");
    }
}
