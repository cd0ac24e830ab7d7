//! Shared fixtures for orchestrator integration tests.
//!
//! Jobs run through the real `pf-orchestrator run-job` binary, with `sh -c`
//! standing in for the analysis engine.

#![allow(dead_code)]

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use pf_orchestrator::config::{EngineConfig, HeartbeatConfig, OrchestratorConfig, StreamConfig};
use pf_orchestrator::job::{Datatype, Job, JobState};
use pf_orchestrator::store::JobStore;
use pf_orchestrator::JobService;

/// How long end-to-end tests wait for a job process.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(20);

pub fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pf-orchestrator"))
}

/// Engine that runs `script` with the job argv and working folder as `$@`.
pub fn sh_engine(script: &str) -> EngineConfig {
    EngineConfig::new("sh")
        .with_arg("-c")
        .with_arg(script)
        .with_arg("engine")
}

/// Config with short timings, the real worker binary and a scripted engine.
pub fn test_config(store_root: &Path, script: &str) -> OrchestratorConfig {
    OrchestratorConfig::new(store_root)
        .with_worker_program(worker_binary())
        .with_engine(sh_engine(script))
        .with_heartbeat(HeartbeatConfig {
            interval: Duration::from_millis(100),
            silence_threshold: Duration::from_millis(300),
        })
        .with_stream(StreamConfig {
            poll_interval: Duration::from_millis(20),
            idle_ticks_before_close: 3,
        })
}

/// A temp directory holding a store root and input folders.
pub struct TestEnv {
    pub tmp: TempDir,
    pub service: JobService,
}

impl TestEnv {
    pub fn new(script: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let service = JobService::new(test_config(&tmp.path().join("jobs"), script)).unwrap();
        Self { tmp, service }
    }

    /// Environment whose job processes can never start.
    pub fn without_worker() -> Self {
        let tmp = TempDir::new().unwrap();
        let config = OrchestratorConfig::new(tmp.path().join("jobs"))
            .with_worker_program("/nonexistent/pf-orchestrator");
        let service = JobService::new(config).unwrap();
        Self { tmp, service }
    }

    pub fn store(&self) -> &JobStore {
        self.service.store()
    }

    /// Input folder with a `partition_finder.cfg` and an alignment.
    pub fn analysis_folder(&self, name: &str) -> PathBuf {
        analysis_folder(self.tmp.path(), name)
    }
}

pub fn analysis_folder(parent: &Path, name: &str) -> PathBuf {
    let folder = parent.join(name);
    fs::create_dir_all(&folder).unwrap();
    fs::write(
        folder.join("partition_finder.cfg"),
        "alignment = test.phy;\nbranchlengths = linked;\nmodels = all;\nmodel_selection = aicc;\nsearch = greedy;\n",
    )
    .unwrap();
    fs::write(folder.join("test.phy"), "2 4\nA ACGT\nB ACGA\n").unwrap();
    folder
}

/// Persist a job record directly, bypassing submission.
pub fn write_job(store: &JobStore, id: &str, state: JobState, updated_at: DateTime<Utc>) -> Job {
    let mut job = Job::queued(
        id.to_string(),
        Datatype::Dna,
        PathBuf::from("/in"),
        PathBuf::from("/work"),
        Vec::new(),
    );
    job.state = state;
    job.created_at = updated_at;
    job.updated_at = updated_at;
    store.write(&job).unwrap();
    job
}

pub fn read_log(store: &JobStore, id: &str) -> String {
    let raw = fs::read(store.log_path(id).unwrap()).unwrap_or_default();
    String::from_utf8_lossy(&raw).into_owned()
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(25)).await;
    assert!(result, "{}", message);
}
