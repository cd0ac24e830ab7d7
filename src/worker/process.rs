use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::{EngineConfig, HeartbeatConfig, WorkerConfig};

/// Hidden subcommand the per-job process is started with.
pub const RUN_JOB_SUBCOMMAND: &str = "run-job";

/// Command line of the per-job process.
#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct WorkerArgs {
    /// Job store root
    #[arg(long)]
    pub store_root: PathBuf,

    /// Job to run
    #[arg(long)]
    pub job_id: String,

    /// Engine executable
    #[arg(long)]
    pub engine_program: String,

    /// Engine argument placed before the job's argv (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    #[arg(long, default_value_t = 1000)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    pub silence_threshold_ms: u64,
}

impl WorkerArgs {
    pub fn new(
        store_root: impl Into<PathBuf>,
        job_id: impl Into<String>,
        engine: &EngineConfig,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            store_root: store_root.into(),
            job_id: job_id.into(),
            engine_program: engine.program.clone(),
            engine_args: engine.args.clone(),
            heartbeat_interval_ms: duration_ms(heartbeat.interval),
            silence_threshold_ms: duration_ms(heartbeat.silence_threshold),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            program: self.engine_program.clone(),
            args: self.engine_args.clone(),
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            silence_threshold: Duration::from_millis(self.silence_threshold_ms),
        }
    }

    /// Arguments following the `run-job` subcommand.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--store-root".into(),
            self.store_root.clone().into_os_string(),
            "--job-id".into(),
            self.job_id.clone().into(),
            "--engine-program".into(),
            self.engine_program.clone().into(),
        ];
        for arg in &self.engine_args {
            args.push(format!("--engine-arg={arg}").into());
        }
        args.push(format!("--heartbeat-interval-ms={}", self.heartbeat_interval_ms).into());
        args.push(format!("--silence-threshold-ms={}", self.silence_threshold_ms).into());
        args
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Starts per-job processes.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpawner {
    config: WorkerConfig,
}

impl WorkerSpawner {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    fn program(&self) -> io::Result<PathBuf> {
        match &self.config.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe(),
        }
    }

    /// Start the job process and return its pid.
    ///
    /// The process leads its own process group, so [`terminate`] reaches the
    /// engine it starts as well. Its stderr is appended to `log_path`. The
    /// child is reaped by a background task; must be called inside a Tokio
    /// runtime.
    pub fn spawn(&self, args: &WorkerArgs, log_path: &Path) -> io::Result<u32> {
        let program = self.program()?;
        let stderr = OpenOptions::new().create(true).append(true).open(log_path)?;

        let mut child = Command::new(&program)
            .args(&self.config.prefix_args)
            .arg(RUN_JOB_SUBCOMMAND)
            .args(args.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "job process exited before reporting a pid"))?;

        let job_id = args.job_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(job_id = %job_id, pid, %status, "Job process exited"),
                Err(e) => tracing::warn!(job_id = %job_id, pid, error = %e, "Failed to wait for job process"),
            }
        });

        tracing::info!(job_id = %args.job_id, pid, program = %program.display(), "Job process started");
        Ok(pid)
    }
}

/// Send SIGTERM to a job process and its process group. Best effort.
pub fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|pid| *pid > 1)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("refusing to signal pid {pid}")))?;

    // Group first: the engine runs in the same group as the job process.
    if unsafe { libc::killpg(pid, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    Err(io::Error::last_os_error())
}

/// True if a process with this pid exists.
pub fn is_alive(pid: u32) -> bool {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => unsafe { libc::kill(pid, 0) == 0 },
        _ => false,
    }
}
