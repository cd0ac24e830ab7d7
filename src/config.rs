use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::ReadRetryPolicy;

/// Environment variable overriding the job store root.
pub const JOB_DIR_ENV: &str = "PF_JOB_DIR";

/// Store root used when `PF_JOB_DIR` is not set, relative to the working directory.
pub const DEFAULT_JOB_DIR: &str = ".pf_jobs";

/// How the wrapped analysis engine is invoked.
///
/// The final command line is `<program> <args...> <effective argv...> <working folder>`,
/// run with the working folder as current directory and `PF_DATATYPE` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["PartitionFinder.py".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Executable re-invoked as the isolated per-job process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Program to run. `None` means the current executable.
    pub program: Option<PathBuf>,
    /// Arguments placed before the `run-job` subcommand.
    pub prefix_args: Vec<OsString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Period between metadata touches.
    pub interval: Duration,
    /// Log silence after which a synthetic "still running" line is written.
    pub silence_threshold: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            silence_threshold: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub poll_interval: Duration,
    /// Consecutive empty polls after a terminal state before the stream closes.
    pub idle_ticks_before_close: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            idle_ticks_before_close: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub store_root: PathBuf,
    pub worker: WorkerConfig,
    pub engine: EngineConfig,
    pub heartbeat: HeartbeatConfig,
    pub stream: StreamConfig,
    pub read_retry: ReadRetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from(DEFAULT_JOB_DIR),
            worker: WorkerConfig::default(),
            engine: EngineConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            stream: StreamConfig::default(),
            read_retry: ReadRetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            ..Default::default()
        }
    }

    /// Defaults with the store root taken from `PF_JOB_DIR` when set.
    pub fn from_env() -> Self {
        Self::new(store_root_from(std::env::var_os(JOB_DIR_ENV)))
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker.program = Some(program.into());
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }
}

fn store_root_from(configured: Option<OsString>) -> PathBuf {
    match configured {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_JOB_DIR),
    }
}
