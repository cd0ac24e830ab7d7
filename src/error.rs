use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobState;

/// Reasons a submission is rejected before any job state is persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Folder not found: {0}")]
    FolderNotFound(PathBuf),

    #[error("Path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("No .cfg file found in {0}. PartitionFinder requires a partition_finder.cfg file.")]
    MissingConfig(PathBuf),

    #[error("Multiple .cfg files found in {folder}: {candidates:?}; keep exactly one or name it partition_finder.cfg")]
    AmbiguousConfig {
        folder: PathBuf,
        candidates: Vec<String>,
    },

    #[error("'{flag}' requires a value")]
    MissingParallelismValue { flag: String },

    #[error("'{flag}' value must be an integer, got {value:?}")]
    MalformedParallelism { flag: String, value: String },

    #[error("cpus conflicts with explicit '-p/--processes' in args ({explicit} vs {cpus}); please use one or ensure they match")]
    ParallelismConflict { explicit: u32, cpus: u32 },

    #[error("cpus > 1 requires copy_input=true for reproducibility (effective cpus: {0})")]
    ParallelismRequiresIsolation(u32),

    #[error("cpus must be between {min} and {max}, got {value}")]
    CpusOutOfRange { value: u32, min: u32, max: u32 },

    #[error("Unsupported override keys: {}", .0.join(", "))]
    UnsupportedOverrides(Vec<String>),
}

/// Structured failure of the wrapped engine, as opposed to a numeric exit code.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to start engine {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine terminated by signal {0}")]
    Signaled(i32),

    #[error("engine exited without a status code")]
    NoExitCode,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Cannot delete a running job ({0}). Wait for completion or stop it first.")]
    JobRunning(String),

    #[error("Illegal state transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    #[error("Failed to read metadata for job {job_id} after {attempts} attempts: {reason}")]
    MetadataUnreadable {
        job_id: String,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to spawn job process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::JobNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
