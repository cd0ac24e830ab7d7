//! Filesystem job store.
//!
//! Every job owns one directory `<root>/<job-id>/` holding:
//! - `meta.json`: the [`Job`] record, replaced atomically on every mutation
//! - `job.log`: an append-only text log
//!
//! The store is safe for concurrent use from several processes:
//! - writes go to a temporary file in the job directory and are renamed into
//!   place, so readers never observe a partial record
//! - reads retry transient failures per [`ReadRetryPolicy`]
//! - read-modify-write updates and log appends hold an exclusive `flock` on
//!   the job directory, which never blocks other jobs

pub mod lock;
pub mod retry;

pub use lock::DirLock;
pub use retry::{ReadRetryPolicy, RetryExhausted};

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::error::{OrchestratorError, Result};
use crate::job::Job;

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "job.log";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
    retry: ReadRetryPolicy,
}

enum ReadFailure {
    Missing,
    Io(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadFailure::Missing => write!(f, "metadata file missing"),
            ReadFailure::Io(e) => write!(f, "{e}"),
            ReadFailure::Parse(e) => write!(f, "{e}"),
        }
    }
}

impl JobStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// The root is made absolute so job processes started elsewhere agree on it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = fs::canonicalize(&root)?;
        Ok(Self {
            root,
            retry: ReadRetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: ReadRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a job. Ids that are not plain tokens are reported as unknown.
    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        validate_id(job_id)?;
        Ok(self.root.join(job_id))
    }

    pub fn meta_path(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.job_dir(job_id)?.join(META_FILE))
    }

    pub fn log_path(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.job_dir(job_id)?.join(LOG_FILE))
    }

    /// True if the job has a metadata record.
    pub fn exists(&self, job_id: &str) -> bool {
        self.meta_path(job_id).map(|p| p.is_file()).unwrap_or(false)
    }

    /// True if the job directory exists, with or without metadata.
    pub fn dir_exists(&self, job_id: &str) -> bool {
        self.job_dir(job_id).map(|p| p.is_dir()).unwrap_or(false)
    }

    pub fn create_job_dir(&self, job_id: &str) -> Result<PathBuf> {
        let dir = self.job_dir(job_id)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Atomically replace the job's metadata record.
    pub fn write(&self, job: &Job) -> Result<()> {
        let dir = self.create_job_dir(&job.id)?;
        let payload = serde_json::to_vec_pretty(job)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&payload)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(META_FILE)).map_err(|e| e.error)?;
        Ok(())
    }

    /// Read a job's metadata, retrying transient failures.
    pub fn read(&self, job_id: &str) -> Result<Job> {
        let path = self.meta_path(job_id)?;
        if !path.exists() {
            return Err(OrchestratorError::JobNotFound(job_id.to_string()));
        }

        self.retry
            .run(
                || {
                    let raw = fs::read(&path).map_err(|e| {
                        if e.kind() == io::ErrorKind::NotFound {
                            ReadFailure::Missing
                        } else {
                            ReadFailure::Io(e)
                        }
                    })?;
                    serde_json::from_slice::<Job>(&raw).map_err(ReadFailure::Parse)
                },
                |failure| !matches!(failure, ReadFailure::Missing),
            )
            .map_err(|exhausted| match exhausted.last {
                ReadFailure::Missing => OrchestratorError::JobNotFound(job_id.to_string()),
                other => {
                    tracing::warn!(
                        job_id,
                        attempts = exhausted.attempts,
                        error = %other,
                        "Job metadata unreadable"
                    );
                    OrchestratorError::MetadataUnreadable {
                        job_id: job_id.to_string(),
                        attempts: exhausted.attempts,
                        reason: other.to_string(),
                    }
                }
            })
    }

    /// Read-modify-write under the job lock. Nothing is written if `apply` fails.
    pub fn update<F>(&self, job_id: &str, apply: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let _guard = self.lock(job_id)?;
        let mut job = self.read(job_id)?;
        apply(&mut job)?;
        self.write(&job)?;
        Ok(job)
    }

    /// Append `text` to the job log, terminating it with a newline.
    pub fn append_log(&self, job_id: &str, text: &str) -> Result<()> {
        let path = self.log_path(job_id)?;
        let _guard = self.lock(job_id)?;

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if text.ends_with('\n') {
            file.write_all(text.as_bytes())?;
        } else {
            let mut line = String::with_capacity(text.len() + 1);
            line.push_str(text);
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    /// Current size of the job log, `None` if it has not been created yet.
    pub fn log_size(&self, job_id: &str) -> Result<Option<u64>> {
        match fs::metadata(self.log_path(job_id)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every job directory under the root.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Remove the job directory and everything in it.
    ///
    /// Returns `false` if there was nothing to delete.
    pub fn delete(&self, job_id: &str) -> Result<bool> {
        self.delete_with(job_id, |_| Ok(()))
    }

    /// Like [`delete`](Self::delete), but `check` sees the metadata under the
    /// job lock first and may veto the removal. It gets `None` when the record
    /// is missing or unreadable.
    pub fn delete_with<F>(&self, job_id: &str, check: F) -> Result<bool>
    where
        F: FnOnce(Option<&Job>) -> Result<()>,
    {
        let dir = match self.job_dir(job_id) {
            Ok(dir) => dir,
            Err(_) => return Ok(false),
        };
        if !dir.is_dir() {
            return Ok(false);
        }

        let _guard = match self.lock(job_id) {
            Ok(guard) => guard,
            Err(OrchestratorError::JobNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let job = match self.read(job_id) {
            Ok(job) => Some(job),
            Err(e @ OrchestratorError::MetadataUnreadable { .. }) => {
                tracing::warn!(job_id, error = %e, "Deleting job with unreadable metadata");
                None
            }
            Err(OrchestratorError::JobNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        check(job.as_ref())?;

        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Exclusive lock on one job's directory.
    pub fn lock(&self, job_id: &str) -> Result<DirLock> {
        let dir = self.job_dir(job_id)?;
        lock::lock_dir(&dir, LOCK_TIMEOUT).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                OrchestratorError::JobNotFound(job_id.to_string())
            } else {
                OrchestratorError::Io(e)
            }
        })
    }
}

fn validate_id(job_id: &str) -> Result<()> {
    let plain = !job_id.is_empty()
        && job_id.len() <= MAX_ID_LEN
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        Ok(())
    } else {
        Err(OrchestratorError::JobNotFound(job_id.to_string()))
    }
}
