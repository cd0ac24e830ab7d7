//! Incremental delivery of a job's log to observers.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::StreamConfig;
use crate::error::Result;
use crate::store::JobStore;

/// Log chunks in append order. Ends once the job is terminal and the log has
/// been quiet for a while, or when the job is deleted.
pub type LogStream = ReceiverStream<String>;

/// Reads the bytes appended to a file since the previous call.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    pending: Vec<u8>,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            pending: Vec::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// New text since the last call, `None` if there is none yet.
    ///
    /// A multi-byte character split across two reads is held back until it
    /// is complete. A missing file reads as empty.
    pub fn read_new(&mut self) -> io::Result<Option<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            // Replaced or truncated underneath us.
            self.offset = 0;
            self.pending.clear();
        }
        if len == self.offset {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        file.take(len - self.offset).read_to_end(&mut chunk)?;
        self.offset += chunk.len() as u64;
        self.pending.extend_from_slice(&chunk);

        let text = take_complete_text(&mut self.pending);
        Ok((!text.is_empty()).then_some(text))
    }
}

fn take_complete_text(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_owned();
            pending.clear();
            text
        }
        // Only an incomplete sequence at the very end: keep it for later.
        Err(e) if e.error_len().is_none() => {
            let rest = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// Follow a job's log from the beginning.
///
/// Fails immediately with `JobNotFound` for an unknown job. Must be called
/// inside a Tokio runtime; the polling task stops when the returned stream
/// is dropped.
pub fn subscribe(store: JobStore, job_id: &str, config: StreamConfig) -> Result<LogStream> {
    store.read(job_id)?;
    Ok(follow_log(store, job_id, config))
}

/// Like [`subscribe`], without checking that the job exists.
pub fn follow_log(store: JobStore, job_id: &str, config: StreamConfig) -> LogStream {
    let (tx, rx) = mpsc::channel(64);
    let tail = store.log_path(job_id).ok().map(LogTail::new);
    tokio::spawn(follow(store, job_id.to_string(), tail, config, tx));
    ReceiverStream::new(rx)
}

/// What one poll of the log and the job record found.
enum JobCheck {
    Active,
    Terminal,
    Deleted,
    Unknown(String),
}

fn poll_once(
    store: &JobStore,
    job_id: &str,
    tail: &mut LogTail,
) -> (io::Result<Option<String>>, JobCheck) {
    let text = tail.read_new();
    let check = match store.read(job_id) {
        Ok(job) if job.is_terminal() => JobCheck::Terminal,
        Ok(_) => JobCheck::Active,
        Err(e) if e.is_not_found() && !store.dir_exists(job_id) => JobCheck::Deleted,
        Err(e) if e.is_not_found() => JobCheck::Active,
        Err(e) => JobCheck::Unknown(e.to_string()),
    };
    (text, check)
}

async fn follow(
    store: JobStore,
    job_id: String,
    tail: Option<LogTail>,
    config: StreamConfig,
    tx: mpsc::Sender<String>,
) {
    let Some(mut tail) = tail else {
        tracing::debug!(job_id = %job_id, "No log to follow");
        return;
    };
    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut idle_ticks = 0u32;

    loop {
        interval.tick().await;
        if tx.is_closed() {
            tracing::debug!(job_id = %job_id, "Log observer went away");
            return;
        }

        // File reads and the metadata retry loop block.
        let (poll_store, poll_id) = (store.clone(), job_id.clone());
        let polled = tokio::task::spawn_blocking(move || {
            let (text, check) = poll_once(&poll_store, &poll_id, &mut tail);
            (tail, text, check)
        })
        .await;
        let (returned, text, check) = match polled {
            Ok(polled) => polled,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Log poll task failed");
                return;
            }
        };
        tail = returned;

        match text {
            Ok(Some(text)) => {
                idle_ticks = 0;
                if tx.send(text).await.is_err() {
                    return;
                }
            }
            Ok(None) => idle_ticks = idle_ticks.saturating_add(1),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to read job log");
                idle_ticks = idle_ticks.saturating_add(1);
            }
        }

        match check {
            JobCheck::Terminal if idle_ticks > config.idle_ticks_before_close => break,
            JobCheck::Terminal | JobCheck::Active => {}
            JobCheck::Deleted => {
                tracing::debug!(job_id = %job_id, "Job deleted while streaming");
                break;
            }
            JobCheck::Unknown(error) => {
                tracing::debug!(job_id = %job_id, error = %error, "Stream status check failed");
            }
        }
    }
    tracing::debug!(job_id = %job_id, offset = tail.offset(), "Log stream finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn tail_reads_only_new_bytes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("job.log");
        let mut tail = LogTail::new(&path);
        assert_eq!(tail.read_new().unwrap(), None);

        std::fs::write(&path, "one\n").unwrap();
        assert_eq!(tail.read_new().unwrap().as_deref(), Some("one\n"));
        assert_eq!(tail.read_new().unwrap(), None);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"two\n").unwrap();
        assert_eq!(tail.read_new().unwrap().as_deref(), Some("two\n"));
        assert_eq!(tail.offset(), 8);
    }

    #[test]
    fn tail_holds_back_split_characters() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("job.log");
        let bytes = "α=1\n".as_bytes();

        std::fs::write(&path, &bytes[..1]).unwrap();
        let mut tail = LogTail::new(&path);
        assert_eq!(tail.read_new().unwrap(), None);

        std::fs::write(&path, bytes).unwrap();
        assert_eq!(tail.read_new().unwrap().as_deref(), Some("α=1\n"));
    }

    #[test]
    fn tail_replaces_invalid_bytes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("job.log");
        std::fs::write(&path, b"bad \xff byte\n").unwrap();

        let mut tail = LogTail::new(&path);
        assert_eq!(tail.read_new().unwrap().as_deref(), Some("bad \u{fffd} byte\n"));
    }

    #[test]
    fn tail_restarts_after_truncation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("job.log");
        std::fs::write(&path, "a long first line\n").unwrap();
        let mut tail = LogTail::new(&path);
        tail.read_new().unwrap();

        std::fs::write(&path, "new\n").unwrap();
        assert_eq!(tail.read_new().unwrap().as_deref(), Some("new\n"));
    }
}
