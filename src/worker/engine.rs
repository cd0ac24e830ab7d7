use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::job::{Datatype, Job};
use crate::worker::JobLog;

/// Environment variable carrying the datatype to the engine process.
pub const DATATYPE_ENV: &str = "PF_DATATYPE";

/// Everything the engine needs to analyse one working folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    pub working_folder: PathBuf,
    pub datatype: Datatype,
    pub argv: Vec<String>,
}

impl From<&Job> for EngineInvocation {
    fn from(job: &Job) -> Self {
        Self {
            working_folder: job.working_folder.clone(),
            datatype: job.datatype,
            argv: job.argv.clone(),
        }
    }
}

/// The wrapped analysis engine, treated as a synchronous black box.
///
/// `Ok(code)` is the engine's numeric result (zero means success); `Err` is a
/// failure to run it at all. Output lines go to `log` in the order produced.
pub trait Engine: Send + Sync {
    fn run(
        &self,
        invocation: &EngineInvocation,
        log: &JobLog,
    ) -> impl Future<Output = Result<i32, EngineError>> + Send;
}

/// Runs the engine as an external program, capturing stdout and stderr line by line.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    config: EngineConfig,
}

impl CommandEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn command(&self, invocation: &EngineInvocation) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .args(&invocation.argv)
            .arg(&invocation.working_folder)
            .current_dir(&invocation.working_folder)
            .env(DATATYPE_ENV, invocation.datatype.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Engine for CommandEngine {
    async fn run(&self, invocation: &EngineInvocation, log: &JobLog) -> Result<i32, EngineError> {
        tracing::info!(
            program = %self.config.program,
            argv = ?invocation.argv,
            working_folder = %invocation.working_folder.display(),
            datatype = %invocation.datatype,
            "Starting engine"
        );

        let mut child = self
            .command(invocation)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        let (tx, mut rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx.clone()));
        }
        drop(tx);

        // Closes once both pipes hit EOF.
        while let Some(line) = rx.recv().await {
            log.append(&line);
        }

        let status = child.wait().await?;
        match (status.code(), status.signal()) {
            (Some(code), _) => Ok(code),
            (None, Some(signal)) => Err(EngineError::Signaled(signal)),
            (None, None) => Err(EngineError::NoExitCode),
        }
    }
}

async fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read engine output");
                break;
            }
        }
    }
}
