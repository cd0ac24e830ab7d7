use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::{utc_now, JobState};
use crate::request::argv::parallelism_from_argv;

/// Sequence type handed through to the wrapped engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Datatype {
    #[default]
    #[serde(rename = "DNA")]
    Dna,
    #[serde(rename = "protein")]
    Protein,
    #[serde(rename = "morphology")]
    Morphology,
}

impl Datatype {
    pub fn as_str(self) -> &'static str {
        match self {
            Datatype::Dna => "DNA",
            Datatype::Protein => "protein",
            Datatype::Morphology => "morphology",
        }
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Datatype {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DNA" => Ok(Datatype::Dna),
            "protein" => Ok(Datatype::Protein),
            "morphology" => Ok(Datatype::Morphology),
            other => Err(format!(
                "unknown datatype {other:?}, expected one of DNA, protein, morphology"
            )),
        }
    }
}

/// Persisted metadata of one job, stored as `meta.json` in the job directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: JobState,
    pub datatype: Datatype,
    pub input_folder: PathBuf,
    pub working_folder: PathBuf,
    /// Effective engine invocation, frozen at submission.
    pub argv: Vec<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Generate a fresh job id (32 lowercase hex characters).
    pub fn new_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn queued(
        id: String,
        datatype: Datatype,
        input_folder: PathBuf,
        working_folder: PathBuf,
        argv: Vec<String>,
    ) -> Self {
        let now = utc_now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            state: JobState::Queued,
            datatype,
            input_folder,
            working_folder,
            argv,
            pid: None,
            exit_code: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Parallelism recorded in `argv`, if any.
    pub fn cpus(&self) -> Option<u32> {
        parallelism_from_argv(&self.argv)
    }

    pub fn touch(&mut self) {
        self.updated_at = utc_now();
    }

    /// Move to `next`, refusing anything the state machine does not allow.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Terminal transition carrying the exit code and optional error text.
    pub fn finish(&mut self, next: JobState, exit_code: i32, error: Option<String>) -> Result<()> {
        if !next.is_terminal() {
            return Err(OrchestratorError::Internal(format!(
                "finish called with non-terminal state {next}"
            )));
        }
        self.transition(next)?;
        self.exit_code = Some(exit_code);
        self.error = error;
        Ok(())
    }
}
