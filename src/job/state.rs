use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// `Queued` is initial, `Succeeded` and `Failed` are terminal. The only legal
/// moves are `Queued -> Running`, `Queued -> Failed` (stopped before the job
/// process started) and `Running -> {Succeeded, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Failed)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobState; 4] = [
        JobState::Queued,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
    ];

    #[test]
    fn terminal_states_never_transition() {
        for from in [JobState::Succeeded, JobState::Failed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn no_self_transitions() {
        for state in ALL {
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn forward_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Failed));
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobState::Succeeded).unwrap(), "\"succeeded\"");
        let parsed: JobState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, JobState::Running);
        assert_eq!(JobState::Queued.to_string(), "queued");
    }
}
