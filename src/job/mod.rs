pub mod metadata;
pub mod state;

pub use metadata::{Datatype, Job};
pub use state::JobState;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// Current UTC time at second precision.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// `2026-01-01T00:00:00Z` style timestamp used in log lines.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Prefix a log message with the current timestamp.
pub fn log_line(message: impl std::fmt::Display) -> String {
    format!("[{}] {}", timestamp(utc_now()), message)
}
