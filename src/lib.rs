pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod request;
pub mod results;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod stream;
pub mod worker;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use job::{Datatype, Job, JobState};
pub use request::JobRequest;
pub use service::{JobService, JobSummary, StopOutcome};
