//! Result artifacts of finished jobs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::job::{Job, JobState};

/// Directory, relative to the working folder, where the engine writes its output.
pub const ANALYSIS_DIR: &str = "analysis";
pub const BEST_SCHEME_FILE: &str = "best_scheme.txt";
pub const SCHEME_DATA_FILE: &str = "scheme_data.csv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResults {
    pub id: String,
    pub state: JobState,
    pub cpus: Option<u32>,
    pub best_scheme_txt: Option<String>,
    pub scheme_data_csv: Option<String>,
    pub analysis_path: Option<PathBuf>,
}

impl JobResults {
    pub fn is_empty(&self) -> bool {
        self.best_scheme_txt.is_none() && self.scheme_data_csv.is_none()
    }
}

/// Collect whatever result artifacts exist for `job`.
///
/// Jobs that have not reached a terminal state report no artifacts, so files
/// left over from an earlier run in the same folder are never mistaken for
/// this job's output.
pub fn collect(job: &Job) -> JobResults {
    let mut results = JobResults {
        id: job.id.clone(),
        state: job.state,
        cpus: job.cpus(),
        best_scheme_txt: None,
        scheme_data_csv: None,
        analysis_path: None,
    };
    if !job.is_terminal() {
        return results;
    }

    let analysis = job.working_folder.join(ANALYSIS_DIR);
    if !analysis.is_dir() {
        return results;
    }
    results.best_scheme_txt = find_artifact(&analysis, BEST_SCHEME_FILE).and_then(|p| read_text(&p));
    results.scheme_data_csv = find_artifact(&analysis, SCHEME_DATA_FILE).and_then(|p| read_text(&p));
    results.analysis_path = Some(analysis);
    results
}

/// Locate `file_name` under `dir`: directly inside it first, then anywhere
/// below it in name order.
pub fn find_artifact(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let direct = dir.join(file_name);
    if direct.is_file() {
        return Some(direct);
    }
    WalkDir::new(dir)
        .min_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == file_name)
        .map(|entry| entry.into_path())
}

fn read_text(path: &Path) -> Option<String> {
    match fs::read(path) {
        Ok(raw) => Some(String::from_utf8_lossy(&raw).into_owned()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read result artifact");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Datatype;
    use tempfile::TempDir;

    fn job_in(work: &Path, state: JobState) -> Job {
        let mut job = Job::queued(
            "job1".into(),
            Datatype::Dna,
            work.to_path_buf(),
            work.to_path_buf(),
            vec!["-p".into(), "2".into()],
        );
        job.state = state;
        job
    }

    #[test]
    fn finished_job_without_output_has_no_artifacts() {
        let tmp = TempDir::new().unwrap();
        let results = collect(&job_in(tmp.path(), JobState::Failed));
        assert!(results.is_empty());
        assert!(results.analysis_path.is_none());
        assert_eq!(results.cpus, Some(2));
    }

    #[test]
    fn reads_direct_artifacts() {
        let tmp = TempDir::new().unwrap();
        let analysis = tmp.path().join(ANALYSIS_DIR);
        fs::create_dir_all(&analysis).unwrap();
        fs::write(analysis.join(BEST_SCHEME_FILE), "Scheme Name: best\n").unwrap();

        let results = collect(&job_in(tmp.path(), JobState::Succeeded));
        assert_eq!(results.best_scheme_txt.as_deref(), Some("Scheme Name: best\n"));
        assert!(results.scheme_data_csv.is_none());
        assert_eq!(results.analysis_path, Some(analysis));
    }

    #[test]
    fn finds_nested_scheme_data() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join(ANALYSIS_DIR).join("schemes").join("run");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join(SCHEME_DATA_FILE), "name,lnl\nbest,-1.0\n").unwrap();

        let results = collect(&job_in(tmp.path(), JobState::Succeeded));
        assert_eq!(results.scheme_data_csv.as_deref(), Some("name,lnl\nbest,-1.0\n"));
    }

    #[test]
    fn direct_artifact_wins_over_nested() {
        let tmp = TempDir::new().unwrap();
        let analysis = tmp.path().join(ANALYSIS_DIR);
        fs::create_dir_all(analysis.join("a")).unwrap();
        fs::write(analysis.join("a").join(BEST_SCHEME_FILE), "nested").unwrap();
        fs::write(analysis.join(BEST_SCHEME_FILE), "direct").unwrap();

        assert_eq!(
            find_artifact(&analysis, BEST_SCHEME_FILE),
            Some(analysis.join(BEST_SCHEME_FILE))
        );
    }

    #[test]
    fn running_job_ignores_existing_files() {
        let tmp = TempDir::new().unwrap();
        let analysis = tmp.path().join(ANALYSIS_DIR);
        fs::create_dir_all(&analysis).unwrap();
        fs::write(analysis.join(BEST_SCHEME_FILE), "stale").unwrap();

        let results = collect(&job_in(tmp.path(), JobState::Running));
        assert!(results.is_empty());
        assert!(results.analysis_path.is_none());
    }
}
