//! Submission requests and the validation performed before a job exists.

pub mod argv;
pub mod overrides;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
pub use crate::job::Datatype;

use argv::{DEFAULT_CPUS, MAX_CPUS, MIN_CPUS};

/// Name of the configuration file the engine looks for first.
pub const PREFERRED_CONFIG: &str = "partition_finder.cfg";
const CONFIG_EXTENSION: &str = "cfg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Folder holding the configuration file and alignment.
    pub folder: PathBuf,
    #[serde(default)]
    pub datatype: Datatype,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Arguments passed through to the engine.
    #[serde(default)]
    pub args: Vec<String>,
    /// Copy the input folder into an isolated working folder.
    #[serde(default = "default_copy_input", alias = "copyInput")]
    pub copy_input: bool,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

fn default_cpus() -> u32 {
    DEFAULT_CPUS
}

fn default_copy_input() -> bool {
    true
}

/// A request that passed every guardrail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    /// Canonical input folder.
    pub input_folder: PathBuf,
    /// File name of the configuration file inside the folder.
    pub config_file: PathBuf,
    pub argv: Vec<String>,
}

impl JobRequest {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            datatype: Datatype::default(),
            cpus: DEFAULT_CPUS,
            args: Vec::new(),
            copy_input: true,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_copy_input(mut self, copy_input: bool) -> Self {
        self.copy_input = copy_input;
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Run every guardrail. Touches nothing on disk.
    pub fn validate(&self) -> Result<ValidatedRequest, ValidationError> {
        if !(MIN_CPUS..=MAX_CPUS).contains(&self.cpus) {
            return Err(ValidationError::CpusOutOfRange {
                value: self.cpus,
                min: MIN_CPUS,
                max: MAX_CPUS,
            });
        }
        overrides::check_override_keys(&self.overrides)?;

        let input_folder = resolve_folder(&self.folder)?;
        let config_path = find_config_file(&input_folder)?;
        let config_file = config_path
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| ValidationError::MissingConfig(input_folder.clone()))?;

        let argv = argv::effective_argv(&self.args, self.cpus, self.copy_input)?;

        Ok(ValidatedRequest {
            input_folder,
            config_file,
            argv,
        })
    }
}

fn resolve_folder(folder: &Path) -> Result<PathBuf, ValidationError> {
    let resolved =
        fs::canonicalize(folder).map_err(|_| ValidationError::FolderNotFound(folder.to_path_buf()))?;
    if !resolved.is_dir() {
        return Err(ValidationError::NotADirectory(resolved));
    }
    Ok(resolved)
}

/// Locate the engine configuration file in `folder`.
///
/// `partition_finder.cfg` wins when present; otherwise exactly one `*.cfg`
/// file must exist.
pub fn find_config_file(folder: &Path) -> Result<PathBuf, ValidationError> {
    let preferred = folder.join(PREFERRED_CONFIG);
    if preferred.is_file() {
        return Ok(preferred);
    }

    let entries =
        fs::read_dir(folder).map_err(|_| ValidationError::FolderNotFound(folder.to_path_buf()))?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == CONFIG_EXTENSION)
        })
        .collect();
    candidates.sort();

    match candidates.len() {
        0 => Err(ValidationError::MissingConfig(folder.to_path_buf())),
        1 => Ok(candidates.remove(0)),
        _ => Err(ValidationError::AmbiguousConfig {
            folder: folder.to_path_buf(),
            candidates: candidates
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn folder_with(files: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in files {
            fs::write(dir.path().join(name), "# mock config\n").unwrap();
        }
        dir
    }

    #[test]
    fn request_defaults_from_json() {
        let req: JobRequest = serde_json::from_str(r#"{"folder": "/data/run1"}"#).unwrap();
        assert_eq!(req.folder, PathBuf::from("/data/run1"));
        assert_eq!(req.datatype, Datatype::Dna);
        assert_eq!(req.cpus, 1);
        assert!(req.args.is_empty());
        assert!(req.copy_input);
        assert!(req.overrides.is_empty());
    }

    #[test]
    fn request_rejects_unknown_datatype() {
        let parsed: Result<JobRequest, _> =
            serde_json::from_str(r#"{"folder": "/x", "datatype": "RNA"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn copy_input_accepts_camel_case() {
        let req: JobRequest =
            serde_json::from_str(r#"{"folder": "/x", "copyInput": false}"#).unwrap();
        assert!(!req.copy_input);
    }

    #[test]
    fn empty_folder_has_no_config() {
        let dir = folder_with(&[]);
        let err = find_config_file(dir.path()).unwrap_err();
        assert!(matches!(err, ValidationError::MissingConfig(_)));
        assert!(err.to_string().contains("No .cfg file found"));
    }

    #[test]
    fn preferred_config_wins_over_others() {
        let dir = folder_with(&["other.cfg", "partition_finder.cfg"]);
        let found = find_config_file(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "partition_finder.cfg");
    }

    #[test]
    fn single_config_is_accepted() {
        let dir = folder_with(&["analysis.cfg", "alignment.phy"]);
        let found = find_config_file(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "analysis.cfg");
    }

    #[test]
    fn config_extension_is_case_sensitive() {
        let dir = folder_with(&["ANALYSIS.CFG", "alignment.phy"]);
        let err = find_config_file(dir.path()).unwrap_err();
        assert!(matches!(err, ValidationError::MissingConfig(_)));

        let dir = folder_with(&["UPPER.CFG", "analysis.cfg"]);
        let found = find_config_file(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "analysis.cfg");
    }

    #[test]
    fn several_configs_are_ambiguous() {
        let dir = folder_with(&["b.cfg", "a.cfg"]);
        match find_config_file(dir.path()).unwrap_err() {
            ValidationError::AmbiguousConfig { candidates, .. } => {
                assert_eq!(candidates, vec!["a.cfg".to_string(), "b.cfg".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_reports_missing_folder() {
        let dir = TempDir::new().unwrap();
        let err = JobRequest::new(dir.path().join("absent")).validate().unwrap_err();
        assert!(matches!(err, ValidationError::FolderNotFound(_)));
    }

    #[test]
    fn validate_rejects_file_as_folder() {
        let dir = folder_with(&["partition_finder.cfg"]);
        let err = JobRequest::new(dir.path().join("partition_finder.cfg"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ValidationError::NotADirectory(_)));
    }

    #[test]
    fn validate_checks_cpus_range() {
        let dir = folder_with(&["partition_finder.cfg"]);
        for cpus in [0, 257] {
            let err = JobRequest::new(dir.path()).with_cpus(cpus).validate().unwrap_err();
            assert!(matches!(err, ValidationError::CpusOutOfRange { .. }));
        }
    }

    #[test]
    fn validate_rejects_unknown_override_before_touching_folder() {
        let dir = TempDir::new().unwrap();
        let err = JobRequest::new(dir.path().join("absent"))
            .with_override("alignment", "x.phy")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedOverrides(_)));
    }

    #[test]
    fn validate_computes_argv() {
        let dir = folder_with(&["partition_finder.cfg"]);
        let validated = JobRequest::new(dir.path())
            .with_cpus(4)
            .with_args(["-n", "-f"])
            .validate()
            .unwrap();
        assert_eq!(validated.argv, vec!["-p", "4", "-n", "-f"]);
        assert_eq!(validated.config_file, PathBuf::from("partition_finder.cfg"));
        assert_eq!(validated.input_folder, fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn validate_rejects_parallelism_without_isolation() {
        let dir = folder_with(&["partition_finder.cfg"]);
        let err = JobRequest::new(dir.path())
            .with_cpus(2)
            .with_copy_input(false)
            .validate()
            .unwrap_err();
        assert_eq!(err, ValidationError::ParallelismRequiresIsolation(2));
    }
}
