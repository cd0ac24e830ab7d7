use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::error::ValidationError;

/// Configuration keys a request may override.
pub const ALLOWED_OVERRIDE_KEYS: [&str; 4] = ["models", "model_selection", "search", "branchlengths"];

pub fn check_override_keys(overrides: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    let unknown: Vec<String> = overrides
        .keys()
        .filter(|k| !ALLOWED_OVERRIDE_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedOverrides(unknown))
    }
}

/// Rewrite `key = value;` assignments in configuration text.
///
/// The first line assigning `key` (case-insensitive) is replaced; keys with no
/// assignment are appended at the end.
pub fn apply_to_text(text: &str, overrides: &BTreeMap<String, String>) -> String {
    let mut lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();

    for (key, value) in overrides {
        let replacement = format!("{key} = {value};");
        match lines.iter().position(|line| assigns_key(line, key)) {
            Some(idx) => {
                let ending = line_ending(&lines[idx]);
                lines[idx] = format!("{replacement}{ending}");
            }
            None => {
                if let Some(last) = lines.last_mut() {
                    if !last.ends_with('\n') {
                        last.push('\n');
                    }
                }
                lines.push(format!("{replacement}\n"));
            }
        }
    }

    lines.concat()
}

/// Apply overrides to a configuration file in place. Returns whether it changed.
pub fn apply_to_file(cfg_path: &Path, overrides: &BTreeMap<String, String>) -> io::Result<bool> {
    if overrides.is_empty() {
        return Ok(false);
    }
    let raw = fs::read(cfg_path)?;
    let text = String::from_utf8_lossy(&raw);
    let updated = apply_to_text(&text, overrides);
    if updated == text {
        return Ok(false);
    }
    fs::write(cfg_path, updated)?;
    Ok(true)
}

fn assigns_key(line: &str, key: &str) -> bool {
    let trimmed = line.trim();
    if !trimmed.ends_with(';') {
        return false;
    }
    match trimmed.split_once('=') {
        Some((lhs, _)) => lhs.trim().eq_ignore_ascii_case(key),
        None => false,
    }
}

fn line_ending(line: &str) -> &'static str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const CFG: &str = "## ALIGNMENT FILE ##\nalignment = test.phy;\n\nbranchlengths = linked;\nMODELS = all;\nmodel_selection = aicc;\n\n[schemes]\nsearch = greedy;\n";

    #[test]
    fn unknown_keys_are_rejected() {
        let err = check_override_keys(&overrides(&[("models", "all"), ("alignment", "x.phy")]))
            .unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedOverrides(vec!["alignment".into()]));
        assert!(err.to_string().contains("alignment"));
    }

    #[test]
    fn allowed_keys_pass() {
        assert!(check_override_keys(&overrides(&[("search", "rcluster"), ("models", "raxml")])).is_ok());
        assert!(check_override_keys(&BTreeMap::new()).is_ok());
    }

    #[test]
    fn replaces_existing_assignment_case_insensitively() {
        let out = apply_to_text(CFG, &overrides(&[("models", "beast"), ("search", "all")]));
        assert!(out.contains("\nmodels = beast;\n"));
        assert!(!out.contains("MODELS = all;"));
        assert!(out.contains("\nsearch = all;\n"));
        assert!(out.contains("alignment = test.phy;"));
        assert_eq!(out.lines().count(), CFG.lines().count());
    }

    #[test]
    fn appends_missing_assignment() {
        let out = apply_to_text("alignment = a.phy;", &overrides(&[("branchlengths", "unlinked")]));
        assert_eq!(out, "alignment = a.phy;\nbranchlengths = unlinked;\n");
    }

    #[test]
    fn only_first_assignment_is_replaced() {
        let text = "search = greedy;\nsearch = all;\n";
        let out = apply_to_text(text, &overrides(&[("search", "rcluster")]));
        assert_eq!(out, "search = rcluster;\nsearch = all;\n");
    }

    #[test]
    fn file_is_untouched_without_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partition_finder.cfg");
        fs::write(&path, "search = greedy;\n").unwrap();

        assert!(!apply_to_file(&path, &BTreeMap::new()).unwrap());
        assert!(!apply_to_file(&path, &overrides(&[("search", "greedy")])).unwrap());
        assert!(apply_to_file(&path, &overrides(&[("search", "all")])).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "search = all;\n");
    }
}
