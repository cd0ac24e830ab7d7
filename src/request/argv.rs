//! Guardrails turning a request's free-form engine arguments and `cpus` into
//! the effective invocation.

use crate::error::ValidationError;

pub const DEFAULT_CPUS: u32 = 1;
pub const MIN_CPUS: u32 = 1;
pub const MAX_CPUS: u32 = 256;

/// Spellings of the engine's parallelism flag taking a separate value.
const PARALLELISM_FLAGS: [&str; 3] = ["-p", "--processes", "--processors"];
/// Spellings carrying the value inline.
const PARALLELISM_PREFIXES: [&str; 2] = ["--processes=", "--processors="];

/// Explicit parallelism in `args`, if present. The first occurrence wins.
pub fn explicit_parallelism(args: &[String]) -> Result<Option<u32>, ValidationError> {
    for (i, token) in args.iter().enumerate() {
        if PARALLELISM_FLAGS.contains(&token.as_str()) {
            let value = args
                .get(i + 1)
                .ok_or_else(|| ValidationError::MissingParallelismValue {
                    flag: token.clone(),
                })?;
            return parse_count(token, value).map(Some);
        }
        for prefix in PARALLELISM_PREFIXES {
            if let Some(value) = token.strip_prefix(prefix) {
                return parse_count(prefix, value).map(Some);
            }
        }
    }
    Ok(None)
}

fn parse_count(flag: &str, value: &str) -> Result<u32, ValidationError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ValidationError::MalformedParallelism {
            flag: flag.to_string(),
            value: value.to_string(),
        })
}

/// Compute the engine argv for `args` and `cpus`.
///
/// - An explicit parallelism flag in `args` is kept as is; a non-default `cpus`
///   that disagrees with it is a conflict.
/// - Otherwise `-p <cpus>` is prepended, except when `args` is non-empty and
///   `cpus` is the single-worker default the engine already uses.
/// - Effective parallelism above one requires `copy_input`, since engine
///   workers write into the working folder.
pub fn effective_argv(
    args: &[String],
    cpus: u32,
    copy_input: bool,
) -> Result<Vec<String>, ValidationError> {
    let mut argv = args.to_vec();

    let effective = match explicit_parallelism(args)? {
        Some(explicit) => {
            if cpus != DEFAULT_CPUS && explicit != cpus {
                return Err(ValidationError::ParallelismConflict { explicit, cpus });
            }
            explicit
        }
        None => {
            if argv.is_empty() || cpus != DEFAULT_CPUS {
                argv.splice(0..0, ["-p".to_string(), cpus.to_string()]);
            }
            cpus
        }
    };

    if effective > 1 && !copy_input {
        return Err(ValidationError::ParallelismRequiresIsolation(effective));
    }

    Ok(argv)
}

/// Lenient read of the parallelism recorded in an already-effective argv.
pub fn parallelism_from_argv(argv: &[String]) -> Option<u32> {
    explicit_parallelism(argv).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_cpus_with_args_is_not_injected() {
        let argv = effective_argv(&args(&["-n", "-f"]), 1, true).unwrap();
        assert_eq!(argv, args(&["-n", "-f"]));
    }

    #[test]
    fn requested_cpus_are_injected_at_front() {
        let argv = effective_argv(&args(&["-n", "-f"]), 4, true).unwrap();
        assert_eq!(argv, args(&["-p", "4", "-n", "-f"]));
    }

    #[test]
    fn empty_args_get_explicit_single_worker() {
        let argv = effective_argv(&[], 1, false).unwrap();
        assert_eq!(argv, args(&["-p", "1"]));
    }

    #[test]
    fn explicit_flag_conflicting_with_cpus_is_rejected() {
        for flag in ["-p", "--processes", "--processors"] {
            let err = effective_argv(&args(&[flag, "1", "-n"]), 2, true).unwrap_err();
            assert!(matches!(
                err,
                ValidationError::ParallelismConflict { explicit: 1, cpus: 2 }
            ));
            assert!(err.to_string().contains("conflicts"));
        }
    }

    #[test]
    fn inline_flag_conflicting_with_cpus_is_rejected() {
        let err = effective_argv(&args(&["--processes=3"]), 2, true).unwrap_err();
        assert!(matches!(err, ValidationError::ParallelismConflict { .. }));
    }

    #[test]
    fn explicit_flag_matching_cpus_is_kept_verbatim() {
        let argv = effective_argv(&args(&["-n", "--processors", "4"]), 4, true).unwrap();
        assert_eq!(argv, args(&["-n", "--processors", "4"]));
    }

    #[test]
    fn explicit_flag_with_default_cpus_wins() {
        let argv = effective_argv(&args(&["-p", "8"]), 1, true).unwrap();
        assert_eq!(argv, args(&["-p", "8"]));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            effective_argv(&args(&["-n", "-p"]), 1, true).unwrap_err(),
            ValidationError::MissingParallelismValue { .. }
        ));
        assert!(matches!(
            effective_argv(&args(&["-p", "four"]), 1, true).unwrap_err(),
            ValidationError::MalformedParallelism { .. }
        ));
        assert!(matches!(
            effective_argv(&args(&["--processes=x"]), 1, true).unwrap_err(),
            ValidationError::MalformedParallelism { .. }
        ));
    }

    #[test]
    fn parallelism_requires_isolation() {
        let err = effective_argv(&args(&["-n"]), 4, false).unwrap_err();
        assert_eq!(err, ValidationError::ParallelismRequiresIsolation(4));

        let err = effective_argv(&args(&["-p", "2"]), 1, false).unwrap_err();
        assert_eq!(err, ValidationError::ParallelismRequiresIsolation(2));

        assert!(effective_argv(&args(&["-n"]), 1, false).is_ok());
    }

    #[test]
    fn effective_argv_is_deterministic() {
        let input = args(&["-n", "--raxml"]);
        let first = effective_argv(&input, 3, true).unwrap();
        for _ in 0..10 {
            assert_eq!(effective_argv(&input, 3, true).unwrap(), first);
        }
    }

    #[test]
    fn parallelism_from_argv_is_lenient() {
        assert_eq!(parallelism_from_argv(&args(&["-p", "4", "-n"])), Some(4));
        assert_eq!(parallelism_from_argv(&args(&["--processors=2"])), Some(2));
        assert_eq!(parallelism_from_argv(&args(&["-n"])), None);
        assert_eq!(parallelism_from_argv(&args(&["-p"])), None);
        assert_eq!(parallelism_from_argv(&args(&["-p", "x"])), None);
    }
}
