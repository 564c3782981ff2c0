//! Run configuration: host-supplied arguments resolved against platform defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Argument key: collect coverage when the stop signal arrives.
pub const KEY_COVERAGE: &str = "coverage";
/// Argument key: absorb crashes instead of letting them propagate.
pub const KEY_PROCEED_ON_ERROR: &str = "proceedOnError";
/// Argument key: dump coverage whenever a crash is reported.
pub const KEY_COVERAGE_ON_ERROR: &str = "generateCoverageReportOnError";
/// Argument key: report directory override.
pub const KEY_REPORT_DIR: &str = "coverageDir";

/// Name of the append-only crash log inside the report directory.
pub const ERRORS_FILENAME: &str = "errors.txt";

/// Environment variable overriding the platform default report root.
pub const REPORT_ROOT_ENV: &str = "COVGUARD_REPORT_ROOT";

/// Raw arguments as delivered by the host (`-e key value` pairs).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArguments(BTreeMap<String, String>);

impl RunArguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// `true` only for a value equal to "true" ignoring ASCII case.
    /// An absent key yields `default`.
    fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => value.trim().eq_ignore_ascii_case("true"),
            None => default,
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RunArguments {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Values the platform supplies when the host leaves them unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDefaults {
    /// Root under which per-package report directories are created.
    pub report_root: PathBuf,

    /// Name of the package under test.
    pub package_name: String,
}

impl PlatformDefaults {
    pub fn new(report_root: impl Into<PathBuf>, package_name: impl Into<String>) -> Self {
        Self {
            report_root: report_root.into(),
            package_name: package_name.into(),
        }
    }

    /// Resolve the report root from `COVGUARD_REPORT_ROOT`, falling back to
    /// `<temp dir>/covguard`.
    pub fn from_env(package_name: impl Into<String>) -> Self {
        let report_root = std::env::var_os(REPORT_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("covguard"));
        Self::new(report_root, package_name)
    }

    fn default_report_dir(&self) -> PathBuf {
        self.report_root.join(&self.package_name)
    }
}

/// Immutable run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub collect_coverage: bool,
    pub proceed_on_error: bool,
    pub dump_coverage_on_error: bool,
    pub report_directory: PathBuf,
}

impl RunConfig {
    pub fn from_arguments(arguments: &RunArguments, defaults: &PlatformDefaults) -> Self {
        let report_directory = arguments
            .get(KEY_REPORT_DIR)
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| defaults.default_report_dir());

        Self {
            collect_coverage: arguments.flag(KEY_COVERAGE, true),
            proceed_on_error: arguments.flag(KEY_PROCEED_ON_ERROR, false),
            dump_coverage_on_error: arguments.flag(KEY_COVERAGE_ON_ERROR, true),
            report_directory,
        }
    }

    /// Location of the crash log.
    pub fn error_log_path(&self) -> PathBuf {
        self.report_directory.join(ERRORS_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> PlatformDefaults {
        PlatformDefaults::new("/data/reports", "com.example.app")
    }

    #[test]
    fn test_defaults_when_arguments_empty() {
        let config = RunConfig::from_arguments(&RunArguments::new(), &defaults());
        assert!(config.collect_coverage);
        assert!(!config.proceed_on_error);
        assert!(config.dump_coverage_on_error);
        assert_eq!(
            config.report_directory,
            PathBuf::from("/data/reports/com.example.app")
        );
        assert_eq!(
            config.error_log_path(),
            PathBuf::from("/data/reports/com.example.app/errors.txt")
        );
    }

    #[test]
    fn test_flags_parse_case_insensitively() {
        let args = RunArguments::new()
            .with(KEY_COVERAGE, "FALSE")
            .with(KEY_PROCEED_ON_ERROR, "True")
            .with(KEY_COVERAGE_ON_ERROR, "false");
        let config = RunConfig::from_arguments(&args, &defaults());
        assert!(!config.collect_coverage);
        assert!(config.proceed_on_error);
        assert!(!config.dump_coverage_on_error);
    }

    #[test]
    fn test_present_but_garbage_flag_is_false() {
        let args = RunArguments::new().with(KEY_COVERAGE, "yes");
        let config = RunConfig::from_arguments(&args, &defaults());
        assert!(!config.collect_coverage);
    }

    #[test]
    fn test_explicit_report_dir() {
        let args: RunArguments = [(KEY_REPORT_DIR, "/tmp/elsewhere")].into_iter().collect();
        let config = RunConfig::from_arguments(&args, &defaults());
        assert_eq!(config.report_directory, PathBuf::from("/tmp/elsewhere"));
    }

    #[test]
    fn test_blank_report_dir_falls_back_to_default() {
        let args = RunArguments::new().with(KEY_REPORT_DIR, "  ");
        let config = RunConfig::from_arguments(&args, &defaults());
        assert_eq!(
            config.report_directory,
            PathBuf::from("/data/reports/com.example.app")
        );
    }

    #[test]
    fn test_config_serializes_camel_case() {
        let config = RunConfig::from_arguments(&RunArguments::new(), &defaults());
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["collectCoverage"], true);
        assert_eq!(json["proceedOnError"], false);
    }
}
