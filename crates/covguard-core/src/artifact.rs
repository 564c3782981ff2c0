//! Artifact writer: coverage dumps, the crash log, and report-directory cleanup.
//!
//! Pure I/O. Coordination lives in the controller.

use crate::error::DumpError;
use crate::record::ErrorRecord;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Prefix of artifacts captured when the stop signal arrives.
pub const PREFIX_ONSTOP: &str = "onstop";
/// Prefix of artifacts captured when a crash is reported.
pub const PREFIX_ONERROR: &str = "onerror";

/// Environment variable naming the external dump command.
pub const DUMPER_ENV: &str = "COVGUARD_COVERAGE_DUMPER";

/// `<prefix>_coverage_<epoch millis>.ec`
pub fn artifact_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}_coverage_{}.ec", prefix, at.timestamp_millis())
}

/// External capability that writes a coverage artifact to `target`.
pub trait CoverageDumper: Send + Sync {
    fn dump(&self, target: &Path) -> Result<(), DumpError>;
}

/// Dumper backed by a closure, for hosts that own their coverage runtime.
pub struct FnDumper<F>(F);

impl<F> FnDumper<F>
where
    F: Fn(&Path) -> Result<(), DumpError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> CoverageDumper for FnDumper<F>
where
    F: Fn(&Path) -> Result<(), DumpError> + Send + Sync,
{
    fn dump(&self, target: &Path) -> Result<(), DumpError> {
        (self.0)(target)
    }
}

/// Dumper that shells out; the target path is appended as the last argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDumper {
    program: String,
    args: Vec<String>,
}

impl CommandDumper {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. `None` if it is blank.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// Read the command from `COVGUARD_COVERAGE_DUMPER`.
    pub fn from_env() -> Option<Self> {
        std::env::var(DUMPER_ENV)
            .ok()
            .and_then(|line| Self::parse(&line))
    }
}

impl CoverageDumper for CommandDumper {
    fn dump(&self, target: &Path) -> Result<(), DumpError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(target)
            .output()?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("{} exited with {}", self.program, output.status)
        } else {
            format!("{} exited with {}: {}", self.program, output.status, stderr)
        };
        Err(DumpError::Failed(detail))
    }
}

/// Resolve the production dumper at startup. `None` means degraded mode.
pub fn resolve_dumper() -> Option<Arc<dyn CoverageDumper>> {
    match CommandDumper::from_env() {
        Some(dumper) => {
            info!(program = %dumper.program, "coverage dumper resolved");
            Some(Arc::new(dumper))
        }
        None => {
            warn!(
                env = DUMPER_ENV,
                "no coverage dumper configured; coverage capture will be skipped"
            );
            None
        }
    }
}

/// Outcome of a best-effort recursive delete.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemovalReport {
    /// Number of files and directories removed.
    pub removed: usize,

    /// Entries that could not be removed.
    pub failed: Vec<PathBuf>,
}

impl RemovalReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Writes artifacts into the report directory.
pub struct ArtifactWriter {
    dumper: Option<Arc<dyn CoverageDumper>>,
    log_lock: Mutex<()>,
}

impl ArtifactWriter {
    pub fn new(dumper: Option<Arc<dyn CoverageDumper>>) -> Self {
        Self {
            dumper,
            log_lock: Mutex::new(()),
        }
    }

    pub fn has_dumper(&self) -> bool {
        self.dumper.is_some()
    }

    /// Ask the collaborator for a coverage artifact at `target`.
    ///
    /// Blocks until the dump completes. Failures are logged and returned, a
    /// panicking collaborator included.
    pub fn dump_coverage(&self, target: &Path) -> Result<(), DumpError> {
        let result = match &self.dumper {
            None => Err(DumpError::Unavailable),
            Some(dumper) => panic::catch_unwind(AssertUnwindSafe(|| dumper.dump(target)))
                .unwrap_or_else(|payload| Err(DumpError::Panicked(panic_message(&*payload)))),
        };

        match &result {
            Ok(()) => debug!(target = %target.display(), "coverage artifact written"),
            Err(err) => warn!(
                target = %target.display(),
                error = %err,
                "failed to generate coverage artifact"
            ),
        }
        result
    }

    /// Append `record` to the log at `log_path`, creating the file if needed.
    ///
    /// Open, write and close happen under one lock so concurrent callers never
    /// interleave partial records.
    pub fn append_error_record(&self, record: &ErrorRecord, log_path: &Path) -> io::Result<()> {
        let _guard = self.log_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        file.write_all(record.render().as_bytes())?;
        file.flush()
    }

    /// Delete `path` and everything below it, continuing past failures.
    pub fn remove_dir_recursive(&self, path: &Path) -> RemovalReport {
        let mut report = RemovalReport::default();
        remove_entry(path, &mut report);
        if !report.is_clean() {
            warn!(
                path = %path.display(),
                failed = report.failed.len(),
                "report directory only partially removed"
            );
        }
        report
    }
}

fn remove_entry(path: &Path, report: &mut RemovalReport) {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot stat entry");
            report.failed.push(path.to_path_buf());
            return;
        }
    };

    let removed = if metadata.is_dir() {
        match fs::read_dir(path) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok(entry) => remove_entry(&entry.path(), report),
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "cannot read entry")
                        }
                    }
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "cannot list directory"),
        }
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };

    match removed {
        Ok(()) => report.removed += 1,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot remove entry");
            report.failed.push(path.to_path_buf());
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ComponentDescriptor, ComponentKind, ErrorInfo};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(seq: u64) -> ErrorRecord {
        ErrorRecord {
            sequence_number: seq,
            timestamp_millis: 1_000,
            coverage_artifact: None,
            package_name: "pkg".to_string(),
            process_id: 1,
            source: Some(ComponentDescriptor::new(ComponentKind::Service, "pkg::Sync")),
            error: ErrorInfo::new("boom", None, "trace"),
        }
    }

    #[test]
    fn test_artifact_name() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            artifact_name(PREFIX_ONSTOP, at),
            "onstop_coverage_1700000000123.ec"
        );
        assert_eq!(
            artifact_name(PREFIX_ONERROR, at),
            "onerror_coverage_1700000000123.ec"
        );
    }

    #[test]
    fn test_command_dumper_parse() {
        let dumper = CommandDumper::parse("  cov-dump --merge  ").unwrap();
        assert_eq!(dumper, CommandDumper::new("cov-dump", vec!["--merge".to_string()]));
        assert!(CommandDumper::parse("   ").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_dumper_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.ec");
        let dumper = CommandDumper::new("touch", vec![]);
        dumper.dump(&target).unwrap();
        assert!(target.exists());

        let failing = CommandDumper::new("false", vec![]);
        assert!(matches!(failing.dump(&target), Err(DumpError::Failed(_))));
    }

    #[test]
    fn test_dump_without_dumper_is_unavailable() {
        let writer = ArtifactWriter::new(None);
        assert!(!writer.has_dumper());
        let err = writer.dump_coverage(Path::new("/tmp/x.ec")).unwrap_err();
        assert!(matches!(err, DumpError::Unavailable));
    }

    #[test]
    fn test_dump_catches_panicking_dumper() {
        let dumper = FnDumper::new(|_: &Path| -> Result<(), DumpError> { panic!("dumper exploded") });
        let writer = ArtifactWriter::new(Some(Arc::new(dumper)));
        let err = writer.dump_coverage(Path::new("/tmp/x.ec")).unwrap_err();
        match err {
            DumpError::Panicked(msg) => assert!(msg.contains("dumper exploded")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dump_delegates_to_dumper() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let dumper = FnDumper::new(move |_: &Path| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let writer = ArtifactWriter::new(Some(Arc::new(dumper)));
        writer.dump_coverage(Path::new("/tmp/x.ec")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_append_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("errors.txt");
        let writer = ArtifactWriter::new(None);

        writer.append_error_record(&record(0), &log).unwrap();
        writer.append_error_record(&record(1), &log).unwrap();

        let text = fs::read_to_string(&log).unwrap();
        assert_eq!(text, format!("{}{}", record(0).render(), record(1).render()));
    }

    #[test]
    fn test_append_surfaces_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("missing").join("errors.txt");
        let writer = ArtifactWriter::new(None);
        assert!(writer.append_error_record(&record(0), &log).is_err());
    }

    #[test]
    fn test_remove_dir_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("report");
        fs::create_dir_all(root.join("nested/deeper")).unwrap();
        fs::write(root.join("errors.txt"), "x").unwrap();
        fs::write(root.join("nested/a.ec"), "x").unwrap();
        fs::write(root.join("nested/deeper/b.ec"), "x").unwrap();

        let report = ArtifactWriter::new(None).remove_dir_recursive(&root);
        assert!(report.is_clean());
        assert_eq!(report.removed, 6);
        assert!(!root.exists());
    }

    #[test]
    fn test_remove_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let report = ArtifactWriter::new(None).remove_dir_recursive(&dir.path().join("absent"));
        assert_eq!(report, RemovalReport::default());
    }
}
