//! In-memory fakes for the host and coverage collaborators (testing only)
//!
//! Provides `RecordingHost` and `FakeDumper`, which satisfy the trait
//! contracts without a real launcher or coverage runtime.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::artifact::CoverageDumper;
use crate::error::DumpError;
use crate::host::{Host, TerminalResult};

// ---------------------------------------------------------------------------
// RecordingHost
// ---------------------------------------------------------------------------

/// Host that keeps every terminal result it receives.
#[derive(Debug)]
pub struct RecordingHost {
    package_name: String,
    results: Mutex<Vec<TerminalResult>>,
    finished: Condvar,
}

impl RecordingHost {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            results: Mutex::new(Vec::new()),
            finished: Condvar::new(),
        }
    }

    pub fn results(&self) -> Vec<TerminalResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn finish_count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    /// Block until the first terminal result arrives, or `timeout` elapses.
    pub fn wait_for_finish(&self, timeout: Duration) -> Option<TerminalResult> {
        let deadline = Instant::now() + timeout;
        let mut results = self.results.lock().unwrap();
        while results.is_empty() {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self.finished.wait_timeout(results, remaining).unwrap();
            results = guard;
        }
        results.first().cloned()
    }
}

impl Host for RecordingHost {
    fn package_name(&self) -> &str {
        &self.package_name
    }

    fn finish(&self, result: TerminalResult) {
        self.results.lock().unwrap().push(result);
        self.finished.notify_all();
    }
}

// ---------------------------------------------------------------------------
// FakeDumper
// ---------------------------------------------------------------------------

/// Coverage dumper that writes a placeholder file, or always fails.
#[derive(Debug, Default)]
pub struct FakeDumper {
    fail: bool,
    calls: Mutex<Vec<PathBuf>>,
}

impl FakeDumper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dumper whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Targets requested so far, in call order.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl CoverageDumper for FakeDumper {
    fn dump(&self, target: &Path) -> Result<(), DumpError> {
        self.calls.lock().unwrap().push(target.to_path_buf());
        if self.fail {
            return Err(DumpError::Failed("fake dumper configured to fail".to_string()));
        }
        fs::write(target, b"coverage")?;
        Ok(())
    }
}
