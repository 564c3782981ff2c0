//! Host termination interface and the terminal result handed to it.
//!
//! The report text mirrors what instrumentation launchers print when a run
//! ends, so existing harness parsers keep working:
//!
//! ```text
//! INSTRUMENTATION_RESULT: stream=
//! Error: Failed to generate coverage artifact.
//! INSTRUMENTATION_CODE: -1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

/// Payload key carrying human-readable diagnostics for the harness.
pub const REPORT_KEY_STREAM: &str = "stream";

const RESULT_PREFIX: &str = "INSTRUMENTATION_RESULT: ";
const CODE_PREFIX: &str = "INSTRUMENTATION_CODE: ";

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultCode {
    Ok,
    Canceled,
}

impl ResultCode {
    /// Launcher status code (`-1` ok, `0` canceled).
    pub fn as_launcher_code(&self) -> i32 {
        match self {
            ResultCode::Ok => -1,
            ResultCode::Canceled => 0,
        }
    }

    pub fn from_launcher_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(ResultCode::Ok),
            0 => Some(ResultCode::Canceled),
            _ => None,
        }
    }
}

/// Final status and payload of a run. Produced exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResult {
    pub code: ResultCode,
    pub payload: BTreeMap<String, String>,
}

impl TerminalResult {
    pub fn new(code: ResultCode, payload: BTreeMap<String, String>) -> Self {
        Self { code, payload }
    }

    pub fn canceled() -> Self {
        Self::new(ResultCode::Canceled, BTreeMap::new())
    }

    /// Diagnostic text under the `stream` key, if any.
    pub fn stream(&self) -> Option<&str> {
        self.payload.get(REPORT_KEY_STREAM).map(String::as_str)
    }

    pub fn render_report(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.payload {
            out.push_str(RESULT_PREFIX);
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out.push_str(&format!(
            "{}{}\n",
            CODE_PREFIX,
            self.code.as_launcher_code()
        ));
        out
    }
}

/// Parse a launcher report back into a [`TerminalResult`].
///
/// Values may span several lines; continuation lines attach to the previous
/// key. Returns `None` when no recognizable `INSTRUMENTATION_CODE` is found.
pub fn parse_terminal_report(text: &str) -> Option<TerminalResult> {
    let mut payload = BTreeMap::new();
    let mut current: Option<(String, String)> = None;
    let mut code = None;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(RESULT_PREFIX) {
            if let Some((key, value)) = current.take() {
                payload.insert(key, value);
            }
            let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
            current = Some((key.trim().to_string(), value.to_string()));
        } else if let Some(rest) = line.strip_prefix(CODE_PREFIX) {
            if let Some((key, value)) = current.take() {
                payload.insert(key, value);
            }
            code = rest
                .trim()
                .parse::<i32>()
                .ok()
                .and_then(ResultCode::from_launcher_code);
            break;
        } else if let Some((_, value)) = current.as_mut() {
            value.push('\n');
            value.push_str(line);
        }
    }

    code.map(|code| TerminalResult::new(code, payload))
}

/// The process orchestrating the run, as seen from inside it.
pub trait Host: Send + Sync {
    /// Name of the package under test.
    fn package_name(&self) -> &str;

    /// Receive the terminal result. Called at most once per run.
    fn finish(&self, result: TerminalResult);
}

/// Host that prints the launcher report to a writer.
pub struct ReportHost<W: Write + Send> {
    package_name: String,
    out: Mutex<W>,
}

impl<W: Write + Send> ReportHost<W> {
    pub fn new(package_name: impl Into<String>, out: W) -> Self {
        Self {
            package_name: package_name.into(),
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send> Host for ReportHost<W> {
    fn package_name(&self) -> &str {
        &self.package_name
    }

    fn finish(&self, result: TerminalResult) {
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(err) = out
            .write_all(result.render_report().as_bytes())
            .and_then(|_| out.flush())
        {
            tracing::error!(error = %err, "failed to write terminal report");
        }
    }
}
