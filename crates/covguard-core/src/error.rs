//! Error taxonomy for the run controller.

use std::path::PathBuf;

/// Fatal startup errors. A run that hits one of these never reaches `Ready`.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("cannot start run: no arguments supplied by the host")]
    MissingArguments,

    #[error("cannot create report directory {path}: {source}")]
    ReportDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot register stop-signal listener: {0}")]
    SignalRegistration(#[from] SignalError),

    #[error("cannot spawn controller worker: {0}")]
    Worker(#[source] std::io::Error),
}

/// Errors raised by signal sources and the signal channel.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("cannot bind signal source at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signal channel is closed")]
    Closed,

    #[error("malformed signal message: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coverage dump failures. Always degraded-mode, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("no coverage dumper is available")]
    Unavailable,

    #[error("coverage dumper failed: {0}")]
    Failed(String),

    #[error("coverage dumper panicked: {0}")]
    Panicked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DumpError {
    /// Hint appended to the diagnostic written into the terminal result.
    pub fn hint(&self) -> &'static str {
        match self {
            DumpError::Unavailable => "Is a coverage dumper configured?",
            _ => "",
        }
    }
}

/// Errors produced while reading the error log text format back.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordParseError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("field {field} has invalid number: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("unexpected line: {0}")]
    UnexpectedLine(String),

    #[error("record is missing its terminator line")]
    Truncated,
}

/// Umbrella error for covguard operations.
#[derive(Debug, thiserror::Error)]
pub enum CovguardError {
    #[error("init error: {0}")]
    Init(#[from] InitError),

    #[error("signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("dump error: {0}")]
    Dump(#[from] DumpError),

    #[error("record parse error: {0}")]
    RecordParse(#[from] RecordParseError),

    #[error("controller worker is no longer running")]
    ControllerGone,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for covguard operations.
pub type Result<T> = std::result::Result<T, CovguardError>;
