//! covguard: in-process run controller for instrumented test runs
//!
//! Lives inside the process under test and decides, exactly once, how the run
//! ends. It captures a coverage artifact when the harness sends the stop
//! signal or when the application crashes, appends crash reports to an error
//! log in the report directory, and hands a terminal result back to the host.
//!
//! ## Key Components
//!
//! - `RunController` / `RunHandle`: single-writer actor owning the run state
//! - `SignalChannel`: background task delivering `finish-testing` signals
//! - `ArtifactWriter`: coverage dumps, error-log appends, directory cleanup
//! - `Session`: controller and signal channel wired together
//! - `crash::guard`: turns Rust panics into crash notifications

pub mod artifact;
pub mod config;
pub mod controller;
pub mod crash;
pub mod error;
pub mod fakes;
pub mod host;
pub mod obs;
pub mod record;
pub mod session;
pub mod signal;
#[cfg(unix)]
pub mod socket;
pub mod telemetry;

pub use artifact::{
    artifact_name, resolve_dumper, ArtifactWriter, CommandDumper, CoverageDumper, FnDumper,
    RemovalReport, PREFIX_ONERROR, PREFIX_ONSTOP,
};
pub use config::{PlatformDefaults, RunArguments, RunConfig, ERRORS_FILENAME};
pub use controller::{ControllerEnv, CrashReport, Ready, RunController, RunHandle, RunPhase, RunState};
pub use error::{CovguardError, DumpError, InitError, RecordParseError, Result, SignalError};
pub use host::{parse_terminal_report, Host, ReportHost, ResultCode, TerminalResult};
pub use record::{
    parse_error_log, ComponentDescriptor, ComponentKind, ErrorInfo, ErrorRecord, RECORD_SEPARATOR,
};
pub use session::Session;
pub use signal::{LocalSource, SignalChannel, SignalSender, SignalSource, StopSignal, StopTarget};
#[cfg(unix)]
pub use socket::{send_finish_testing, UnixSocketSource};
pub use telemetry::init_tracing;
