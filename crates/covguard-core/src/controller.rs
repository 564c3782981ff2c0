//! Run controller: the single authority over "finish the run now, with what result".
//!
//! The controller is a single-writer actor. One dedicated worker thread owns
//! [`RunState`], the pending result payload and the [`ArtifactWriter`]; every
//! stop signal, crash notification and finish request is a message on one
//! queue. That serialization gives:
//!
//! - crash sequence numbers allocated without gaps or duplicates,
//! - error-log appends that never interleave,
//! - exactly one [`TerminalResult`] per run.
//!
//! State machine: `initialize` yields [`Ready`]; the first finish moves the run
//! to `Finished`, after which stop signals and crash notifications are no-ops
//! (crash notifications still answer with `proceedOnError`).

use crate::artifact::{
    artifact_name, resolve_dumper, ArtifactWriter, CoverageDumper, PREFIX_ONERROR, PREFIX_ONSTOP,
};
use crate::config::{PlatformDefaults, RunArguments, RunConfig};
use crate::error::{CovguardError, DumpError, InitError, Result};
use crate::host::{Host, ResultCode, TerminalResult, REPORT_KEY_STREAM};
use crate::obs;
use crate::record::{ComponentDescriptor, ErrorInfo, ErrorRecord};
use crate::signal::{SignalSender, StopSignal, StopTarget};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle phase of an initialized run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Ready,
    Finished,
}

/// Mutable run state, owned by the controller worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub cancel_requested: bool,
    /// Number of crash records allocated so far; also the next sequence number.
    pub error_count: u64,
    pub finished: bool,
}

impl RunState {
    pub fn phase(&self) -> RunPhase {
        if self.finished {
            RunPhase::Finished
        } else {
            RunPhase::Ready
        }
    }
}

/// A crash as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub source: Option<ComponentDescriptor>,
    pub error: ErrorInfo,
    pub occurred_at: DateTime<Utc>,
}

impl CrashReport {
    pub fn new(source: Option<ComponentDescriptor>, error: ErrorInfo) -> Self {
        Self {
            source,
            error,
            occurred_at: Utc::now(),
        }
    }
}

/// Collaborators the controller is wired with.
#[derive(Clone)]
pub struct ControllerEnv {
    pub host: Arc<dyn Host>,
    pub dumper: Option<Arc<dyn CoverageDumper>>,
    /// Root for the default report directory.
    pub report_root: PathBuf,
}

impl ControllerEnv {
    pub fn new(
        host: Arc<dyn Host>,
        dumper: Option<Arc<dyn CoverageDumper>>,
        report_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host,
            dumper,
            report_root: report_root.into(),
        }
    }

    /// Production wiring: report root and dumper come from the environment.
    pub fn from_env(host: Arc<dyn Host>) -> Self {
        let defaults = PlatformDefaults::from_env(host.package_name());
        Self::new(host, resolve_dumper(), defaults.report_root)
    }

    fn defaults(&self) -> PlatformDefaults {
        PlatformDefaults::new(self.report_root.clone(), self.host.package_name())
    }
}

enum Command {
    Stop(StopSignal),
    Crash {
        report: CrashReport,
        reply: mpsc::Sender<bool>,
    },
    Finish {
        code: ResultCode,
        payload: BTreeMap<String, String>,
    },
    AttachSignal(SignalSender),
    State(mpsc::Sender<RunState>),
    Shutdown(mpsc::Sender<RunState>),
}

/// Cheap, clonable entry point into a running controller.
#[derive(Clone)]
pub struct RunHandle {
    tx: mpsc::Sender<Command>,
    config: Arc<RunConfig>,
    run_id: Arc<str>,
    worker: ThreadId,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Queue a stop signal. Returns immediately.
    pub fn on_stop_signal(&self, signal: StopSignal) {
        if self.tx.send(Command::Stop(signal)).is_err() {
            debug!("controller gone; stop signal dropped");
        }
    }

    /// Report a crash and block until it is logged (and coverage dumped, if
    /// configured).
    ///
    /// Returns `true` when the host should keep running the test, `false` when
    /// the crash should propagate. Never fails: if the controller is gone the
    /// configured `proceedOnError` is returned as is.
    pub fn on_crash_notification(
        &self,
        source: Option<ComponentDescriptor>,
        error: ErrorInfo,
    ) -> bool {
        self.report_crash(CrashReport::new(source, error))
    }

    /// Same as [`RunHandle::on_crash_notification`] for callers on an async
    /// runtime; the wait happens on the blocking pool.
    pub async fn on_crash_notification_async(
        &self,
        source: Option<ComponentDescriptor>,
        error: ErrorInfo,
    ) -> bool {
        let handle = self.clone();
        let report = CrashReport::new(source, error);
        let proceed = self.config.proceed_on_error;
        tokio::task::spawn_blocking(move || handle.report_crash(report))
            .await
            .unwrap_or(proceed)
    }

    /// Report a crash with an explicit timestamp.
    pub fn report_crash(&self, report: CrashReport) -> bool {
        let proceed = self.config.proceed_on_error;

        if thread::current().id() == self.worker {
            // The worker cannot wait on its own queue.
            warn!("crash reported from the controller worker itself; not recorded");
            return proceed;
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        let command = Command::Crash {
            report,
            reply: reply_tx,
        };
        if self.tx.send(command).is_err() {
            debug!("controller gone; crash not recorded");
            return proceed;
        }
        reply_rx.recv().unwrap_or(proceed)
    }

    /// Request the run to finish. Ignored if it already has.
    pub fn finish(&self, code: ResultCode, payload: BTreeMap<String, String>) {
        if self.tx.send(Command::Finish { code, payload }).is_err() {
            debug!("controller gone; finish request dropped");
        }
    }

    /// Let the controller release the signal channel once the run finishes.
    pub fn attach_signal_channel(&self, sender: SignalSender) {
        if let Err(mpsc::SendError(Command::AttachSignal(sender))) =
            self.tx.send(Command::AttachSignal(sender))
        {
            sender.terminate_now();
        }
    }

    /// Snapshot of the run state, or `None` once the worker has stopped.
    pub fn state(&self) -> Option<RunState> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx.send(Command::State(reply_tx)).ok()?;
        reply_rx.recv().ok()
    }
}

impl StopTarget for RunHandle {
    fn on_stop_signal(&self, signal: StopSignal) {
        RunHandle::on_stop_signal(self, signal);
    }
}

/// An initialized run: the worker is up and accepting events.
pub struct Ready {
    handle: RunHandle,
    worker: JoinHandle<()>,
    /// The report directory did not exist before initialization.
    created_report_dir: bool,
}

impl Ready {
    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &RunConfig {
        self.handle.config()
    }

    /// Drain queued events, stop the worker and return the final state.
    ///
    /// Blocks; call from a blocking context.
    pub fn shutdown(self) -> Result<RunState> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let state = match self.handle.tx.send(Command::Shutdown(reply_tx)) {
            Ok(()) => reply_rx.recv().ok(),
            Err(_) => None,
        };
        if self.worker.join().is_err() {
            warn!("controller worker panicked");
        }
        state.ok_or(CovguardError::ControllerGone)
    }

    /// Stop the worker of a run that never started listening, and remove the
    /// report directory if initialization created it.
    ///
    /// Blocks; call from a blocking context.
    pub fn discard(self) -> Result<RunState> {
        let report_dir = self.config().report_directory.clone();
        let created = self.created_report_dir;
        let state = self.shutdown();
        if created {
            let report = ArtifactWriter::new(None).remove_dir_recursive(&report_dir);
            debug!(
                path = %report_dir.display(),
                removed = report.removed,
                "discarded report directory"
            );
        }
        state
    }
}

/// The actor. Only ever touched by its worker thread.
pub struct RunController {
    run_id: Arc<str>,
    config: Arc<RunConfig>,
    error_log: PathBuf,
    state: RunState,
    results: BTreeMap<String, String>,
    writer: ArtifactWriter,
    host: Arc<dyn Host>,
    signal: Option<SignalSender>,
}

impl RunController {
    /// Validate arguments, prepare the report directory and start the worker.
    ///
    /// On failure the host has already received a `CANCELED` result.
    pub fn initialize(
        arguments: Option<RunArguments>,
        env: ControllerEnv,
    ) -> std::result::Result<Ready, InitError> {
        match Self::try_initialize(arguments, &env) {
            Ok(ready) => Ok(ready),
            Err(err) => {
                obs::emit_run_init_failed(&err);
                env.host.finish(TerminalResult::canceled());
                Err(err)
            }
        }
    }

    fn try_initialize(
        arguments: Option<RunArguments>,
        env: &ControllerEnv,
    ) -> std::result::Result<Ready, InitError> {
        let arguments = arguments.ok_or(InitError::MissingArguments)?;
        let config = RunConfig::from_arguments(&arguments, &env.defaults());
        debug!(?config, "run configuration resolved");

        let created_report_dir = prepare_report_dir(&config.report_directory).map_err(|source| {
            InitError::ReportDirectory {
                path: config.report_directory.clone(),
                source,
            }
        })?;

        let run_id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        let config = Arc::new(config);
        let (tx, rx) = mpsc::channel();

        let controller = RunController {
            run_id: run_id.clone(),
            error_log: config.error_log_path(),
            config: config.clone(),
            state: RunState::default(),
            results: BTreeMap::new(),
            writer: ArtifactWriter::new(env.dumper.clone()),
            host: env.host.clone(),
            signal: None,
        };

        let worker = thread::Builder::new()
            .name("covguard-controller".to_string())
            .spawn(move || controller.run(rx))
            .map_err(InitError::Worker)?;

        let handle = RunHandle {
            tx,
            config,
            run_id,
            worker: worker.thread().id(),
        };
        Ok(Ready {
            handle,
            worker,
            created_report_dir,
        })
    }

    fn run(mut self, commands: mpsc::Receiver<Command>) {
        let _span = obs::RunSpan::enter(&self.run_id);
        obs::emit_run_started(
            &self.run_id,
            self.host.package_name(),
            &self.config.report_directory.display().to_string(),
        );

        for command in commands {
            match command {
                Command::Stop(signal) => self.on_stop_signal(signal),
                Command::Crash { report, reply } => {
                    let proceed = self.on_crash_notification(report);
                    let _ = reply.send(proceed);
                }
                Command::Finish { code, payload } => self.finish(code, payload),
                Command::AttachSignal(sender) => {
                    if self.state.finished {
                        sender.terminate_now();
                    } else {
                        self.signal = Some(sender);
                    }
                }
                Command::State(reply) => {
                    let _ = reply.send(self.state);
                }
                Command::Shutdown(reply) => {
                    let _ = reply.send(self.state);
                    break;
                }
            }
        }

        if let Some(sender) = self.signal.take() {
            sender.terminate_now();
        }
        debug!("controller worker stopped");
    }

    fn on_stop_signal(&mut self, signal: StopSignal) {
        if self.state.finished {
            debug!("stop signal after finish; ignoring");
            return;
        }

        let cancel = signal.cancel();
        obs::emit_stop_signal(&self.run_id, cancel);

        if cancel {
            self.state.cancel_requested = true;
            let report = self
                .writer
                .remove_dir_recursive(&self.config.report_directory);
            info!(
                removed = report.removed,
                failed = report.failed.len(),
                "analysis canceled; report directory removed"
            );
            self.finish(ResultCode::Canceled, BTreeMap::new());
            return;
        }

        if self.config.collect_coverage {
            self.capture_coverage(PREFIX_ONSTOP, signal.received_at);
        }
        self.finish(ResultCode::Ok, BTreeMap::new());
    }

    fn on_crash_notification(&mut self, report: CrashReport) -> bool {
        let proceed = self.config.proceed_on_error;
        if self.state.finished {
            debug!("crash notification after finish; ignoring");
            return proceed;
        }

        let coverage_artifact = if self.config.dump_coverage_on_error {
            self.capture_coverage(PREFIX_ONERROR, report.occurred_at)
        } else {
            None
        };

        let sequence_number = self.state.error_count;
        self.state.error_count += 1;

        let record = ErrorRecord {
            sequence_number,
            timestamp_millis: report.occurred_at.timestamp_millis(),
            coverage_artifact,
            package_name: self.host.package_name().to_string(),
            process_id: std::process::id(),
            source: report.source,
            error: report.error,
        };

        match self.writer.append_error_record(&record, &self.error_log) {
            Ok(()) => obs::emit_crash_recorded(
                &self.run_id,
                sequence_number,
                record
                    .component_kind()
                    .map(|kind| kind.as_str())
                    .unwrap_or("null"),
                record.coverage_artifact.is_some(),
            ),
            Err(err) => error!(
                seq = sequence_number,
                path = %self.error_log.display(),
                error = %err,
                "failed to append crash record"
            ),
        }

        proceed
    }

    /// Dump coverage; `None` if the dump failed.
    fn capture_coverage(&mut self, prefix: &str, at: DateTime<Utc>) -> Option<String> {
        let name = artifact_name(prefix, at);
        let target = self.config.report_directory.join(&name);
        match self.writer.dump_coverage(&target) {
            Ok(()) => Some(name),
            Err(err) => {
                obs::emit_dump_failed(&self.run_id, &name, &err);
                self.results
                    .insert(REPORT_KEY_STREAM.to_string(), dump_diagnostic(&err));
                None
            }
        }
    }

    fn finish(&mut self, code: ResultCode, payload: BTreeMap<String, String>) {
        if self.state.finished {
            debug!(?code, "run already finished; ignoring");
            return;
        }
        self.state.finished = true;

        let mut merged = self.results.clone();
        merged.extend(payload);
        let result = TerminalResult::new(code, merged);

        obs::emit_run_finished(
            &self.run_id,
            &format!("{:?}", code).to_uppercase(),
            self.state.error_count,
        );

        let host = self.host.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| host.finish(result))).is_err() {
            error!("host panicked while receiving the terminal result");
        }

        if let Some(sender) = self.signal.take() {
            sender.terminate_now();
        }
    }
}

/// Create the report directory and check it accepts new files.
///
/// Returns whether the directory had to be created.
fn prepare_report_dir(dir: &Path) -> std::io::Result<bool> {
    let created = !dir.is_dir();
    fs::create_dir_all(dir)?;
    let check = dir.join(format!(".covguard-write-check-{}", Uuid::new_v4()));
    fs::File::create(&check)?;
    fs::remove_file(&check)?;
    Ok(created)
}

fn dump_diagnostic(err: &DumpError) -> String {
    let mut msg = String::from("Failed to generate coverage artifact.");
    let hint = err.hint();
    if !hint.is_empty() {
        msg.push(' ');
        msg.push_str(hint);
    }
    format!("\nError: {} Cause: {}", msg, err)
}
