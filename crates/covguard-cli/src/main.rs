//! covguard - run controller CLI
//!
//! The `covguard` command hosts a run controller in-process and talks to it
//! from the harness side.
//!
//! ## Commands
//!
//! - `host`: run a controller until the stop signal arrives, then print the
//!   terminal report
//! - `finish`: send the `finish-testing` stop signal to a hosted run
//! - `errors`: read an error log back
//! - `result`: read a terminal report back

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use covguard_core::{
    parse_error_log, parse_terminal_report, CommandDumper, ControllerEnv, CoverageDumper,
    ErrorRecord, Host, ReportHost, ResultCode, RunArguments, RunState, TerminalResult,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "covguard")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "In-process run controller for instrumented test runs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a run controller and print the terminal report when it finishes
    Host {
        /// Socket to listen on for the stop signal
        #[arg(short, long)]
        socket: PathBuf,

        /// Package under test (names the default report directory)
        #[arg(short, long, default_value = "covguard.app")]
        package: String,

        /// Run argument, as `-e KEY VALUE` (repeatable)
        #[arg(short = 'e', long = "extra", num_args = 2, value_names = ["KEY", "VALUE"])]
        extras: Vec<String>,

        /// Command that writes a coverage artifact to the path appended to it
        #[arg(long)]
        dump_command: Option<String>,
    },

    /// Send the stop signal to a hosted run
    Finish {
        /// Socket the hosted run listens on
        #[arg(short, long)]
        socket: PathBuf,

        /// Cancel analysis: delete the report directory and finish CANCELED
        #[arg(long)]
        cancel: bool,
    },

    /// Show the crash records in an error log
    Errors {
        /// Path to errors.txt
        file: PathBuf,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a terminal report
    Result {
        /// File holding the INSTRUMENTATION_RESULT / INSTRUMENTATION_CODE lines
        file: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the terminal report
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    covguard_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Host {
            socket,
            package,
            extras,
            dump_command,
        } => {
            let host = Arc::new(ReportHost::new(package, std::io::stdout()));
            let state = cmd_host(host, &socket, &extras, dump_command.as_deref()).await?;
            info!(
                errors = state.error_count,
                canceled = state.cancel_requested,
                "run complete"
            );
            Ok(())
        }
        Commands::Finish { socket, cancel } => cmd_finish(&socket, cancel).await,
        Commands::Errors { file, json } => {
            let mut out = std::io::stdout().lock();
            cmd_errors(&file, json, &mut out)
        }
        Commands::Result { file, json } => {
            let mut out = std::io::stdout().lock();
            cmd_result(&file, json, &mut out)
        }
    }
}

/// Turn the flat `-e KEY VALUE` list into run arguments.
fn run_arguments(extras: &[String]) -> RunArguments {
    extras
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

fn controller_env(host: Arc<dyn Host>, dump_command: Option<&str>) -> Result<ControllerEnv> {
    let mut env = ControllerEnv::from_env(host);
    if let Some(line) = dump_command {
        let dumper = CommandDumper::parse(line).context("--dump-command is empty")?;
        env.dumper = Some(Arc::new(dumper) as Arc<dyn CoverageDumper>);
    }
    if env.dumper.is_none() {
        warn!("no coverage dumper configured; artifacts will not be written");
    }
    Ok(env)
}

/// Host a run until it finishes. Ctrl-C finishes it as canceled.
#[cfg(unix)]
async fn cmd_host(
    host: Arc<dyn Host>,
    socket: &Path,
    extras: &[String],
    dump_command: Option<&str>,
) -> Result<RunState> {
    use covguard_core::{Session, UnixSocketSource};

    let env = controller_env(host, dump_command)?;
    let session = Session::start(
        Some(run_arguments(extras)),
        env,
        Box::new(UnixSocketSource::new(socket)),
    )
    .await
    .context("Failed to start run")?;

    info!(
        run_id = session.handle().run_id(),
        report_dir = %session.config().report_directory.display(),
        socket = %socket.display(),
        "waiting for finish-testing"
    );

    let handle = session.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; finishing run as canceled");
            handle.finish(ResultCode::Canceled, BTreeMap::new());
        }
    });

    let state = session.wait().await.context("Run did not shut down cleanly")?;
    interrupt.abort();
    Ok(state)
}

#[cfg(not(unix))]
async fn cmd_host(
    _host: Arc<dyn Host>,
    _socket: &Path,
    _extras: &[String],
    _dump_command: Option<&str>,
) -> Result<RunState> {
    anyhow::bail!("socket signal delivery is only supported on unix")
}

/// Deliver `finish-testing` to a hosted run.
#[cfg(unix)]
async fn cmd_finish(socket: &Path, cancel: bool) -> Result<()> {
    covguard_core::send_finish_testing(socket, cancel.then_some(true))
        .await
        .with_context(|| format!("Failed to signal run at {}", socket.display()))?;
    println!("Sent finish-testing (cancel: {})", cancel);
    Ok(())
}

#[cfg(not(unix))]
async fn cmd_finish(_socket: &Path, _cancel: bool) -> Result<()> {
    anyhow::bail!("socket signal delivery is only supported on unix")
}

/// Print the records of an error log
fn cmd_errors(file: &Path, json: bool, out: &mut impl Write) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read error log {}", file.display()))?;
    let records = parse_error_log(&text).context("Malformed error log")?;

    if json {
        serde_json::to_writer_pretty(&mut *out, &records)?;
        writeln!(out)?;
        return Ok(());
    }

    if records.is_empty() {
        writeln!(out, "No crashes recorded")?;
        return Ok(());
    }

    for record in &records {
        write_record_summary(out, record)?;
    }
    writeln!(out, "{} crash(es)", records.len())?;
    Ok(())
}

fn write_record_summary(out: &mut impl Write, record: &ErrorRecord) -> Result<()> {
    let component = record
        .source
        .as_ref()
        .map(|s| format!("{} {}", s.kind, s.type_name))
        .unwrap_or_else(|| "null".to_string());
    writeln!(out, "#{} at {}", record.sequence_number, record.timestamp_millis)?;
    writeln!(out, "  component: {}", component)?;
    writeln!(out, "  error:     {}", record.error.short_message)?;
    if let Some(artifact) = &record.coverage_artifact {
        writeln!(out, "  coverage:  {}", artifact)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct ResultView<'a> {
    code: ResultCode,
    launcher_code: i32,
    payload: &'a BTreeMap<String, String>,
}

/// Print a terminal report
fn cmd_result(file: &Path, json: bool, out: &mut impl Write) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read report {}", file.display()))?;
    let result: TerminalResult =
        parse_terminal_report(&text).context("No INSTRUMENTATION_CODE line found")?;

    if json {
        let view = ResultView {
            code: result.code,
            launcher_code: result.code.as_launcher_code(),
            payload: &result.payload,
        };
        serde_json::to_writer_pretty(&mut *out, &view)?;
        writeln!(out)?;
        return Ok(());
    }

    writeln!(
        out,
        "Result: {:?} ({})",
        result.code,
        result.code.as_launcher_code()
    )?;
    for (key, value) in &result.payload {
        writeln!(out, "  {}: {}", key, value.trim())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Writer the test can read back after the host is done with it.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_cli_parses_extras_as_pairs() {
        let cli = Cli::try_parse_from([
            "covguard",
            "host",
            "--socket",
            "/tmp/c.sock",
            "-e",
            "coverage",
            "false",
            "-e",
            "proceedOnError",
            "true",
        ])
        .expect("parse");

        let Commands::Host { extras, .. } = cli.command else {
            panic!("expected host command");
        };
        let args = run_arguments(&extras);
        assert_eq!(args.get("coverage"), Some("false"));
        assert_eq!(args.get("proceedOnError"), Some("true"));
    }

    #[test]
    fn test_empty_dump_command_is_rejected() {
        let host: Arc<dyn Host> = Arc::new(ReportHost::new("pkg", Vec::new()));
        assert!(controller_env(host, Some("   ")).is_err());
    }

    #[test]
    fn test_errors_command_text_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.txt");
        let record = ErrorRecord {
            sequence_number: 0,
            timestamp_millis: 1_700_000_000_000,
            coverage_artifact: Some("onerror_coverage_1700000000000.ec".to_string()),
            package_name: "pkg".to_string(),
            process_id: 42,
            source: None,
            error: covguard_core::ErrorInfo::new("boom", None, "frame"),
        };
        std::fs::write(&path, record.render()).unwrap();

        let mut text = Vec::new();
        cmd_errors(&path, false, &mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("#0 at 1700000000000"));
        assert!(text.contains("component: null"));
        assert!(text.contains("1 crash(es)"));

        let mut json = Vec::new();
        cmd_errors(&path, true, &mut json).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed[0]["sequence_number"], 0);
        assert_eq!(parsed[0]["process_id"], 42);
    }

    #[test]
    fn test_result_command_reads_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let mut payload = BTreeMap::new();
        payload.insert("stream".to_string(), "\nError: dump failed".to_string());
        let report = TerminalResult::new(ResultCode::Ok, payload).render_report();
        std::fs::write(&path, report).unwrap();

        let mut out = Vec::new();
        cmd_result(&path, true, &mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["code"], "OK");
        assert_eq!(parsed["launcher_code"], -1);
        assert_eq!(parsed["payload"]["stream"], "\nError: dump failed");
    }

    #[test]
    fn test_result_command_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "hello\n").unwrap();
        let mut out = Vec::new();
        assert!(cmd_result(&path, false, &mut out).is_err());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_host_and_finish_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("covguard.sock");
        let report_dir = dir.path().join("reports");
        let buf = SharedBuf::default();
        let host: Arc<dyn Host> = Arc::new(ReportHost::new("pkg", buf.clone()));
        let extras = vec![
            "coverageDir".to_string(),
            report_dir.display().to_string(),
            "coverage".to_string(),
            "false".to_string(),
        ];

        let hosted = {
            let socket = socket.clone();
            tokio::spawn(async move { cmd_host(host, &socket, &extras, Some("true")).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !socket.exists() {
            assert!(tokio::time::Instant::now() < deadline, "socket never bound");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cmd_finish(&socket, true).await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), hosted)
            .await
            .expect("host should exit")
            .unwrap()
            .unwrap();
        assert!(state.cancel_requested);
        assert!(!report_dir.exists());

        let result = parse_terminal_report(&buf.text()).expect("report printed");
        assert_eq!(result.code, ResultCode::Canceled);
    }
}
