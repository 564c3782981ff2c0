//! Structured observability hooks for the run lifecycle.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - Emission functions for key lifecycle events: start, stop signal, crash
//!   recorded, coverage dump failure, finish
//!
//! Events are emitted at `info!` level unless noted (filter with `RUST_LOG`).

use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("7f3c...");
/// // every event below carries run_id = "7f3c..."
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run_id.
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("covguard.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: run initialized and ready.
pub fn emit_run_started(run_id: &str, package_name: &str, report_dir: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        package_name = %package_name,
        report_dir = %report_dir,
    );
}

/// Emit event: startup failed; the run will never reach `Ready` (error level).
pub fn emit_run_init_failed(error: &dyn std::fmt::Display) {
    tracing::error!(event = "run.init_failed", error = %error);
}

/// Emit event: external stop signal accepted.
pub fn emit_stop_signal(run_id: &str, cancel: bool) {
    info!(event = "run.stop_signal", run_id = %run_id, cancel = cancel);
}

/// Emit event: crash record appended to the error log.
pub fn emit_crash_recorded(run_id: &str, seq: u64, component: &str, coverage_captured: bool) {
    info!(
        event = "run.crash_recorded",
        run_id = %run_id,
        seq = seq,
        component = %component,
        coverage_captured = coverage_captured,
    );
}

/// Emit event: coverage dump failed (warning level).
pub fn emit_dump_failed(run_id: &str, artifact: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "coverage.dump_failed",
        run_id = %run_id,
        artifact = %artifact,
        error = %error,
    );
}

/// Emit event: run finished with its terminal code.
pub fn emit_run_finished(run_id: &str, code: &str, error_count: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        code = %code,
        error_count = error_count,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
    }

    #[traced_test]
    #[test]
    fn test_run_finished_event_carries_code() {
        emit_run_finished("run-42", "CANCELED", 3);
        assert!(logs_contain("run.finished"));
        assert!(logs_contain("CANCELED"));
    }

    #[traced_test]
    #[test]
    fn test_dump_failed_is_warning() {
        emit_dump_failed("run-42", "onstop_coverage_1.ec", &"no dumper");
        assert!(logs_contain("WARN"));
        assert!(logs_contain("onstop_coverage_1.ec"));
    }
}
