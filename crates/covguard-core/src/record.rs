//! Crash reports and their on-disk text format.
//!
//! Each record is a fixed field-per-line block:
//!
//! ```text
//! ErrorCount: 0
//! Time: 1700000000000
//! CoverageFile: onerror_coverage_1700000000000.ec
//! PackageName: com.example.app
//! ProcessPid: 4242
//! ErrorComponent: Activity
//! ErrorSource: app::screens::MainActivity
//! ShortMsg: panicked at src/main.rs:10:5: boom
//! LongMsg: boom
//! Stack:
//! <multi-line trace>
//! ============================================================
//!
//! ```
//!
//! Single-line fields have line breaks folded into spaces when written. A trace
//! line that would read as the terminator is escaped with a leading `\`.

use crate::error::RecordParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminator line closing every record.
pub const RECORD_SEPARATOR: &str =
    "============================================================";

/// Escape prefix for trace lines that look like the terminator.
const ESCAPE: char = '\\';

/// Rendering of an absent source component.
const NULL_SOURCE: &str = "null";

/// Kind of application component that raised a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    Application,
    Activity,
    Service,
    Receiver,
    Unknown,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Application => "Application",
            ComponentKind::Activity => "Activity",
            ComponentKind::Service => "Service",
            ComponentKind::Receiver => "Receiver",
            ComponentKind::Unknown => "Unknown",
        }
    }

    /// Lenient parse; anything unrecognized maps to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value {
            "Application" => ComponentKind::Application,
            "Activity" => ComponentKind::Activity,
            "Service" => ComponentKind::Service,
            "Receiver" | "BroadcastReceiver" => ComponentKind::Receiver,
            _ => ComponentKind::Unknown,
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The component a crash was reported against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub kind: ComponentKind,

    /// Fully-qualified type name of the component.
    pub type_name: String,
}

impl ComponentDescriptor {
    pub fn new(kind: ComponentKind, type_name: impl Into<String>) -> Self {
        Self {
            kind,
            type_name: single_line(type_name.into()),
        }
    }

    /// Describe a component by its Rust type.
    pub fn of<T: ?Sized>(kind: ComponentKind) -> Self {
        Self::new(kind, std::any::type_name::<T>())
    }
}

/// What went wrong, as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub short_message: String,
    pub long_message: Option<String>,
    pub stack_trace: String,
}

impl ErrorInfo {
    /// Messages are folded onto one line; an empty long message becomes `None`.
    /// Trace line endings are normalized to `\n` and trailing ones trimmed.
    pub fn new(
        short_message: impl Into<String>,
        long_message: Option<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        let stack_trace: String = stack_trace.into();
        Self {
            short_message: single_line(short_message.into()),
            long_message: long_message.map(single_line).filter(|m| !m.is_empty()),
            stack_trace: normalize_line_endings(&stack_trace)
                .trim_end_matches('\n')
                .to_string(),
        }
    }
}

/// One crash report, as appended to the error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub sequence_number: u64,
    pub timestamp_millis: i64,
    pub coverage_artifact: Option<String>,
    pub package_name: String,
    pub process_id: u32,
    pub source: Option<ComponentDescriptor>,
    pub error: ErrorInfo,
}

impl ErrorRecord {
    /// Kind column as written to the log; `None` when no source was reported.
    pub fn component_kind(&self) -> Option<ComponentKind> {
        self.source.as_ref().map(|s| s.kind)
    }

    pub fn render(&self) -> String {
        let component = self
            .source
            .as_ref()
            .map(|s| s.kind.as_str())
            .unwrap_or(NULL_SOURCE);
        let source = self
            .source
            .as_ref()
            .map(|s| s.type_name.as_str())
            .unwrap_or(NULL_SOURCE);

        let mut out = String::new();
        out.push_str(&format!("ErrorCount: {}\n", self.sequence_number));
        out.push_str(&format!("Time: {}\n", self.timestamp_millis));
        push_field(
            &mut out,
            "CoverageFile",
            self.coverage_artifact.as_deref().unwrap_or(""),
        );
        push_field(&mut out, "PackageName", &self.package_name);
        out.push_str(&format!("ProcessPid: {}\n", self.process_id));
        out.push_str(&format!("ErrorComponent: {}\n", component));
        push_field(&mut out, "ErrorSource", source);
        push_field(&mut out, "ShortMsg", &self.error.short_message);
        push_field(
            &mut out,
            "LongMsg",
            self.error.long_message.as_deref().unwrap_or(""),
        );
        out.push_str("Stack:\n");
        for line in normalize_line_endings(&self.error.stack_trace).split('\n') {
            if is_escaped_separator(line) {
                out.push(ESCAPE);
            }
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(RECORD_SEPARATOR);
        out.push_str("\n\n");
        out
    }

    /// Parse a single rendered record.
    pub fn parse(text: &str) -> Result<Self, RecordParseError> {
        let mut lines = text.lines();
        let record = parse_record(&mut lines)?.ok_or(RecordParseError::Truncated)?;
        match lines.find(|line| !line.trim().is_empty()) {
            Some(extra) => Err(RecordParseError::UnexpectedLine(extra.to_string())),
            None => Ok(record),
        }
    }
}

/// Parse a whole error log into its records, in file order.
pub fn parse_error_log(text: &str) -> Result<Vec<ErrorRecord>, RecordParseError> {
    let mut lines = text.lines();
    let mut records = Vec::new();
    while let Some(record) = parse_record(&mut lines)? {
        records.push(record);
    }
    Ok(records)
}

/// Reads the next record; `Ok(None)` when only blank lines remain.
fn parse_record<'a, I>(lines: &mut I) -> Result<Option<ErrorRecord>, RecordParseError>
where
    I: Iterator<Item = &'a str>,
{
    let first = loop {
        match lines.next() {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line,
            None => return Ok(None),
        }
    };

    let sequence_number = parse_number("ErrorCount", field_value(first, "ErrorCount")?)?;
    let timestamp_millis = parse_number("Time", next_field(lines, "Time")?)?;
    let coverage_artifact = Some(next_field(lines, "CoverageFile")?)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let package_name = next_field(lines, "PackageName")?.to_string();
    let process_id = parse_number("ProcessPid", next_field(lines, "ProcessPid")?)?;
    let component = next_field(lines, "ErrorComponent")?;
    let source_name = next_field(lines, "ErrorSource")?;
    let short_message = next_field(lines, "ShortMsg")?.to_string();
    let long_message = Some(next_field(lines, "LongMsg")?)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    match lines.next() {
        Some(line) if line.trim_end() == "Stack:" => {}
        Some(line) => return Err(RecordParseError::UnexpectedLine(line.to_string())),
        None => return Err(RecordParseError::Truncated),
    }

    let mut stack = Vec::new();
    loop {
        match lines.next() {
            Some(RECORD_SEPARATOR) => break,
            Some(line) if line.starts_with(ESCAPE) && is_escaped_separator(line) => {
                stack.push(&line[ESCAPE.len_utf8()..])
            }
            Some(line) => stack.push(line),
            None => return Err(RecordParseError::Truncated),
        }
    }

    let source = (source_name != NULL_SOURCE).then(|| ComponentDescriptor {
        kind: ComponentKind::parse(component),
        type_name: source_name.to_string(),
    });

    Ok(Some(ErrorRecord {
        sequence_number,
        timestamp_millis,
        coverage_artifact,
        package_name,
        process_id,
        source,
        error: ErrorInfo {
            short_message,
            long_message,
            stack_trace: stack.join("\n"),
        },
    }))
}

fn next_field<'a, I>(lines: &mut I, name: &'static str) -> Result<&'a str, RecordParseError>
where
    I: Iterator<Item = &'a str>,
{
    let line = lines.next().ok_or(RecordParseError::Truncated)?;
    field_value(line, name)
}

fn field_value<'a>(line: &'a str, name: &'static str) -> Result<&'a str, RecordParseError> {
    let rest = line
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or(RecordParseError::MissingField(name))?;
    Ok(rest.strip_prefix(' ').unwrap_or(rest))
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    value: &str,
) -> Result<T, RecordParseError> {
    value
        .trim()
        .parse()
        .map_err(|_| RecordParseError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

fn push_field(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(&single_line(value.to_string()));
    out.push('\n');
}

/// The terminator, possibly behind escape prefixes.
fn is_escaped_separator(line: &str) -> bool {
    line.trim_start_matches(ESCAPE) == RECORD_SEPARATOR
}

fn normalize_line_endings(value: &str) -> String {
    if value.contains('\r') {
        value.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        value.to_string()
    }
}

fn single_line(value: String) -> String {
    if value.contains(['\n', '\r']) {
        value.replace("\r\n", " ").replace(['\n', '\r'], " ")
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64) -> ErrorRecord {
        ErrorRecord {
            sequence_number: seq,
            timestamp_millis: 1_700_000_000_123,
            coverage_artifact: Some("onerror_coverage_1700000000123.ec".to_string()),
            package_name: "com.example.app".to_string(),
            process_id: 4242,
            source: Some(ComponentDescriptor::new(
                ComponentKind::Activity,
                "app::screens::MainActivity",
            )),
            error: ErrorInfo::new(
                "panicked at src/main.rs:10:5: boom",
                Some("boom".to_string()),
                "   0: app::main\n   1: std::rt::lang_start",
            ),
        }
    }

    #[test]
    fn test_render_layout() {
        let text = sample(0).render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ErrorCount: 0");
        assert_eq!(lines[1], "Time: 1700000000123");
        assert_eq!(lines[2], "CoverageFile: onerror_coverage_1700000000123.ec");
        assert_eq!(lines[5], "ErrorComponent: Activity");
        assert_eq!(lines[6], "ErrorSource: app::screens::MainActivity");
        assert_eq!(lines[9], "Stack:");
        assert_eq!(lines[12], RECORD_SEPARATOR);
        assert!(text.ends_with(&format!("{RECORD_SEPARATOR}\n\n")));
    }

    #[test]
    fn test_render_without_source_or_coverage() {
        let mut record = sample(3);
        record.source = None;
        record.coverage_artifact = None;
        record.error.long_message = None;
        let text = record.render();
        assert!(text.contains("CoverageFile: \n"));
        assert!(text.contains("ErrorComponent: null\n"));
        assert!(text.contains("ErrorSource: null\n"));
        assert!(text.contains("LongMsg: \n"));
    }

    #[test]
    fn test_parse_recovers_every_field() {
        let record = sample(7);
        assert_eq!(ErrorRecord::parse(&record.render()).unwrap(), record);

        let mut bare = sample(8);
        bare.source = None;
        bare.coverage_artifact = None;
        bare.error = ErrorInfo::new("short", None, "");
        assert_eq!(ErrorRecord::parse(&bare.render()).unwrap(), bare);
    }

    #[test]
    fn test_parse_log_preserves_order() {
        let log: String = (0..3).map(|i| sample(i).render()).collect();
        let records = parse_error_log(&log).unwrap();
        let seqs: Vec<u64> = records.iter().map(|r| r.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_parse_empty_log() {
        assert!(parse_error_log("").unwrap().is_empty());
        assert!(parse_error_log("\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_truncated_record() {
        let text = sample(0).render();
        let cut = &text[..text.find(RECORD_SEPARATOR).unwrap()];
        assert_eq!(parse_error_log(cut), Err(RecordParseError::Truncated));
    }

    #[test]
    fn test_parse_bad_number() {
        let text = sample(0).render().replace("ErrorCount: 0", "ErrorCount: zero");
        assert!(matches!(
            ErrorRecord::parse(&text),
            Err(RecordParseError::InvalidNumber { field: "ErrorCount", .. })
        ));
    }

    #[test]
    fn test_parse_accepts_legacy_receiver_and_stack_header() {
        let text = sample(0)
            .render()
            .replace("ErrorComponent: Activity", "ErrorComponent: BroadcastReceiver")
            .replace("Stack:\n", "Stack: \n");
        let record = ErrorRecord::parse(&text).unwrap();
        assert_eq!(record.component_kind(), Some(ComponentKind::Receiver));
    }

    #[test]
    fn test_error_info_normalizes_lines() {
        let info = ErrorInfo::new("first\nsecond", Some(String::new()), "trace\n\n");
        assert_eq!(info.short_message, "first second");
        assert_eq!(info.long_message, None);
        assert_eq!(info.stack_trace, "trace");
    }

    #[test]
    fn test_crlf_trace_round_trips_as_newlines() {
        let mut record = sample(0);
        record.error = ErrorInfo::new("short", None, "frame a\r\nframe b\rframe c\r\n");
        assert_eq!(record.error.stack_trace, "frame a\nframe b\nframe c");
        assert_eq!(ErrorRecord::parse(&record.render()).unwrap(), record);
    }

    #[test]
    fn test_separator_inside_trace_is_escaped() {
        let trace = format!(
            "before\n{sep}\n\\{sep}\n\\\\{sep}\nafter",
            sep = RECORD_SEPARATOR
        );
        let records: Vec<ErrorRecord> = (0..2)
            .map(|i| {
                let mut record = sample(i);
                record.error = ErrorInfo::new("short", None, trace.clone());
                record
            })
            .collect();
        let log: String = records.iter().map(ErrorRecord::render).collect();

        let parsed = parse_error_log(&log).unwrap();
        assert_eq!(parsed, records);
        assert_eq!(parsed[1].error.stack_trace, trace);
    }

    #[test]
    fn test_render_folds_single_line_fields() {
        let mut record = sample(0);
        record.package_name = "a\nb".to_string();
        record.coverage_artifact = Some("x\r\ny.ec".to_string());
        record.source = Some(ComponentDescriptor {
            kind: ComponentKind::Service,
            type_name: "app::\nSync".to_string(),
        });
        record.error.short_message = "one\ntwo".to_string();
        record.error.long_message = Some("three\rfour".to_string());

        let parsed = ErrorRecord::parse(&record.render()).unwrap();
        assert_eq!(parsed.package_name, "a b");
        assert_eq!(parsed.coverage_artifact.as_deref(), Some("x y.ec"));
        assert_eq!(parsed.source.unwrap().type_name, "app:: Sync");
        assert_eq!(parsed.error.short_message, "one two");
        assert_eq!(parsed.error.long_message.as_deref(), Some("three four"));
        assert_eq!(parsed.process_id, 4242);
    }

    #[test]
    fn test_component_descriptor_of_type() {
        struct Checkout;
        let desc = ComponentDescriptor::of::<Checkout>(ComponentKind::Service);
        assert_eq!(desc.kind, ComponentKind::Service);
        assert!(desc.type_name.ends_with("Checkout"));
    }
}
