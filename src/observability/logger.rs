//! Structured JSON logger for the sync engine
//!
//! Every call writes exactly one JSON object on one line: `event`, then
//! `severity`, then the caller's fields sorted by key. ERROR lines go to
//! stderr, everything else to stdout. Nothing is buffered.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Per-event detail (routing, stale drops)
    Trace = 0,
    Info = 1,
    /// Recoverable issues
    Warn = 2,
    /// Operation failures
    Error = 3,
    /// Threshold only; nothing is logged at this level
    Off = 4,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Off => "OFF",
        }
    }

    /// Parse a config-style level name (case-insensitive)
    pub fn parse(level: &str) -> Option<Self> {
        match level.to_ascii_lowercase().as_str() {
            "trace" => Some(Severity::Trace),
            "info" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warn),
            "error" => Some(Severity::Error),
            "off" | "none" => Some(Severity::Off),
            _ => None,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Severity::Trace,
            1 => Severity::Info,
            2 => Severity::Warn,
            3 => Severity::Error,
            _ => Severity::Off,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One log line
#[derive(Serialize)]
struct LogRecord<'a> {
    event: &'a str,
    severity: Severity,
    #[serde(flatten)]
    fields: BTreeMap<&'a str, &'a str>,
}

impl<'a> LogRecord<'a> {
    fn new(severity: Severity, event: &'a str, fields: &[(&'a str, &'a str)]) -> Self {
        let fields = fields
            .iter()
            .filter(|(key, _)| *key != "event" && *key != "severity")
            .copied()
            .collect();
        Self {
            event,
            severity,
            fields,
        }
    }

    fn write_line<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut line = serde_json::to_vec(self).map_err(io::Error::from)?;
        line.push(b'\n');
        writer.write_all(&line)?;
        writer.flush()
    }
}

static MIN_SEVERITY: AtomicU8 = AtomicU8::new(Severity::Info as u8);

/// Process-wide structured logger
pub struct Logger;

impl Logger {
    /// Set the process-wide minimum severity. Lower severities are discarded.
    pub fn set_min_severity(severity: Severity) {
        MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
    }

    pub fn min_severity() -> Severity {
        Severity::from_u8(MIN_SEVERITY.load(Ordering::Relaxed))
    }

    fn enabled(severity: Severity) -> bool {
        severity != Severity::Off && severity >= Self::min_severity()
    }

    /// Log an event with the given severity and fields
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if !Self::enabled(severity) {
            return;
        }
        let record = LogRecord::new(severity, event, fields);
        // A logger with nowhere to write has nobody to report to
        let _ = if severity >= Severity::Error {
            record.write_line(&mut io::stderr().lock())
        } else {
            record.write_line(&mut io::stdout().lock())
        };
    }

    pub fn trace(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Trace, event, fields);
    }

    pub fn info(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Info, event, fields);
    }

    pub fn warn(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Warn, event, fields);
    }

    /// Log at ERROR level to stderr
    pub fn error(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Error, event, fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let mut buffer = Vec::new();
        LogRecord::new(severity, event, fields)
            .write_line(&mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("INFO"), Some(Severity::Info));
        assert_eq!(Severity::parse("warning"), Some(Severity::Warn));
        assert_eq!(Severity::parse("off"), Some(Severity::Off));
        assert_eq!(Severity::parse("verbose"), None);
        assert!(Severity::Trace < Severity::Error);
    }

    #[test]
    fn test_record_layout() {
        let line = render(
            Severity::Warn,
            "RECONNECT_EXHAUSTED",
            &[("table", "orders"), ("attempts", "5")],
        );
        assert_eq!(
            line,
            "{\"event\":\"RECONNECT_EXHAUSTED\",\"severity\":\"WARN\",\"attempts\":\"5\",\"table\":\"orders\"}\n"
        );
    }

    #[test]
    fn test_reserved_keys_are_not_overwritten() {
        let line = render(Severity::Info, "CHANNEL_OPENED", &[("event", "spoofed")]);
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["event"], "CHANNEL_OPENED");
    }

    #[test]
    fn test_escaping_keeps_one_line() {
        let line = render(
            Severity::Error,
            "CHANNEL_ERROR",
            &[("message", "socket \"closed\"\nretrying")],
        );
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["message"], "socket \"closed\"\nretrying");
        assert_eq!(line.matches('\n').count(), 1);
    }
}
