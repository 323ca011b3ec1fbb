//! Telemetry line parsing.
//!
//! The rig reports samples as `elapsed_ms,force` and its current settings
//! as `R:<rpm>,I:<interval>`. Anything else (status prose, calibration
//! prompts, half-garbled lines) is kept verbatim as an opaque message.

use chrono::{DateTime, Local};

use crate::rig::TelemetryLine;

/// Settings the device reports back after a set-rpm or set-interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub rpm: u32,
    pub interval_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// A two field sample, fields trimmed.
    Data { elapsed: String, force: String },
    /// A configuration echo. Never logged as data.
    ConfigEcho(DeviceConfig),
    /// Anything else, preserved verbatim.
    Opaque(String),
}

fn parse_config_echo(rpm: &str, interval: &str) -> Option<DeviceConfig> {
    let rpm = rpm.trim().strip_prefix("R:")?.trim().parse().ok()?;
    let interval_ms = interval.trim().strip_prefix("I:")?.trim().parse().ok()?;
    Some(DeviceConfig { rpm, interval_ms })
}

/// Classifies one telemetry line. Pure: no I/O, never fails.
pub fn parse_line(line: &str) -> ParsedLine {
    let mut fields = line.split(',');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(first), Some(second), None) => match parse_config_echo(first, second) {
            Some(config) => ParsedLine::ConfigEcho(config),
            None => ParsedLine::Data {
                elapsed: first.trim().to_string(),
                force: second.trim().to_string(),
            },
        },
        _ => ParsedLine::Opaque(line.to_string()),
    }
}

impl ParsedLine {
    /// Fields following the timestamp in a log row. Opaque lines become
    /// `[raw, ""]` so every row has the same width. Configuration echoes
    /// have no row, and yield no fields.
    pub fn row_fields(&self) -> Vec<String> {
        match self {
            ParsedLine::Data { elapsed, force } => vec![elapsed.clone(), force.clone()],
            ParsedLine::Opaque(raw) => vec![raw.clone(), String::new()],
            ParsedLine::ConfigEcho(_) => Vec::new(),
        }
    }
}

/// One row of a log: a timestamp and the fields following it.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub fields: Vec<String>,
}

/// Format of the timestamp column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

impl LogRecord {
    pub fn new(timestamp: DateTime<Local>, fields: Vec<String>) -> LogRecord {
        LogRecord { timestamp, fields }
    }

    /// The record for a parsed line, or `None` for a configuration echo.
    pub fn from_parsed(line: &TelemetryLine, parsed: &ParsedLine) -> Option<LogRecord> {
        match parsed {
            ParsedLine::ConfigEcho(_) => None,
            _ => Some(LogRecord::new(line.wall_clock(), parsed.row_fields())),
        }
    }

    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Instant;

    #[test]
    fn two_fields_are_data() {
        assert_eq!(
            parse_line("123,45.6"),
            ParsedLine::Data {
                elapsed: "123".into(),
                force: "45.6".into()
            }
        );
        assert_eq!(
            parse_line(" 10 , 2.5 "),
            ParsedLine::Data {
                elapsed: "10".into(),
                force: "2.5".into()
            }
        );
    }

    #[test]
    fn other_shapes_are_opaque() {
        assert_eq!(parse_line("Motor started"), ParsedLine::Opaque("Motor started".into()));
        assert_eq!(parse_line("1,2,3"), ParsedLine::Opaque("1,2,3".into()));
        assert_eq!(parse_line(""), ParsedLine::Opaque("".into()));
    }

    #[test]
    fn config_echo_is_not_data() {
        assert_eq!(
            parse_line("R:100,I:1000"),
            ParsedLine::ConfigEcho(DeviceConfig {
                rpm: 100,
                interval_ms: 1000
            })
        );
        assert_eq!(
            parse_line("R: 60, I: 250"),
            ParsedLine::ConfigEcho(DeviceConfig {
                rpm: 60,
                interval_ms: 250
            })
        );
        assert!(matches!(parse_line("R:fast,I:1000"), ParsedLine::Data { .. }));
        assert!(matches!(parse_line("I:1000,R:100"), ParsedLine::Data { .. }));
    }

    #[test]
    fn records_keep_width() {
        let when = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap();
        let line = TelemetryLine::at("Motor started", Instant::now(), when);
        let rec = LogRecord::from_parsed(&line, &parse_line(line.text())).unwrap();
        assert_eq!(rec.fields, vec!["Motor started".to_string(), String::new()]);
        assert_eq!(rec.timestamp_string(), "2024-05-01 12:30:15.000");

        let echo = TelemetryLine::at("R:1,I:100", Instant::now(), when);
        assert_eq!(LogRecord::from_parsed(&echo, &parse_line(echo.text())), None);
    }
}
