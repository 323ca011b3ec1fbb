//! CSV log sink.
//!
//! One file open at a time. Rows are appended, each formatted in full
//! before a single write so a row is either written whole or not at all.

use super::parser::{parse_line, DeviceConfig, LogRecord, ParsedLine};
use crate::rig::TelemetryLine;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("a log file is already open: {0}")]
    AlreadyOpen(PathBuf),
    #[error("no log file is open")]
    NotOpen,
    #[error("log file I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Column names written as the header row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<String>,
}

impl Schema {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Schema {
        Schema {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Header of a peel test log.
    pub fn peel_test() -> Schema {
        Schema::new(["Timestamp", "Time Since Start (ms)", "Force (N)"])
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Default for Schema {
    fn default() -> Schema {
        Schema::peel_test()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Start a new file, replacing any existing one.
    #[default]
    Truncate,
    /// Keep existing rows; the header goes only into an empty file.
    Append,
}

/// What `LogSink::record` did with a line.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Row(LogRecord),
    ConfigEcho(DeviceConfig),
}

fn quote_field(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\"")).into()
    } else {
        field.into()
    }
}

/// Formats one CSV row, line terminator included.
pub fn format_row<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut row = fields
        .into_iter()
        .map(quote_field)
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

pub struct LogSink {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    unbuffered: bool,
    rows_written: u64,
}

impl LogSink {
    pub fn new() -> LogSink {
        LogSink {
            writer: None,
            path: None,
            unbuffered: false,
            rows_written: 0,
        }
    }

    /// Creates (or truncates) `path` and writes the header.
    pub fn open(&mut self, path: impl AsRef<Path>, schema: &Schema) -> Result<(), LogError> {
        self.open_with(path, schema, OpenMode::Truncate)
    }

    pub fn open_with(
        &mut self,
        path: impl AsRef<Path>,
        schema: &Schema,
        mode: OpenMode,
    ) -> Result<(), LogError> {
        if let Some(open) = &self.path {
            return Err(LogError::AlreadyOpen(open.clone()));
        }
        let path = path.as_ref();
        let file = match mode {
            OpenMode::Truncate => File::create(path)?,
            OpenMode::Append => OpenOptions::new().append(true).create(true).open(path)?,
        };
        let needs_header = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if needs_header {
            writer.write_all(format_row(schema.columns().iter().map(String::as_str)).as_bytes())?;
            writer.flush()?;
        }
        info!(path = %path.display(), ?mode, "log opened");
        self.writer = Some(writer);
        self.path = Some(path.to_path_buf());
        self.rows_written = 0;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flush after every row.
    pub fn set_unbuffered(&mut self, unbuffered: bool) {
        self.unbuffered = unbuffered;
    }

    /// Data rows written since the file was opened.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Parses `line` and logs it. Configuration echoes are returned, not written.
    pub fn record(&mut self, line: &TelemetryLine) -> Result<Recorded, LogError> {
        if !self.is_open() {
            return Err(LogError::NotOpen);
        }
        let parsed = parse_line(line.text());
        if let ParsedLine::ConfigEcho(config) = parsed {
            return Ok(Recorded::ConfigEcho(config));
        }
        let record = LogRecord::new(line.wall_clock(), parsed.row_fields());
        self.write_record(&record)?;
        Ok(Recorded::Row(record))
    }

    pub fn write_record(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let writer = self.writer.as_mut().ok_or(LogError::NotOpen)?;
        let timestamp = record.timestamp_string();
        let row = format_row(std::iter::once(timestamp.as_str()).chain(record.fields.iter().map(String::as_str)));
        writer.write_all(row.as_bytes())?;
        if self.unbuffered {
            writer.flush()?;
        }
        self.rows_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), LogError> {
        let writer = self.writer.as_mut().ok_or(LogError::NotOpen)?;
        writer.flush()?;
        Ok(())
    }

    /// Flushes and releases the file. Closing a closed sink does nothing.
    pub fn close(&mut self) -> Result<(), LogError> {
        let path = self.path.take();
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!(path = ?path, rows = self.rows_written, "log closed");
        }
        Ok(())
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use std::fs;
    use std::time::Instant;

    fn line(text: &str) -> TelemetryLine {
        let when = Local.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        TelemetryLine::at(text, Instant::now(), when)
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peel.csv");
        let mut sink = LogSink::new();
        sink.open(&path, &Schema::peel_test()).unwrap();

        assert!(matches!(sink.record(&line("10,2.5")).unwrap(), Recorded::Row(_)));
        assert!(matches!(sink.record(&line("Motor started")).unwrap(), Recorded::Row(_)));
        assert_eq!(
            sink.record(&line("R:100,I:1000")).unwrap(),
            Recorded::ConfigEcho(DeviceConfig {
                rpm: 100,
                interval_ms: 1000
            })
        );
        assert!(matches!(sink.record(&line("a,b,\"c\"")).unwrap(), Recorded::Row(_)));
        assert_eq!(sink.rows_written(), 3);
        sink.close().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Timestamp,Time Since Start (ms),Force (N)",
                "2024-05-01 09:00:00.000,10,2.5",
                "2024-05-01 09:00:00.000,Motor started,",
                "2024-05-01 09:00:00.000,\"a,b,\"\"c\"\"\",",
            ]
        );
    }

    #[test]
    fn record_before_open_writes_nothing() {
        let mut sink = LogSink::new();
        assert!(matches!(sink.record(&line("1,2")), Err(LogError::NotOpen)));
        assert_eq!(sink.rows_written(), 0);
        assert!(sink.close().is_ok());
    }

    #[test]
    fn reopen_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("again.csv");
        let mut sink = LogSink::new();
        sink.open(&path, &Schema::default()).unwrap();
        assert!(matches!(
            sink.open(&path, &Schema::default()),
            Err(LogError::AlreadyOpen(_))
        ));
        sink.close().unwrap();
        sink.open(&path, &Schema::default()).unwrap();
        sink.record(&line("5,1.0")).unwrap();
        sink.close().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn append_keeps_rows_and_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.csv");
        let schema = Schema::new(["Timestamp", "Data", "Extra"]);
        let mut sink = LogSink::new();
        for text in ["1,1", "2,2"] {
            sink.open_with(&path, &schema, OpenMode::Append).unwrap();
            sink.record(&line(text)).unwrap();
            sink.close().unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Timestamp,Data,Extra");
    }

    #[test]
    fn unbuffered_rows_hit_disk_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.csv");
        let mut sink = LogSink::new();
        sink.set_unbuffered(true);
        sink.open(&path, &Schema::peel_test()).unwrap();
        sink.record(&line("7,0.1")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn open_failure_leaves_sink_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("x.csv");
        let mut sink = LogSink::new();
        assert!(matches!(sink.open(&path, &Schema::default()), Err(LogError::Io(_))));
        assert!(!sink.is_open());
    }
}
