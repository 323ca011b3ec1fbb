//! Recorder
//!
//! The main consumer of the telemetry stream. It owns the receiving end of
//! the router's main target and, for every line:
//! - keeps the latest configuration echo as the known device configuration,
//! - appends data and opaque lines to the log while logging is active,
//! - hands the line back to the caller for display.
//!
//! Logging stops by itself when the connection goes away.

use super::parser::{parse_line, DeviceConfig, LogRecord, ParsedLine};
use super::sink::{LogError, LogSink, OpenMode, Schema};
use crate::rig::{Event, TelemetryLine, Target};

use crossbeam::channel;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// Name of the router target a `Recorder` listens on.
pub const MAIN_TARGET: &str = "main";

pub struct Recorder {
    rx: channel::Receiver<TelemetryLine>,
    sink: LogSink,
    device_config: Option<DeviceConfig>,
}

impl Recorder {
    /// Returns the recorder and the target to install on a `Router`.
    pub fn new() -> (Recorder, Target) {
        let (target, rx) = Target::channel(MAIN_TARGET);
        (
            Recorder {
                rx,
                sink: LogSink::new(),
                device_config: None,
            },
            target,
        )
    }

    pub fn start_logging(
        &mut self,
        path: impl AsRef<Path>,
        schema: &Schema,
        mode: OpenMode,
    ) -> Result<(), LogError> {
        self.sink.open_with(path, schema, mode)
    }

    pub fn stop_logging(&mut self) -> Result<(), LogError> {
        if let Some(path) = self.sink.path() {
            info!(path = %path.display(), rows = self.sink.rows_written(), "logging stopped");
        }
        self.sink.close()
    }

    pub fn is_logging(&self) -> bool {
        self.sink.is_open()
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.sink.path().map(Path::to_path_buf)
    }

    pub fn rows_logged(&self) -> u64 {
        self.sink.rows_written()
    }

    pub fn set_unbuffered(&mut self, unbuffered: bool) {
        self.sink.set_unbuffered(unbuffered);
    }

    /// Last configuration the device reported, if any.
    pub fn device_config(&self) -> Option<DeviceConfig> {
        self.device_config
    }

    /// Processes one line. A write failure closes the log before the error
    /// is returned, so a failing file is never written to again.
    pub fn handle_line(&mut self, line: &TelemetryLine) -> Result<ParsedLine, LogError> {
        let parsed = parse_line(line.text());
        match &parsed {
            ParsedLine::ConfigEcho(config) => {
                info!(rpm = config.rpm, interval_ms = config.interval_ms, "device configuration");
                self.device_config = Some(*config);
            }
            _ if self.sink.is_open() => {
                if let Some(record) = LogRecord::from_parsed(line, &parsed) {
                    if let Err(e) = self.sink.write_record(&record) {
                        error!(error = %e, "log write failed, logging stopped");
                        let _ = self.sink.close();
                        return Err(e);
                    }
                }
            }
            _ => {}
        }
        Ok(parsed)
    }

    /// Stops logging when the connection is lost or closed.
    pub fn handle_event(&mut self, event: &Event) -> Result<(), LogError> {
        match event {
            Event::Disconnected | Event::Failed(_) => self.stop_logging(),
            _ => Ok(()),
        }
    }

    /// Processes every line already queued, without waiting.
    pub fn pump(&mut self) -> Result<Vec<(TelemetryLine, ParsedLine)>, LogError> {
        let mut out = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            let parsed = self.handle_line(&line)?;
            out.push((line, parsed));
        }
        Ok(out)
    }

    /// Waits up to `timeout` for one line and processes it.
    pub fn next_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(TelemetryLine, ParsedLine)>, LogError> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => {
                let parsed = self.handle_line(&line)?;
                Ok(Some((line, parsed)))
            }
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rig::Router;
    use std::fs;

    #[test]
    fn logs_data_and_tracks_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let router = Router::new();
        let (mut recorder, target) = Recorder::new();
        router.set_target(Some(target));

        router.deliver(TelemetryLine::new("before logging"));
        recorder.start_logging(&path, &Schema::peel_test(), OpenMode::Truncate).unwrap();
        for text in ["R:120,I:500", "10,2.5", "Motor started"] {
            router.deliver(TelemetryLine::new(text));
        }
        let seen = recorder.pump().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(
            recorder.device_config(),
            Some(DeviceConfig {
                rpm: 120,
                interval_ms: 500
            })
        );
        // "before logging" was processed after the file opened, so it is logged too.
        assert_eq!(recorder.rows_logged(), 3);

        recorder.handle_event(&Event::Failed("gone".into())).unwrap();
        assert!(!recorder.is_logging());
        let text = fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows.len(), 4);
        assert!(rows[2].ends_with(",10,2.5"));
        assert!(rows[3].ends_with(",Motor started,"));
    }

    #[test]
    fn not_logging_still_parses() {
        let (mut recorder, _target) = Recorder::new();
        let parsed = recorder.handle_line(&TelemetryLine::new("1,2")).unwrap();
        assert!(matches!(parsed, ParsedLine::Data { .. }));
        assert_eq!(recorder.rows_logged(), 0);
        assert!(recorder.next_timeout(Duration::from_millis(1)).unwrap().is_none());
    }
}
