//! Calibration session
//!
//! Calibration is a guided prose exchange with the device's firmware. While
//! a session is active it owns the telemetry stream: `start()` claims the
//! router, every routed line lands in the session transcript, and the
//! operator's answers go back to the device as raw input lines. The session
//! completes when the device prints `Finished!`, or when it is cancelled.
//! Either way, and also when the session is simply dropped, the router is
//! handed back to whatever target held it before `start()`.

use crate::rig::{Claim, Command, CommandError, Commander, Router, SendError, TelemetryLine, Target};

use crossbeam::channel;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Line the device prints when the calibration sequence is over.
pub const FINISHED_MARKER: &str = "Finished!";

/// Router target name used while a session is active.
pub const CALIBRATION_TARGET: &str = "calibration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    /// A line from the device.
    Device(String),
    /// Operator input sent to the device.
    Host(String),
}

impl fmt::Display for TranscriptEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TranscriptEntry::Device(text) => write!(f, "{}", text),
            TranscriptEntry::Host(text) => write!(f, ">>> {}", text),
        }
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration session is over")]
    Finished,
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub struct CalibrationSession {
    commander: Commander,
    rx: channel::Receiver<TelemetryLine>,
    claim: Option<Claim>,
    state: SessionState,
    transcript: Vec<TranscriptEntry>,
}

impl CalibrationSession {
    /// Claims `router` and puts the device in calibration mode.
    ///
    /// The claim is taken before the command goes out so the first prompt
    /// cannot reach the previous target. If sending fails the claim is
    /// dropped, and the router is already restored when this returns.
    pub fn start(commander: Commander, router: &Router) -> Result<CalibrationSession, CalibrationError> {
        if !commander.is_connected() {
            return Err(SendError::NotConnected.into());
        }
        let (target, rx) = Target::channel(CALIBRATION_TARGET);
        let claim = router.claim(target);
        commander.send(&Command::Calibrate)?;
        info!("calibration started");
        Ok(CalibrationSession {
            commander,
            rx,
            claim: Some(claim),
            state: SessionState::Active,
            transcript: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn input_enabled(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Forwards one line of operator input to the device.
    pub fn send_input(&mut self, text: &str) -> Result<(), CalibrationError> {
        if !self.input_enabled() {
            return Err(CalibrationError::Finished);
        }
        let cmd = Command::raw_input(text)?;
        self.commander.send(&cmd)?;
        self.transcript.push(TranscriptEntry::Host(text.to_string()));
        Ok(())
    }

    /// Appends a device line to the transcript, completing the session on
    /// the finish marker. Returns true if this line completed it.
    pub fn handle_line(&mut self, line: &TelemetryLine) -> bool {
        self.transcript.push(TranscriptEntry::Device(line.text().to_string()));
        if self.state == SessionState::Active && line.text().contains(FINISHED_MARKER) {
            self.finish(SessionState::Completed);
            return true;
        }
        false
    }

    /// Processes every line already queued, without waiting. Returns the
    /// number of transcript entries added.
    pub fn pump(&mut self) -> usize {
        let before = self.transcript.len();
        while let Ok(line) = self.rx.try_recv() {
            self.handle_line(&line);
        }
        self.transcript.len() - before
    }

    /// Waits up to `timeout` for the next device line.
    pub fn next_line(&mut self, timeout: Duration) -> Option<&TranscriptEntry> {
        let line = self.rx.recv_timeout(timeout).ok()?;
        self.handle_line(&line);
        self.transcript.last()
    }

    /// Ends an active session early. Does nothing once it is over.
    pub fn cancel(&mut self) {
        if self.state == SessionState::Active {
            self.finish(SessionState::Cancelled);
        }
    }

    fn finish(&mut self, state: SessionState) {
        self.state = state;
        if let Some(claim) = self.claim.take() {
            claim.release();
        }
        // Lines routed here between the marker and the release.
        while let Ok(line) = self.rx.try_recv() {
            self.transcript.push(TranscriptEntry::Device(line.text().to_string()));
        }
        info!(?state, entries = self.transcript.len(), "calibration ended");
    }
}

impl Drop for CalibrationSession {
    fn drop(&mut self) {
        if self.claim.is_some() {
            debug!("calibration session dropped while active");
        }
    }
}
