use clap::Parser;
use peelforce::rig::port::serial::DEFAULT_BAUD_RATE;
use peelforce::rig::port::DEFAULT_POLL_INTERVAL;
use peelforce::rig::util::{self, DetectError};
use peelforce::rig::{Command, CommandError, ConnectSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{fs, io};
use tracing::warn;

#[derive(Parser, Debug, Clone)]
pub struct RigOpts {
    /// Serial port of the rig (e.g., /dev/ttyACM0, COM3)
    #[arg(
        short = 'p',
        long = "port",
        help = "Serial port; auto-detected when there is a single rig attached"
    )]
    pub port: Option<String>,

    /// Baud rate the firmware was built for
    #[arg(short = 'b', long = "baud", help = "Serial baud rate")]
    pub baud_rate: Option<u32>,

    /// Poll interval of the read loop, in milliseconds
    #[arg(long = "poll-ms", default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    pub poll_ms: u64,
}

impl RigOpts {
    /// Resolves the connection parameters: command line first, then the
    /// settings file, then auto-detection.
    pub fn connect_settings(&self, settings: &Settings) -> Result<ConnectSettings, DetectError> {
        let port = match self.port.clone().or_else(|| settings.port.clone()) {
            Some(port) => port,
            None => util::auto_detect_rig()?,
        };
        let baud_rate = self.baud_rate.unwrap_or(settings.baud_rate);
        let mut connect = ConnectSettings::new(port, baud_rate);
        connect.poll_interval = Duration::from_millis(self.poll_ms.max(1));
        Ok(connect)
    }
}

/// Persisted operator preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub save_dir: Option<PathBuf>,
    pub rpm: Option<u32>,
    pub interval_ms: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            save_dir: None,
            rpm: None,
            interval_ms: None,
        }
    }
}

pub const SETTINGS_FILE: &str = "peelforce.yaml";

impl Settings {
    /// Location of the settings file: `$PEELFORCE_SETTINGS`, or
    /// `peelforce.yaml` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os("PEELFORCE_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE))
    }

    /// Reads `path`. A missing file gives the defaults; so does a malformed
    /// one, after a warning.
    pub fn load_or_default(path: &Path) -> Settings {
        match fs::read_to_string(path) {
            Ok(text) => match serde_yaml::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring malformed settings file");
                    Settings::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Settings::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read settings file");
                Settings::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let text = serde_yaml::to_string(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, text)
    }

    /// Where a new log goes when no file is named: a timestamped file in
    /// `save_dir`, or in the working directory.
    pub fn new_log_path(&self, now: chrono::DateTime<chrono::Local>) -> PathBuf {
        let name = format!("peel_{}.csv", now.format("%Y%m%d_%H%M%S"));
        match &self.save_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

/// One line typed at the `log` prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Device(Command),
    Calibrate,
    Status,
    Help,
    Quit,
}

impl ReplCommand {
    /// Commands that need a live connection.
    pub fn needs_controls(&self) -> bool {
        matches!(self, ReplCommand::Device(_) | ReplCommand::Calibrate)
    }
}

impl FromStr for ReplCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (word, arg) = match s.split_once(|c: char| c.is_whitespace() || c == '=') {
            Some((word, arg)) => (word, Some(arg.trim())),
            None => (s, None),
        };
        let number = |what: &str| -> Result<u32, CommandError> {
            arg.and_then(|a| a.parse().ok())
                .ok_or_else(|| CommandError::Unknown(format!("{} needs a number", what)))
        };
        let cmd = match (word.to_ascii_lowercase().as_str(), arg) {
            ("a" | "start", None) => ReplCommand::Device(Command::Start),
            ("b" | "stop", None) => ReplCommand::Device(Command::Stop),
            ("c" | "reset", None) => ReplCommand::Device(Command::Reset),
            ("r" | "rpm", _) => ReplCommand::Device(Command::set_rpm(number("rpm")?)?),
            ("i" | "interval", _) => ReplCommand::Device(Command::set_interval(number("interval")?)?),
            ("d" | "cal" | "calibrate", None) => ReplCommand::Calibrate,
            ("s" | "status", None) => ReplCommand::Status,
            ("h" | "help" | "?", None) => ReplCommand::Help,
            ("q" | "quit" | "exit", None) => ReplCommand::Quit,
            _ => {
                // Bare wire notation, e.g. `R120`.
                return Command::from_str(s).map(ReplCommand::Device);
            }
        };
        Ok(cmd)
    }
}

pub const REPL_HELP: &str = "\
commands:
  a | start          start the motor
  b | stop           stop the motor
  c | reset          reset the position
  r <rpm>            set the motor speed
  i <ms>             set the sample interval
  cal                run a scale calibration
  s | status         show connection and log status
  q | quit           stop logging and exit";
