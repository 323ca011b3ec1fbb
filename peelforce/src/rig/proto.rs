//! Rig wire protocol
//!
//! Host to device traffic is one ASCII line per command: an opcode letter,
//! an optional decimal argument and a line feed (`A\n`, `R120\n`). While the
//! device runs its calibration routine it also accepts free text lines.
//!
//! Device to host traffic is newline delimited text. Each complete line is
//! wrapped in a `TelemetryLine`, stamped with its arrival time.
//!
//! Note: the protocol has no acknowledgement. A command is considered sent
//! once its bytes are handed to the transport.

use chrono::{DateTime, Local};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

/// Motor speeds accepted by `Command::SetRpm`.
pub const RPM_RANGE: RangeInclusive<u32> = 1..=1000;

/// Sampling intervals (ms) accepted by `Command::SetInterval`. The firmware
/// cannot report faster than every 100 ms.
pub const INTERVAL_RANGE_MS: RangeInclusive<u32> = 100..=60_000;

/// Single letter opcodes understood by the rig firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Start = b'A',
    Stop = b'B',
    Reset = b'C',
    Calibrate = b'D',
    SetInterval = b'I',
    SetRpm = b'R',
}

/// A request to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the motor.
    Start,
    /// Stop the motor.
    Stop,
    /// Return the carriage to its home position.
    Reset,
    /// Set the motor speed, in RPM.
    SetRpm(u32),
    /// Set the telemetry interval, in milliseconds.
    SetInterval(u32),
    /// Enter the interactive scale calibration routine.
    Calibrate,
    /// Free text, only meaningful while calibrating.
    RawInput(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{what} {value} outside accepted range {min}..={max}")]
    OutOfRange {
        what: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("raw input must be a single line")]
    MultiLine,
    #[error("unrecognized command `{0}`")]
    Unknown(String),
}

fn check_range(
    what: &'static str,
    value: u32,
    range: &RangeInclusive<u32>,
) -> Result<(), CommandError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(CommandError::OutOfRange {
            what,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

impl Command {
    /// Validated `SetRpm`.
    pub fn set_rpm(rpm: u32) -> Result<Command, CommandError> {
        let cmd = Command::SetRpm(rpm);
        cmd.validate()?;
        Ok(cmd)
    }

    /// Validated `SetInterval`.
    pub fn set_interval(ms: u32) -> Result<Command, CommandError> {
        let cmd = Command::SetInterval(ms);
        cmd.validate()?;
        Ok(cmd)
    }

    /// Validated `RawInput`.
    pub fn raw_input(text: impl Into<String>) -> Result<Command, CommandError> {
        let cmd = Command::RawInput(text.into());
        cmd.validate()?;
        Ok(cmd)
    }

    /// Checks numeric payloads against the ranges above, and that raw input
    /// stays on a single line.
    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            Command::SetRpm(rpm) => check_range("rpm", *rpm, &RPM_RANGE),
            Command::SetInterval(ms) => check_range("interval", *ms, &INTERVAL_RANGE_MS),
            Command::RawInput(text) => {
                if text.contains(['\n', '\r']) {
                    Err(CommandError::MultiLine)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Command::Start => Some(Opcode::Start),
            Command::Stop => Some(Opcode::Stop),
            Command::Reset => Some(Opcode::Reset),
            Command::SetRpm(_) => Some(Opcode::SetRpm),
            Command::SetInterval(_) => Some(Opcode::SetInterval),
            Command::Calibrate => Some(Opcode::Calibrate),
            Command::RawInput(_) => None,
        }
    }

    /// Wire form of the command, including the terminating line feed.
    pub fn serialize(&self) -> Result<Vec<u8>, CommandError> {
        self.validate()?;
        Ok(format!("{}\n", self).into_bytes())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetRpm(n) | Command::SetInterval(n) => {
                let op: u8 = self.opcode().map(u8::from).unwrap_or(b'?');
                write!(f, "{}{}", op as char, n)
            }
            Command::RawInput(text) => f.write_str(text),
            _ => {
                let op: u8 = self.opcode().map(u8::from).unwrap_or(b'?');
                write!(f, "{}", op as char)
            }
        }
    }
}

/// Parses the wire notation (`A`, `r120`, `I500`), without the line feed.
/// Free text is never produced: use `Command::raw_input` for that.
impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Command, CommandError> {
        let s = s.trim();
        let unknown = || CommandError::Unknown(s.to_string());
        let (&first, rest) = s.as_bytes().split_first().ok_or_else(unknown)?;
        let opcode = Opcode::try_from(first.to_ascii_uppercase()).map_err(|_| unknown())?;
        let arg = &s[1..];
        let number = || arg.trim().parse::<u32>().map_err(|_| unknown());
        match opcode {
            Opcode::SetRpm => Command::set_rpm(number()?),
            Opcode::SetInterval => Command::set_interval(number()?),
            _ if !rest.is_empty() => Err(unknown()),
            Opcode::Start => Ok(Command::Start),
            Opcode::Stop => Ok(Command::Stop),
            Opcode::Reset => Ok(Command::Reset),
            Opcode::Calibrate => Ok(Command::Calibrate),
        }
    }
}

/// One line received from the device. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryLine {
    text: String,
    received: Instant,
    wall_clock: DateTime<Local>,
}

impl TelemetryLine {
    /// Stamps `text` with the current time.
    pub fn new(text: impl Into<String>) -> TelemetryLine {
        TelemetryLine::at(text, Instant::now(), Local::now())
    }

    pub fn at(text: impl Into<String>, received: Instant, wall_clock: DateTime<Local>) -> TelemetryLine {
        TelemetryLine {
            text: text.into(),
            received,
            wall_clock,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Monotonic arrival time.
    pub fn received(&self) -> Instant {
        self.received
    }

    /// Wall clock arrival time, used for log timestamps.
    pub fn wall_clock(&self) -> DateTime<Local> {
        self.wall_clock
    }
}

impl fmt::Display for TelemetryLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_commands_serialize_without_padding() {
        for rpm in [1, 60, 100, 999, 1000] {
            assert_eq!(
                Command::SetRpm(rpm).serialize().unwrap(),
                format!("R{}\n", rpm).into_bytes()
            );
        }
        for ms in [100, 250, 1000, 60_000] {
            assert_eq!(
                Command::SetInterval(ms).serialize().unwrap(),
                format!("I{}\n", ms).into_bytes()
            );
        }
    }

    #[test]
    fn fixed_commands() {
        assert_eq!(Command::Start.serialize().unwrap(), b"A\n");
        assert_eq!(Command::Stop.serialize().unwrap(), b"B\n");
        assert_eq!(Command::Reset.serialize().unwrap(), b"C\n");
        assert_eq!(Command::Calibrate.serialize().unwrap(), b"D\n");
        assert_eq!(Command::RawInput("20.5".into()).serialize().unwrap(), b"20.5\n");
        assert_eq!(Command::RawInput(String::new()).serialize().unwrap(), b"\n");
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(matches!(
            Command::set_rpm(0),
            Err(CommandError::OutOfRange { what: "rpm", .. })
        ));
        assert!(Command::SetRpm(5000).serialize().is_err());
        assert!(Command::set_interval(99).is_err());
        assert!(Command::set_interval(60_001).is_err());
        assert_eq!(Command::raw_input("a\nb"), Err(CommandError::MultiLine));
    }

    #[test]
    fn parse_wire_notation() {
        assert_eq!("A".parse::<Command>(), Ok(Command::Start));
        assert_eq!("b".parse::<Command>(), Ok(Command::Stop));
        assert_eq!(" R120 ".parse::<Command>(), Ok(Command::SetRpm(120)));
        assert_eq!("i500".parse::<Command>(), Ok(Command::SetInterval(500)));
        assert!("A1".parse::<Command>().is_err());
        assert!("R".parse::<Command>().is_err());
        assert!("X".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
        assert!("R0".parse::<Command>().is_err());
    }

    #[test]
    fn display_matches_wire_form() {
        for cmd in [Command::Start, Command::SetRpm(42), Command::SetInterval(1000)] {
            let wire = cmd.serialize().unwrap();
            assert_eq!(format!("{}\n", cmd).as_bytes(), &wire[..]);
            assert_eq!(cmd.to_string().parse::<Command>(), Ok(cmd));
        }
    }
}
