use clap::{Parser, Subcommand};
use crossbeam::channel;
use peelforce::calibration::{CalibrationSession, SessionState};
use peelforce::data::{OpenMode, ParsedLine, Recorder, Schema};
use peelforce::rig::util::enum_devices;
use peelforce::rig::{Command, Connection, ConnectionState, Event, Router};
use peelforce_tools::{ReplCommand, RigOpts, Settings, REPL_HELP};

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long the interactive loops wait for input before servicing the rig.
const UI_TICK: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(
    name = "peel-tool",
    version,
    about = "Peel-force test rig control, logging and calibration tool"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports that may have a rig attached
    Ports {
        /// Also list unrecognized USB bridges and non-USB ports
        #[arg(short = 'a', long)]
        all: bool,
    },

    /// Send one or more commands and exit
    Send {
        #[command(flatten)]
        rig: RigOpts,

        /// Commands: start, stop, reset, rpm=<n>, interval=<ms>
        #[arg(required = true, value_name = "COMMAND")]
        commands: Vec<String>,
    },

    /// Print telemetry until the rig goes away or stdin closes
    Monitor {
        #[command(flatten)]
        rig: RigOpts,
    },

    /// Log telemetry to CSV while taking commands on stdin
    Log {
        #[command(flatten)]
        rig: RigOpts,

        /// Log file (default: a timestamped file in the save directory)
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Save directory, remembered in the settings file
        #[arg(short = 'd', long = "dir")]
        dir: Option<PathBuf>,

        /// Flush after every row
        #[arg(short = 'u', long)]
        unbuffered: bool,

        /// Append to an existing file instead of replacing it
        #[arg(long)]
        append: bool,
    },

    /// Run the guided scale calibration
    Calibrate {
        #[command(flatten)]
        rig: RigOpts,
    },
}

/// Reads stdin on its own thread. The channel closes at end of input.
fn stdin_lines() -> channel::Receiver<String> {
    let (tx, rx) = channel::unbounded();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

struct Session {
    conn: Connection,
    router: Router,
    events: channel::Receiver<Event>,
}

fn open(rig: &RigOpts, settings: &Settings) -> Result<Session, ()> {
    let connect = rig.connect_settings(settings).map_err(|e| {
        eprintln!("{}", e);
    })?;
    let router = Router::new();
    let (ev_tx, events) = channel::unbounded();
    let conn = Connection::connect(&connect, router.clone(), Some(ev_tx)).map_err(|e| {
        eprintln!("Failed to connect: {}", e);
    })?;
    Ok(Session { conn, router, events })
}

fn list_ports(all: bool) -> Result<(), ()> {
    let devices = enum_devices(all).map_err(|e| {
        eprintln!("{}", e);
    })?;
    let (rigs, others): (Vec<_>, Vec<_>) = devices.into_iter().partition(|dev| dev.ifc.is_known());
    if rigs.is_empty() {
        println!("No likely ports found");
    } else {
        println!("Possible rig ports:");
        for dev in rigs {
            match dev.description {
                Some(desc) => println!(" * {} ({:?}, {})", dev.port, dev.ifc, desc),
                None => println!(" * {} ({:?})", dev.port, dev.ifc),
            }
        }
    }
    if !others.is_empty() {
        println!("Also found these serial ports");
        for dev in others {
            let desc = dev.description.as_deref().unwrap_or("n/a");
            println!(" * {}: {} [{}]", dev.port, desc, dev.hwid);
        }
    }
    Ok(())
}

fn send(rig: &RigOpts, commands: Vec<String>) -> Result<(), ()> {
    let mut cmds = Vec::new();
    for text in &commands {
        match text.parse::<ReplCommand>() {
            Ok(ReplCommand::Device(cmd)) => cmds.push(cmd),
            Ok(other) => {
                eprintln!("'{}' ({:?}) cannot be sent non-interactively", text, other);
                return Err(());
            }
            Err(e) => {
                eprintln!("'{}': {}", text, e);
                return Err(());
            }
        }
    }
    let settings = Settings::load_or_default(&Settings::default_path());
    let mut session = open(rig, &settings)?;
    for cmd in &cmds {
        session.conn.send_command(cmd).map_err(|e| {
            eprintln!("Failed to send {}: {}", cmd, e);
        })?;
    }
    // Queued commands are flushed before the port closes.
    session.conn.disconnect();
    Ok(())
}

fn monitor(rig: &RigOpts) -> Result<(), ()> {
    let settings = Settings::load_or_default(&Settings::default_path());
    let session = open(rig, &settings)?;
    let (target, lines) = peelforce::rig::Target::channel("monitor");
    session.router.set_target(Some(target));
    let stdin = stdin_lines();

    loop {
        channel::select! {
            recv(lines) -> line => match line {
                Ok(line) => println!("{}", line),
                Err(_) => break,
            },
            recv(session.events) -> event => match event {
                Ok(Event::Failed(reason)) => {
                    eprintln!("Connection lost: {}", reason);
                    return Err(());
                }
                Ok(_) => {}
                Err(_) => break,
            },
            recv(stdin) -> input => if input.is_err() {
                break;
            },
        }
    }
    Ok(())
}

fn print_entries(session: &CalibrationSession, printed: &mut usize) {
    for entry in &session.transcript()[*printed..] {
        println!("{}", entry);
    }
    *printed = session.transcript().len();
}

/// Runs a calibration session to completion on an open connection.
/// Returns false if stdin closed before the device finished.
fn run_calibration(session: &Session, stdin: &channel::Receiver<String>) -> Result<bool, ()> {
    let mut cal = CalibrationSession::start(session.conn.commander(), &session.router).map_err(|e| {
        eprintln!("Failed to start calibration: {}", e);
    })?;
    println!("Calibration started; answer the prompts, empty line to continue.");
    let mut printed = 0;
    while cal.state() == SessionState::Active {
        cal.pump();
        print_entries(&cal, &mut printed);
        if let Some(Event::Failed(reason)) = session.events.try_iter().find(|e| matches!(e, Event::Failed(_))) {
            eprintln!("Connection lost: {}", reason);
            cal.cancel();
            return Err(());
        }
        match stdin.recv_timeout(UI_TICK) {
            Ok(input) => {
                if let Err(e) = cal.send_input(&input) {
                    eprintln!("{}", e);
                }
            }
            Err(channel::RecvTimeoutError::Timeout) => {}
            Err(channel::RecvTimeoutError::Disconnected) => {
                cal.cancel();
                break;
            }
        }
    }
    print_entries(&cal, &mut printed);
    match cal.state() {
        SessionState::Completed => {
            println!("Calibration finished.");
            Ok(true)
        }
        _ => {
            println!("Calibration cancelled.");
            Ok(false)
        }
    }
}

fn calibrate(rig: &RigOpts) -> Result<(), ()> {
    let settings = Settings::load_or_default(&Settings::default_path());
    let session = open(rig, &settings)?;
    let stdin = stdin_lines();
    if run_calibration(&session, &stdin)? {
        Ok(())
    } else {
        Err(())
    }
}

fn print_status(session: &Session, recorder: &Recorder) {
    println!("connection: {} ({:?})", session.conn.port_name(), session.conn.state());
    match recorder.log_path() {
        Some(path) => println!("logging: {} ({} rows)", path.display(), recorder.rows_logged()),
        None => println!("logging: off"),
    }
    match recorder.device_config() {
        Some(config) => println!("device: {} rpm, {} ms interval", config.rpm, config.interval_ms),
        None => println!("device: configuration not reported yet"),
    }
}

fn log(
    rig: &RigOpts,
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
    unbuffered: bool,
    append: bool,
) -> Result<(), ()> {
    let settings_path = Settings::default_path();
    let mut settings = Settings::load_or_default(&settings_path);
    if dir.is_some() {
        settings.save_dir = dir;
    }

    let session = open(rig, &settings)?;
    let (mut recorder, target) = Recorder::new();
    session.router.set_target(Some(target));
    recorder.set_unbuffered(unbuffered);

    let path = file.unwrap_or_else(|| settings.new_log_path(chrono::Local::now()));
    let mode = if append { OpenMode::Append } else { OpenMode::Truncate };
    recorder.start_logging(&path, &Schema::peel_test(), mode).map_err(|e| {
        eprintln!("Cannot log to {}: {}", path.display(), e);
    })?;
    println!("Logging to {}. Type 'h' for help.", path.display());

    let mut initial = Vec::new();
    if let Some(rpm) = settings.rpm {
        initial.push(Command::SetRpm(rpm));
    }
    if let Some(ms) = settings.interval_ms {
        initial.push(Command::SetInterval(ms));
    }
    for cmd in initial {
        if let Err(e) = session.conn.send_command(&cmd) {
            eprintln!("Failed to restore {}: {}", cmd, e);
        }
    }

    let stdin = stdin_lines();
    let mut result = Ok(());
    'repl: loop {
        match recorder.pump() {
            Ok(lines) => {
                for (line, parsed) in lines {
                    match parsed {
                        ParsedLine::ConfigEcho(config) => {
                            println!("device: {} rpm, {} ms interval", config.rpm, config.interval_ms)
                        }
                        _ => println!("{}", line),
                    }
                }
            }
            Err(e) => {
                eprintln!("Logging stopped: {}", e);
                result = Err(());
            }
        }
        for event in session.events.try_iter() {
            if let Err(e) = recorder.handle_event(&event) {
                eprintln!("Error closing log: {}", e);
            }
            if let Event::Failed(reason) = event {
                eprintln!("Connection lost: {}", reason);
                result = Err(());
                break 'repl;
            }
        }

        let input = match stdin.recv_timeout(UI_TICK) {
            Ok(input) => input,
            Err(channel::RecvTimeoutError::Timeout) => continue,
            Err(channel::RecvTimeoutError::Disconnected) => break,
        };
        if input.trim().is_empty() {
            continue;
        }
        let cmd = match input.parse::<ReplCommand>() {
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        if cmd.needs_controls() && !session.conn.controls_enabled() {
            eprintln!("Rig is not connected ({:?})", session.conn.state());
            continue;
        }
        match cmd {
            ReplCommand::Device(cmd) => {
                if let Err(e) = session.conn.send_command(&cmd) {
                    eprintln!("Failed to send {}: {}", cmd, e);
                    continue;
                }
                match cmd {
                    Command::SetRpm(rpm) => settings.rpm = Some(rpm),
                    Command::SetInterval(ms) => settings.interval_ms = Some(ms),
                    _ => {}
                }
            }
            ReplCommand::Calibrate => match run_calibration(&session, &stdin) {
                Ok(true) => {}
                Ok(false) => break,
                Err(()) => {
                    result = Err(());
                    break;
                }
            },
            ReplCommand::Status => print_status(&session, &recorder),
            ReplCommand::Help => println!("{}", REPL_HELP),
            ReplCommand::Quit => break,
        }
    }

    if let Err(e) = recorder.stop_logging() {
        eprintln!("Error closing log: {}", e);
        result = Err(());
    }
    if session.conn.state() == ConnectionState::Connected {
        settings.port = Some(session.conn.port_name().to_string());
    }
    if let Err(e) = settings.save(&settings_path) {
        eprintln!("Could not save settings to {}: {}", settings_path.display(), e);
    }
    result
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Ports { all } => list_ports(all),
        Commands::Send { rig, commands } => send(&rig, commands),
        Commands::Monitor { rig } => monitor(&rig),
        Commands::Log {
            rig,
            file,
            dir,
            unbuffered,
            append,
        } => log(&rig, file, dir, unbuffered, append),
        Commands::Calibrate { rig } => calibrate(&rig),
    };

    if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        eprintln!("FAILED");
        ExitCode::FAILURE
    }
}
