//! Device connection
//!
//! A `Connection` owns one `Port` (and so one transport and one poller
//! thread), publishes its lifecycle through `ConnectionState`, and routes
//! every received line through a `Router`.
//!
//! State machine:
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                      |            |
//!                      +-> Failed <-+ (transport error)
//! Failed -> Disconnected (handle released)
//! ```
//! Any other transition is ignored. Transitions are published on the
//! optional event channel given at connect time.

use super::port::{self, memory, serial, Port, RawPort, RecvError, SendError};
use super::proto::{Command, TelemetryLine};
use super::router::Router;

use crossbeam::channel;
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    /// Whether device controls should be offered to the user.
    pub fn controls_enabled(self) -> bool {
        self == ConnectionState::Connected
    }

    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Disconnected)
                | (Connected, Failed)
                | (Failed, Disconnected)
        )
    }
}

/// Status event sent to an optional user specified channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connecting,
    Connected,
    Disconnected,
    Failed(String),
}

impl Event {
    pub fn state(&self) -> ConnectionState {
        match self {
            Event::Connecting => ConnectionState::Connecting,
            Event::Connected => ConnectionState::Connected,
            Event::Disconnected => ConnectionState::Disconnected,
            Event::Failed(_) => ConnectionState::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("serial port {port} unavailable: {source}")]
    Unavailable {
        port: String,
        #[source]
        source: mio_serial::Error,
    },
    #[error("permission denied opening {port}")]
    PermissionDenied { port: String },
    #[error("serial port {port} is already open")]
    AlreadyOpen { port: String },
    #[error("failed to start port thread: {0}")]
    Thread(#[source] io::Error),
}

impl ConnectError {
    fn from_serial(port: &str, err: mio_serial::Error) -> ConnectError {
        match err.kind() {
            mio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                ConnectError::PermissionDenied {
                    port: port.to_string(),
                }
            }
            _ => ConnectError::Unavailable {
                port: port.to_string(),
                source: err,
            },
        }
    }
}

/// Parameters for opening a serial connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSettings {
    pub port: String,
    pub baud_rate: u32,
    pub poll_interval: Duration,
}

impl ConnectSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> ConnectSettings {
        ConnectSettings {
            port: port.into(),
            baud_rate,
            poll_interval: port::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Names of the ports this process currently has open.
fn open_ports() -> MutexGuard<'static, HashSet<String>> {
    static OPEN_PORTS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    OPEN_PORTS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Registration of a port name in `open_ports()`, removed on drop.
struct PortLease(String);

impl PortLease {
    fn acquire(name: &str) -> Result<PortLease, ConnectError> {
        if open_ports().insert(name.to_string()) {
            Ok(PortLease(name.to_string()))
        } else {
            Err(ConnectError::AlreadyOpen {
                port: name.to_string(),
            })
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        open_ports().remove(&self.0);
    }
}

/// State shared between the connection handle, its commanders and the port thread.
struct Shared {
    port_name: String,
    state: Mutex<ConnectionState>,
    events: Option<channel::Sender<Event>>,
}

impl Shared {
    fn new(port_name: &str, events: Option<channel::Sender<Event>>) -> Shared {
        Shared {
            port_name: port_name.to_string(),
            state: Mutex::new(ConnectionState::Disconnected),
            events,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a legal transition and publishes it. Returns false if the
    /// transition is not legal from the current state.
    fn transition(&self, event: Event) -> bool {
        let next = event.state();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.can_become(next) {
                debug!(port = %self.port_name, from = ?*state, to = ?next, "ignored state transition");
                return false;
            }
            *state = next;
        }
        match &event {
            Event::Failed(reason) => error!(port = %self.port_name, %reason, "connection failed"),
            _ => info!(port = %self.port_name, state = ?next, "connection state"),
        }
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                warn!(port = %self.port_name, "status event dropped");
            }
        }
        true
    }
}

/// Cloneable handle for sending commands to a connected device.
#[derive(Clone)]
pub struct Commander {
    tx: channel::Sender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl Commander {
    /// Validates, encodes and queues `cmd` for the port thread. Fire and
    /// forget: the device does not acknowledge commands. Never blocks; a
    /// transport that stopped accepting data yields `SendError::Full`.
    pub fn send(&self, cmd: &Command) -> Result<(), SendError> {
        use channel::TrySendError;
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        let data = cmd.serialize()?;
        debug!(port = %self.shared.port_name, command = %cmd, "send");
        match self.tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_data)) => {
                warn!(port = %self.shared.port_name, command = %cmd, "command queue full");
                Err(SendError::Full)
            }
            Err(TrySendError::Disconnected(_data)) => Err(SendError::NotConnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// An open connection to the rig.
pub struct Connection {
    port: Port,
    commander: Commander,
    shared: Arc<Shared>,
    _lease: PortLease,
}

impl Connection {
    /// Opens the serial port in `settings` and starts routing its lines
    /// through `router`. Open failures are not retried.
    pub fn connect(
        settings: &ConnectSettings,
        router: Router,
        events: Option<channel::Sender<Event>>,
    ) -> Result<Connection, ConnectError> {
        let shared = Arc::new(Shared::new(&settings.port, events));
        shared.transition(Event::Connecting);
        let opened = PortLease::acquire(&settings.port).and_then(|lease| {
            serial::Port::new(&settings.port, settings.baud_rate)
                .map(|raw| (raw, lease))
                .map_err(|e| ConnectError::from_serial(&settings.port, e))
        });
        match opened {
            Ok((raw, lease)) => Connection::start(raw, lease, shared, router, settings.poll_interval),
            Err(e) => {
                shared.transition(Event::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Same as `connect()`, over an arbitrary transport. `name` identifies
    /// the transport in logs and in the open port registry.
    pub fn from_transport<RawPortT: RawPort + Send + 'static>(
        name: &str,
        raw: RawPortT,
        router: Router,
        events: Option<channel::Sender<Event>>,
        poll_interval: Duration,
    ) -> Result<Connection, ConnectError> {
        let shared = Arc::new(Shared::new(name, events));
        shared.transition(Event::Connecting);
        match PortLease::acquire(name) {
            Ok(lease) => Connection::start(raw, lease, shared, router, poll_interval),
            Err(e) => {
                shared.transition(Event::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Convenience for tests and dry runs: an in-memory transport.
    pub fn in_memory(
        name: &str,
        raw: memory::MemoryPort,
        router: Router,
        events: Option<channel::Sender<Event>>,
    ) -> Result<Connection, ConnectError> {
        Connection::from_transport(name, raw, router, events, port::DEFAULT_POLL_INTERVAL)
    }

    fn start<RawPortT: RawPort + Send + 'static>(
        raw: RawPortT,
        lease: PortLease,
        shared: Arc<Shared>,
        router: Router,
        poll_interval: Duration,
    ) -> Result<Connection, ConnectError> {
        // Connected before the thread exists, so a failure it reports can
        // only ever follow this transition.
        shared.transition(Event::Connected);
        let rx_shared = shared.clone();
        let rx = move |res: Result<String, RecvError>| -> io::Result<()> {
            match res {
                Ok(text) => {
                    router.deliver(TelemetryLine::new(text));
                    Ok(())
                }
                Err(RecvError::NotReady) => Ok(()),
                Err(RecvError::LineTooLong(junk)) => {
                    warn!(port = %rx_shared.port_name, bytes = junk.len(), "discarded unterminated line");
                    Ok(())
                }
                Err(RecvError::Disconnected) => {
                    rx_shared.transition(Event::Failed("device disconnected".to_string()));
                    Err(io::Error::from(io::ErrorKind::BrokenPipe))
                }
                Err(RecvError::IO(e)) => {
                    rx_shared.transition(Event::Failed(e.to_string()));
                    Err(e)
                }
            }
        };
        let port = match Port::from_raw(raw, rx, poll_interval) {
            Ok(port) => port,
            Err(e) => {
                shared.transition(Event::Failed(e.to_string()));
                return Err(ConnectError::Thread(e));
            }
        };
        let commander = Commander {
            tx: port.sender().ok_or_else(|| {
                ConnectError::Thread(io::Error::from(io::ErrorKind::BrokenPipe))
            })?,
            shared: shared.clone(),
        };
        Ok(Connection {
            port,
            commander,
            shared,
            _lease: lease,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.shared.port_name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn controls_enabled(&self) -> bool {
        self.state().controls_enabled()
    }

    pub fn send_command(&self, cmd: &Command) -> Result<(), SendError> {
        self.commander.send(cmd)
    }

    pub fn commander(&self) -> Commander {
        self.commander.clone()
    }

    /// Stops the port thread, closes the transport and moves to
    /// `Disconnected`. No line is routed after this returns. Idempotent.
    pub fn disconnect(&mut self) {
        self.port.stop();
        self.shared.transition(Event::Disconnected);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rig::router::Target;
    use std::time::Instant;

    fn recv_event(rx: &channel::Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(2)).expect("event")
    }

    #[test]
    fn lifecycle_events_and_projection() {
        let (raw, handle) = memory::pair();
        let (ev_tx, ev_rx) = channel::unbounded();
        let mut conn = Connection::in_memory("mem-lifecycle", raw, Router::new(), Some(ev_tx)).unwrap();

        assert_eq!(recv_event(&ev_rx), Event::Connecting);
        assert_eq!(recv_event(&ev_rx), Event::Connected);
        assert!(conn.controls_enabled());

        conn.send_command(&Command::Start).unwrap();
        conn.disconnect();
        assert_eq!(recv_event(&ev_rx), Event::Disconnected);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.controls_enabled());
        assert_eq!(handle.written_lines(), vec!["A"]);
        assert_eq!(handle.close_count(), 1);

        conn.disconnect();
        drop(conn);
        assert_eq!(handle.close_count(), 1);
        assert!(ev_rx.try_recv().is_err());
    }

    #[test]
    fn send_requires_connected() {
        let (raw, _handle) = memory::pair();
        let mut conn = Connection::in_memory("mem-send", raw, Router::new(), None).unwrap();
        let commander = conn.commander();
        assert!(matches!(
            commander.send(&Command::SetRpm(0)),
            Err(SendError::Invalid(_))
        ));
        conn.disconnect();
        assert!(matches!(
            conn.send_command(&Command::Stop),
            Err(SendError::NotConnected)
        ));
        assert!(matches!(commander.send(&Command::Stop), Err(SendError::NotConnected)));
    }

    #[test]
    fn transport_failure_moves_to_failed() {
        let (raw, handle) = memory::pair();
        let (ev_tx, ev_rx) = channel::unbounded();
        let conn = Connection::in_memory("mem-fail", raw, Router::new(), Some(ev_tx)).unwrap();
        recv_event(&ev_rx);
        recv_event(&ev_rx);

        handle.hang_up();
        assert_eq!(recv_event(&ev_rx), Event::Failed("device disconnected".into()));
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(matches!(conn.send_command(&Command::Start), Err(SendError::NotConnected)));
        drop(conn);
        assert_eq!(recv_event(&ev_rx), Event::Disconnected);
    }

    /// Accepts nothing: every write has to wait for a drain that never succeeds.
    struct StalledPort;

    impl RawPort for StalledPort {
        fn recv(&mut self) -> Result<String, RecvError> {
            Err(RecvError::NotReady)
        }

        fn send(&mut self, _data: &[u8]) -> Result<(), SendError> {
            Err(SendError::MustDrain)
        }

        fn drain(&mut self) -> Result<(), SendError> {
            Err(SendError::MustDrain)
        }

        fn has_data_to_drain(&self) -> bool {
            true
        }
    }

    #[test]
    fn stalled_transport_does_not_block_senders() {
        let mut conn = Connection::from_transport(
            "stalled-transport",
            StalledPort,
            Router::new(),
            None,
            port::DEFAULT_POLL_INTERVAL,
        )
        .unwrap();
        let commander = conn.commander();
        let (done_tx, done_rx) = channel::unbounded();
        let sender = std::thread::spawn(move || {
            let results: Vec<_> = (0..40).map(|_| commander.send(&Command::Start)).collect();
            let _ = done_tx.send(results);
        });

        let results = done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("send_command blocked on a stalled transport");
        sender.join().unwrap();
        assert!(results.iter().any(|r| matches!(r, Err(SendError::Full))));
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(()) | Err(SendError::Full))));
        assert!(conn.controls_enabled());
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn same_name_cannot_be_opened_twice() {
        let (raw_a, _a) = memory::pair();
        let (raw_b, _b) = memory::pair();
        let (ev_tx, ev_rx) = channel::unbounded();
        let first = Connection::in_memory("mem-twice", raw_a, Router::new(), None).unwrap();
        let second = Connection::in_memory("mem-twice", raw_b, Router::new(), Some(ev_tx));
        assert!(matches!(second, Err(ConnectError::AlreadyOpen { .. })));
        assert_eq!(recv_event(&ev_rx), Event::Connecting);
        assert!(matches!(recv_event(&ev_rx), Event::Failed(_)));

        drop(first);
        let (raw_c, _c) = memory::pair();
        assert!(Connection::in_memory("mem-twice", raw_c, Router::new(), None).is_ok());
    }

    #[test]
    fn missing_serial_port_fails() {
        let (ev_tx, ev_rx) = channel::unbounded();
        let settings = ConnectSettings::new("/dev/peelforce-does-not-exist", 9600);
        let res = Connection::connect(&settings, Router::new(), Some(ev_tx));
        assert!(res.is_err());
        assert_eq!(recv_event(&ev_rx), Event::Connecting);
        assert!(matches!(recv_event(&ev_rx), Event::Failed(_)));
    }

    #[test]
    fn disconnect_races_with_inflight_reads() {
        for round in 0..20 {
            let (raw, handle) = memory::pair();
            let router = Router::new();
            let (target, rx) = Target::channel("main");
            router.set_target(Some(target));
            let mut conn =
                Connection::in_memory(&format!("mem-race-{}", round), raw, router, None).unwrap();

            let feeder = std::thread::spawn(move || {
                let start = Instant::now();
                while start.elapsed() < Duration::from_millis(30) {
                    handle.feed_line("1,2.0");
                }
            });
            std::thread::sleep(Duration::from_millis(5));
            conn.disconnect();
            let delivered = rx.try_iter().count();
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(rx.try_iter().count(), 0, "line routed after disconnect ({} before)", delivered);
            feeder.join().unwrap();
        }
    }
}
