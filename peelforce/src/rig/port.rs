//! Abstract port
//!
//! The `Port` object provides a few things:
//! - Abstracting across the specific `RawPort`s (a serial device, or the
//!   in-memory transport used for tests and dry runs).
//! - Owning the transport on a dedicated thread for its entire lifetime.
//!   Nothing else ever touches the transport: outgoing command lines are
//!   queued on a crossbeam channel, incoming lines are handed to an
//!   owned callback.
//! - Polling. The thread drains every complete line the transport has
//!   buffered, then waits at most one poll interval for outgoing data
//!   before polling again.
//!
//! Stopping is cooperative: `stop()` raises a flag that the thread checks
//! between lines, then joins it. Once `stop()` returns the callback will
//! never be called again, and the transport has been dropped (closed)
//! exactly once, by the thread that owned it.

mod linebuf;
pub mod memory;
pub mod serial;

pub use linebuf::{LineBuf, LINEBUF_SIZE};

use crate::rig::proto::CommandError;
use crossbeam::channel;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Possible results when receiving from a `RawPort`.
#[derive(Debug)]
pub enum RecvError {
    /// No complete line available at this time.
    NotReady,
    /// The transport went away.
    Disconnected,
    /// A line exceeded the buffer without a terminator. The data was discarded.
    LineTooLong(String),
    /// Low level IO error.
    IO(io::Error),
}

/// Possible errors when sending.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is not in the `Connected` state.
    #[error("not connected")]
    NotConnected,
    /// The command failed validation; nothing was sent.
    #[error("invalid command: {0}")]
    Invalid(#[from] CommandError),
    /// Only returned by a `RawPort`: the data was accepted partially and the
    /// rest must go out through `drain()` before anything else is sent.
    #[error("transport must drain")]
    MustDrain,
    /// The outgoing queue is full: the transport is not accepting data.
    #[error("command queue full")]
    Full,
    /// The port thread is gone.
    #[error("port disconnected")]
    Disconnected,
    /// Issue with the underlying IO operation.
    #[error("transport write failed: {0}")]
    Io(#[from] io::Error),
}

/// Generic interface for the low level part of a port.
pub trait RawPort {
    /// Returns the next complete line without blocking, or `RecvError::NotReady`.
    /// `Disconnected` and `IO` are fatal: the port is torn down.
    fn recv(&mut self) -> Result<String, RecvError>;

    /// Writes an encoded command line. If it returns `MustDrain` the data was
    /// buffered, and `drain()` must succeed before the next `send()`.
    fn send(&mut self, data: &[u8]) -> Result<(), SendError>;

    /// Continue writing data left over by a previous `send()`.
    fn drain(&mut self) -> Result<(), SendError> {
        Ok(())
    }

    fn has_data_to_drain(&self) -> bool {
        false
    }
}

/// Default wait between polls of the transport.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Depth of the outgoing command queue.
pub const DEFAULT_TX_CHANNEL_SIZE: usize = 32;

fn send_failure(err: SendError) -> io::Error {
    match err {
        SendError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// Owner of a `RawPort` and of the thread that polls it.
pub struct Port {
    tx: Option<channel::Sender<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Port {
    /// Thread event loop. Returns when stopped, when the tx channel closes,
    /// when the callback returns an error, or on a fatal transport error.
    fn poller_thread<RawPortT: RawPort, RxCallbackT: FnMut(Result<String, RecvError>) -> io::Result<()>>(
        mut raw_port: RawPortT,
        mut rx: RxCallbackT,
        tx: channel::Receiver<Vec<u8>>,
        stop: &AtomicBool,
        poll_interval: Duration,
    ) {
        use channel::RecvTimeoutError;

        let mut needs_draining = false;
        let mut stopping = false;

        'ioloop: loop {
            if stop.load(Ordering::Acquire) {
                stopping = true;
                break;
            }

            if needs_draining {
                match raw_port.drain() {
                    Ok(()) => needs_draining = false,
                    Err(SendError::MustDrain) => {}
                    Err(e) => {
                        // Transport write failures tear the port down like read failures.
                        let _ = rx(Err(RecvError::IO(send_failure(e))));
                        break;
                    }
                }
            }

            loop {
                if stop.load(Ordering::Acquire) {
                    stopping = true;
                    break 'ioloop;
                }
                match raw_port.recv() {
                    Ok(line) => {
                        if rx(Ok(line)).is_err() {
                            break 'ioloop;
                        }
                    }
                    Err(RecvError::NotReady) => break,
                    Err(e) => {
                        let fatal = matches!(e, RecvError::Disconnected | RecvError::IO(_));
                        if rx(Err(e)).is_err() || fatal {
                            break 'ioloop;
                        }
                    }
                }
            }

            if needs_draining {
                // Nothing new may be written until the previous line is out.
                thread::sleep(poll_interval);
                continue;
            }

            let mut next = match tx.recv_timeout(poll_interval) {
                Ok(data) => Some(data),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            while let Some(data) = next {
                match raw_port.send(&data) {
                    Ok(()) => {}
                    Err(SendError::MustDrain) => {
                        needs_draining = true;
                        break;
                    }
                    Err(e) => {
                        let _ = rx(Err(RecvError::IO(send_failure(e))));
                        break 'ioloop;
                    }
                }
                next = tx.try_recv().ok();
            }
        }
        if stopping {
            // Commands queued before the stop still go out, best effort.
            for data in tx.try_iter() {
                if raw_port.has_data_to_drain() && raw_port.drain().is_err() {
                    break;
                }
                match raw_port.send(&data) {
                    Ok(()) | Err(SendError::MustDrain) => {}
                    Err(_) => break,
                }
            }
            let _ = raw_port.drain();
        }
        trace!(stopping, "port thread exiting");
    }

    /// Create a `Port` from a `RawPort` and a rx callback.
    ///
    /// The callback runs on the port thread with every received line and
    /// every receive error. If it returns an `Err()`, the port is closed.
    pub fn from_raw<
        RawPortT: RawPort + Send + 'static,
        RxCallbackT: FnMut(Result<String, RecvError>) -> io::Result<()> + Send + 'static,
    >(
        raw_port: RawPortT,
        rx: RxCallbackT,
        poll_interval: Duration,
    ) -> io::Result<Port> {
        let (tx, ttx) = channel::bounded::<Vec<u8>>(DEFAULT_TX_CHANNEL_SIZE);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("peelforce-port".into())
            .spawn(move || {
                Port::poller_thread(raw_port, rx, ttx, &thread_stop, poll_interval);
            })?;
        Ok(Port {
            tx: Some(tx),
            stop,
            thread: Some(thread),
        })
    }

    /// Queues an encoded line for the port thread. This call will block
    /// only if the queue is backed up.
    pub fn send(&self, data: Vec<u8>) -> Result<(), SendError> {
        let tx = self.tx.as_ref().ok_or(SendError::Disconnected)?;
        tx.send(data).map_err(|_| SendError::Disconnected)
    }

    /// A handle on the outgoing queue, for senders that outlive a borrow of the port.
    pub fn sender(&self) -> Option<channel::Sender<Vec<u8>>> {
        self.tx.clone()
    }

    /// Returns false once the port thread has exited, for whatever reason.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the port thread and waits for it. Idempotent.
    ///
    /// If called from the port thread itself (i.e. from the rx callback),
    /// this only raises the stop flag; the thread exits after the callback returns.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.tx = None;
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                debug!("port thread panicked");
            }
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.stop();
    }
}
