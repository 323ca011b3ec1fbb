//! In-memory port
//!
//! A `RawPort` with no hardware behind it. The `MemoryHandle` side feeds
//! bytes as if the device had sent them, observes what was written, and can
//! hang up the line. An optional responder plays the device: it sees every
//! complete line written and returns the lines the device answers with.

use super::{LineBuf, RawPort, RecvError, SendError};
use crossbeam::channel;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

#[derive(Default)]
struct Wire {
    written: Mutex<Vec<u8>>,
    hung_up: AtomicBool,
    closed: AtomicUsize,
}

/// Device side of an in-memory port.
#[derive(Clone)]
pub struct MemoryHandle {
    feed: channel::Sender<Vec<u8>>,
    wire: Arc<Wire>,
}

/// Host side of an in-memory port, to be given to a `Port`.
pub struct MemoryPort {
    incoming: channel::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    rxbuf: LineBuf,
    partial_tx: Vec<u8>,
    responder: Option<Responder>,
    wire: Arc<Wire>,
}

/// Returns a connected port/handle pair.
pub fn pair() -> (MemoryPort, MemoryHandle) {
    let (feed, incoming) = channel::unbounded();
    let wire = Arc::new(Wire::default());
    (
        MemoryPort {
            incoming,
            pending: Vec::new(),
            rxbuf: LineBuf::new(),
            partial_tx: Vec::new(),
            responder: None,
            wire: wire.clone(),
        },
        MemoryHandle { feed, wire },
    )
}

impl MemoryPort {
    /// Installs a device model. Replies are queued after any data already fed.
    pub fn with_responder<F: FnMut(&str) -> Vec<String> + Send + 'static>(
        mut self,
        responder: F,
    ) -> MemoryPort {
        self.responder = Some(Box::new(responder));
        self
    }
}

impl RawPort for MemoryPort {
    fn recv(&mut self) -> Result<String, RecvError> {
        match self.rxbuf.next_line() {
            Err(RecvError::NotReady) => {}
            res => return res,
        }
        self.pending.extend(self.incoming.try_iter().flatten());
        // Whatever is left in rxbuf is an unterminated line that can never complete.
        if self.pending.is_empty() && self.wire.hung_up.load(Ordering::Acquire) {
            return Err(RecvError::Disconnected);
        }
        let taken = match self.rxbuf.add_data(&self.pending) {
            Ok(()) => self.pending.len(),
            Err(n) => n,
        };
        self.pending.drain(..taken);
        self.rxbuf.next_line()
    }

    fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        if self.wire.hung_up.load(Ordering::Acquire) {
            return Err(SendError::Disconnected);
        }
        self.wire
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        if let Some(responder) = self.responder.as_mut() {
            self.partial_tx.extend_from_slice(data);
            while let Some(pos) = self.partial_tx.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.partial_tx.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..pos]).to_string();
                for reply in responder(&line) {
                    self.pending.extend_from_slice(reply.as_bytes());
                    self.pending.push(b'\n');
                }
            }
        }
        Ok(())
    }
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        self.wire.closed.fetch_add(1, Ordering::AcqRel);
    }
}

impl MemoryHandle {
    /// Queues raw bytes for the host to receive.
    pub fn feed(&self, data: impl AsRef<[u8]>) {
        let _ = self.feed.send(data.as_ref().to_vec());
    }

    /// Queues one line, adding the terminator.
    pub fn feed_line(&self, line: &str) {
        self.feed(format!("{}\n", line));
    }

    /// Everything the host has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.wire
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Complete lines the host has written so far, terminators removed.
    pub fn written_lines(&self) -> Vec<String> {
        let written = self.written();
        let text = String::from_utf8_lossy(&written);
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        // Whatever follows the last terminator is not a complete line.
        lines.pop();
        lines
    }

    /// Simulates the device going away. Buffered data is still delivered first.
    pub fn hang_up(&self) {
        self.wire.hung_up.store(true, Ordering::Release);
    }

    /// True once the host side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// How many times the host side was dropped. Always 0 or 1.
    pub fn close_count(&self) -> usize {
        self.wire.closed.load(Ordering::Acquire)
    }
}
