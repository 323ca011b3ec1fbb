//! Line buffering for stream-oriented ports.
//!
//! Bytes read from the transport accumulate in a `LineBuf` until a line
//! feed completes a line. Outgoing command lines that the OS could not
//! accept in one go are parked in a `LineBuf` and drained before anything
//! else is written.

use super::{RecvError, SendError};
use std::io;

/// Size of the internal buffer. Also the longest line accepted.
pub const LINEBUF_SIZE: usize = 4096;

pub struct LineBuf {
    /// Valid data (possibly none) is in `buf[start..end]`.
    buf: Box<[u8; LINEBUF_SIZE]>,
    start: usize,
    end: usize,
    /// Set after an overlong line: bytes are dropped up to the next line feed.
    discarding: bool,
}

impl LineBuf {
    pub fn new() -> LineBuf {
        LineBuf {
            buf: Box::new([0; LINEBUF_SIZE]),
            start: 0,
            end: 0,
            discarding: false,
        }
    }

    pub fn empty(&self) -> bool {
        self.start == self.end
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Discards `len` bytes off the front. `len` must be at most `size()`.
    pub fn consume(&mut self, len: usize) {
        if len > self.size() {
            panic!("Invalid consume for more data that is contained");
        }
        self.start += len;
        if self.start == self.end {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        if self.start != 0 {
            let len = self.size();
            self.buf.copy_within(self.start..self.end, 0);
            self.start = 0;
            self.end = len;
        }
    }

    /// Returns the next complete line, if any, with the terminator and
    /// surrounding whitespace removed. Blank lines are skipped.
    ///
    /// A buffer full of data with no line feed in it can never complete, so
    /// it is discarded and reported as `RecvError::LineTooLong`. The rest of
    /// that line, up to and including its line feed, is dropped silently.
    pub fn next_line(&mut self) -> Result<String, RecvError> {
        loop {
            let newline = self.data().iter().position(|&b| b == b'\n');
            if self.discarding {
                match newline {
                    Some(pos) => {
                        self.consume(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.flush();
                        return Err(RecvError::NotReady);
                    }
                }
            }
            let Some(pos) = newline else {
                if self.size() == LINEBUF_SIZE {
                    let discarded = String::from_utf8_lossy(self.data()).to_string();
                    self.flush();
                    self.discarding = true;
                    return Err(RecvError::LineTooLong(discarded));
                }
                return Err(RecvError::NotReady);
            };
            let line = String::from_utf8_lossy(&self.data()[..pos]).trim().to_string();
            self.consume(pos + 1);
            if !line.is_empty() {
                return Ok(line);
            }
        }
    }

    /// Reads as much as fits from a non-blocking reader.
    pub fn refill<T: io::Read>(&mut self, reader: &mut T) -> Result<(), RecvError> {
        self.compact();
        if self.end == LINEBUF_SIZE {
            return Ok(());
        }
        match reader.read(&mut self.buf[self.end..]) {
            Ok(0) => Err(RecvError::Disconnected),
            Ok(size) => {
                self.end += size;
                Ok(())
            }
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Err(RecvError::NotReady)
                }
                _ => Err(RecvError::IO(e)),
            },
        }
    }

    /// Appends as much of `data` as fits. Returns `Err` with the number of
    /// bytes appended if not everything fit.
    pub fn add_data(&mut self, data: &[u8]) -> Result<(), usize> {
        self.compact();
        let copy_size = std::cmp::min(LINEBUF_SIZE - self.end, data.len());
        self.buf[self.end..self.end + copy_size].copy_from_slice(&data[..copy_size]);
        self.end += copy_size;
        if copy_size == data.len() {
            Ok(())
        } else {
            Err(copy_size)
        }
    }

    /// Writes out as much of the contained data as the writer accepts.
    pub fn drain<T: io::Write>(&mut self, writer: &mut T) -> Result<(), SendError> {
        if self.empty() {
            return Ok(());
        }
        match writer.write(self.data()) {
            Ok(size) => {
                self.consume(size);
                if self.empty() {
                    Ok(())
                } else {
                    Err(SendError::MustDrain)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(SendError::MustDrain),
            Err(e) => Err(SendError::Io(e)),
        }
    }
}

impl Default for LineBuf {
    fn default() -> Self {
        Self::new()
    }
}
