//! Serial Port
//!
//! Implements a `RawPort` for a serial port opened in non-blocking mode.
//! Incoming bytes are split into newline delimited ASCII lines; outgoing
//! command lines are written all-or-none, with any remainder buffered
//! until the OS accepts it.

use super::{LineBuf, RawPort, RecvError, SendError};
use mio_serial::SerialPortBuilderExt;
use std::io;
use std::io::Write;

/// Default data rate. Earlier rig firmware talks at 9600.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// RawPort to communicate via a serial port
pub struct Port {
    /// Underlying serial port stream
    port: mio_serial::SerialStream,
    /// Incoming bytes, up to the next line feed.
    rxbuf: LineBuf,
    /// Outgoing buffer, used for all-or-none sends of command lines
    /// when the OS buffer fills up.
    txbuf: LineBuf,
}

impl Port {
    /// Opens `port_name` (like `/dev/ttyACM0` or `COM3`) at `baud_rate`, 8N1.
    pub fn new(port_name: &str, baud_rate: u32) -> Result<Port, mio_serial::Error> {
        let mio_port = mio_serial::new(port_name, baud_rate).open_native_async()?;
        #[cfg(windows)]
        {
            // Windows requires some custom settings to replicate the unix behavior.
            use std::os::windows::io::AsRawHandle;
            use winapi::um::commapi::SetCommTimeouts;
            use winapi::um::winbase::COMMTIMEOUTS;
            let handle = mio_port.as_raw_handle();
            let mut timeouts = COMMTIMEOUTS {
                ReadIntervalTimeout: 0xFFFFFFFF,
                ReadTotalTimeoutMultiplier: 0xFFFFFFFF,
                ReadTotalTimeoutConstant: 0xFFFFFFFE,
                WriteTotalTimeoutMultiplier: 0,
                WriteTotalTimeoutConstant: 0,
            };
            if unsafe { SetCommTimeouts(handle as _, &mut timeouts) } == 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(Port {
            port: mio_port,
            rxbuf: LineBuf::new(),
            txbuf: LineBuf::new(),
        })
    }
}

impl RawPort for Port {
    fn recv(&mut self) -> Result<String, RecvError> {
        match self.rxbuf.next_line() {
            Err(RecvError::NotReady) => {}
            res => return res,
        }
        if let Err(e) = self.rxbuf.refill(&mut self.port) {
            #[cfg(target_os = "macos")]
            // On macos, disconnecting a serial port while connected will
            // generate this error, so translate it.
            if let RecvError::IO(ioerr) = &e {
                if Some(6) == ioerr.raw_os_error() {
                    return Err(RecvError::Disconnected);
                }
            }
            return Err(e);
        }
        self.rxbuf.next_line()
    }

    fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        if self.has_data_to_drain() {
            return Err(SendError::MustDrain);
        }
        let rest = match self.port.write(data) {
            Ok(size) if size == data.len() => return Ok(()),
            Ok(size) => &data[size..],
            // The OS buffer is completely full: buffer the whole line.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => data,
            Err(e) => return Err(SendError::Io(e)),
        };
        if self.txbuf.add_data(rest).is_err() {
            self.txbuf.flush();
            return Err(SendError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "command line longer than the transmit buffer",
            )));
        }
        Err(SendError::MustDrain)
    }

    fn drain(&mut self) -> Result<(), SendError> {
        self.txbuf.drain(&mut self.port)
    }

    fn has_data_to_drain(&self) -> bool {
        !self.txbuf.empty()
    }
}
