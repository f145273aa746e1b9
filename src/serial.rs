//! Serial endpoints to the flight controller: 8N1 raw, read granularity of
//! one byte exposed through [`SerialEndpoint::read_available`], write
//! granularity of one protocol frame via [`SerialEndpoint::write_frame`].
//!
//! Open failures retry forever with a one-second backoff: the flight
//! controller may boot later than the companion computer.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread;
use std::time::Duration;

use serialport::SerialPort;

/// Which logical serial line this endpoint serves.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SerialRole {
    /// MSP/MAVLink traffic to/from the flight controller.
    Control,
    /// Dedicated SUMD RC output, write-only.
    Rc,
}

/// The engine's view of a serial line, narrow enough that tests can
/// substitute an in-memory double for a real [`SerialEndpoint`].
pub trait SerialLink {
    fn raw_fd(&self) -> RawFd;
    fn read_available(&mut self) -> io::Result<Vec<u8>>;
    fn write_frame(&mut self, data: &[u8]);
}

pub struct SerialEndpoint {
    pub role: SerialRole,
    pub path: String,
    port: Box<dyn SerialPort>,
    read_buf: [u8; 256],
}

impl SerialEndpoint {
    /// Open `path` at `baud`, retrying forever with a 1s backoff on
    /// failure. Read timeout is set to zero so reads return promptly with
    /// whatever is currently buffered, keeping I/O non-blocking in effect
    /// for the event loop.
    pub fn open_with_retry(path: &str, baud: u32, role: SerialRole) -> Self {
        loop {
            match serialport::new(path, baud).timeout(Duration::from_millis(0)).open() {
                Ok(port) => {
                    return SerialEndpoint {
                        role,
                        path: path.to_string(),
                        port,
                        read_buf: [0u8; 256],
                    };
                }
                Err(e) => {
                    log::warn!("could not open serial port '{path}': {e}; retrying in 1s");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.port.as_raw_fd()
    }

    /// Drain every byte currently buffered on the line without blocking.
    /// Returns an empty vec if nothing was available.
    pub fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match self.port.read(&mut self.read_buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&self.read_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Write one protocol frame. Short writes and errors are logged and
    /// swallowed — the next inbound message supersedes.
    pub fn write_frame(&mut self, data: &[u8]) {
        match self.port.write(data) {
            Ok(n) if n == data.len() => {}
            Ok(n) => log::warn!("{:?} short write on '{}': {n}/{} bytes", self.role, self.path, data.len()),
            Err(e) => log::warn!("{:?} write error on '{}': {e}", self.role, self.path),
        }
    }
}

impl SerialLink for SerialEndpoint {
    fn raw_fd(&self) -> RawFd {
        SerialEndpoint::raw_fd(self)
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        SerialEndpoint::read_available(self)
    }

    fn write_frame(&mut self, data: &[u8]) {
        SerialEndpoint::write_frame(self, data)
    }
}

impl std::fmt::Debug for SerialRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerialRole::Control => write!(f, "control"),
            SerialRole::Rc => write!(f, "rc"),
        }
    }
}
