/* Abstraction for the transport semantics */

use serial2::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

pub(crate) mod connection;
pub(crate) use connection::Connection;

/// Capacity of the receive ring sitting between the raw byte source and
/// the line reader.
pub(crate) const RING_CAPACITY: usize = 128;

// Non-blocking reads on a serial port are approximated with the shortest
// timeout the driver honours.
const SERIAL_POLL: Duration = Duration::from_millis(1);

/// Raw byte source under a [`Connection`]: a serial port or a TCP
/// socket. All reads are bounded; `Ok(0)` means nothing arrived in time
/// (or the peer is gone), `Err` is a hard transport failure.
pub(crate) trait RawIo: std::fmt::Debug + Send {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize>;
    /// Returns whatever is immediately available, without waiting.
    fn recv_nonblocking(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    /// Blocks until at least one byte arrives or `timeout` elapses.
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
    fn set_baudrate(&mut self, baudrate: u32) -> std::io::Result<()>;
}

/// Line-level contract the session consumes. Implemented by
/// [`Connection`]; type-erased so the session does not carry the
/// transport parameter.
pub(crate) trait Wire: std::fmt::Debug + Send {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize>;
    /// Reads one line without its terminator. `Some(0)` is a blank line,
    /// `None` means the timeout expired before any byte arrived.
    fn read_line(&mut self, buf: &mut [u8], timeout: Duration)
    -> std::io::Result<Option<usize>>;
    fn set_baudrate(&mut self, baudrate: u32) -> std::io::Result<()>;
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

impl RawIo for SerialPort {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        SerialPort::write_all(self, data)?;
        Ok(data.len())
    }

    fn recv_nonblocking(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.set_read_timeout(SERIAL_POLL)?;
        match SerialPort::read(self, buf) {
            Ok(n) => Ok(n),
            Err(e) if is_timeout(e.kind()) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.set_read_timeout(timeout.max(SERIAL_POLL))?;
        match SerialPort::read(self, buf) {
            Ok(n) => Ok(n),
            Err(e) if is_timeout(e.kind()) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_baudrate(&mut self, baudrate: u32) -> std::io::Result<()> {
        let mut settings = self.get_configuration()?;
        settings.set_baud_rate(baudrate)?;
        self.set_configuration(&settings)?;
        // Stale bytes at the old rate are garbage.
        self.discard_buffers()
    }
}

impl RawIo for TcpStream {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.write_all(data)?;
        self.flush()?;
        Ok(data.len())
    }

    fn recv_nonblocking(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.set_nonblocking(true)?;
        let result = match Read::read(self, buf) {
            Ok(n) => Ok(n),
            Err(e) if is_timeout(e.kind()) => Ok(0),
            Err(e) => Err(e),
        };
        self.set_nonblocking(false)?;
        result
    }

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        // SO_RCVTIMEO; zero would mean "no timeout" to the kernel.
        self.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match Read::read(self, buf) {
            Ok(n) => Ok(n),
            Err(e) if is_timeout(e.kind()) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_baudrate(&mut self, _baudrate: u32) -> std::io::Result<()> {
        Ok(())
    }
}
