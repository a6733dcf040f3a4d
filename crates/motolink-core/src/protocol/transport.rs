//! Byte transports
//!
//! The link treats the transport as an opaque duplex byte channel: no
//! message boundaries are assumed, every read may return a fragment.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

use super::serial::{clear_buffers, configure_port, open_port};
use super::LinkError;

/// Duplex byte channel to an ECU
pub trait Transport: Send {
    /// Read whatever is available within `timeout`. Returns `Ok(0)` if
    /// nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write all bytes, failing with `TimedOut` if the channel stalls
    fn write_all(&mut self, data: &[u8], timeout: Duration) -> io::Result<()>;

    /// Flush pending writes
    fn flush(&mut self) -> io::Result<()>;

    /// Close the channel. Further reads and writes fail.
    fn close(&mut self) -> io::Result<()>;
}

/// Opens transports by identifier
pub trait Connector: Send + Sync {
    /// Open `identifier`; failures map to `PortUnavailable` or `Timeout`
    fn open(
        &self,
        identifier: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, LinkError>;
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

/// Serial port transport
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Wrap an already configured port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port: Some(port) }
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(closed)
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let port = self.port()?;
        port.set_timeout(timeout).map_err(io::Error::other)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if is_timeout(e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        let port = self.port()?;
        port.set_timeout(timeout).map_err(io::Error::other)?;
        port.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the handle closes the OS port
        self.port.take();
        Ok(())
    }
}

/// Opens serial ports with 8N1 framing
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(
        &self,
        identifier: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, LinkError> {
        let mut port = open_port(identifier, baud_rate, timeout)?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;
        debug!(port = identifier, baud_rate, "serial port opened");
        Ok(Box::new(SerialTransport::new(port)))
    }
}

/// TCP transport, for bench simulators and network serial bridges
pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(closed)
    }
}

/// Socket timeouts must be non-zero
fn socket_timeout(timeout: Duration) -> Option<Duration> {
    Some(timeout.max(Duration::from_millis(1)))
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let stream = self.stream()?;
        stream.set_read_timeout(socket_timeout(timeout))?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            )),
            Ok(n) => Ok(n),
            Err(ref e) if is_timeout(e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        let stream = self.stream()?;
        stream.set_write_timeout(socket_timeout(timeout))?;
        stream.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(stream) => stream.shutdown(Shutdown::Both),
            None => Ok(()),
        }
    }
}

/// Opens TCP connections; the identifier is `host:port`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn open(
        &self,
        identifier: &str,
        _baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, LinkError> {
        let unavailable = |reason: String| LinkError::PortUnavailable {
            port: identifier.to_string(),
            reason,
        };

        let addr = identifier
            .to_socket_addrs()
            .map_err(|e| unavailable(e.to_string()))?
            .next()
            .ok_or_else(|| unavailable("address did not resolve".to_string()))?;

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if is_timeout(&e) {
                LinkError::Timeout
            } else {
                unavailable(e.to_string())
            }
        })?;
        stream.set_nodelay(true)?;
        debug!(addr = %addr, "tcp transport opened");
        Ok(Box::new(TcpTransport::new(stream)))
    }
}
