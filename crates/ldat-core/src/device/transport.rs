//! Byte transport between the host and the instrument

use super::protocol::{BAUD_RATE, READ_TIMEOUT};
use super::DeviceError;
use serialport::SerialPort;
use std::io::{self, Read, Write};

/// A bidirectional byte link to an instrument
///
/// Reads honour a short timeout (an `io::ErrorKind::TimedOut` error when no
/// byte arrives in time) so callers can poll without hanging.
pub trait Transport: Read + Write + Send {
    /// System name of the port (e.g. `/dev/ttyACM0`)
    fn name(&self) -> &str;

    /// Human-readable description advertised by the port
    fn description(&self) -> &str;

    /// Bytes that can be read without blocking
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// False once the link is gone
    fn is_open(&self) -> bool;
}

/// [`Transport`] over a real serial port
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
    description: String,
}

impl SerialTransport {
    /// Open a serial port with the protocol's read timeout
    pub fn open(name: &str, description: &str) -> Result<Self, DeviceError> {
        let port = serialport::new(name, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| DeviceError::ConnectFailed(format!("{}: {}", name, e)))?;
        tracing::debug!(port = name, "Serial port opened");
        Ok(Self {
            port,
            name: name.to_string(),
            description: description.to_string(),
        })
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    /// Unplugging shows up as a failing `bytes_available`, not here
    fn is_open(&self) -> bool {
        true
    }
}
