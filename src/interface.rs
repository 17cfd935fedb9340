//! Serial transport seam
//!
//! [Connection](crate::connection::Connection) talks to the device through
//! this trait rather than a concrete port type, so tests can substitute a
//! scripted device and alternative byte transports can be plugged in.

use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::SerialPort;

use crate::error::ConnectionError;

/// A blocking, timeout-capable duplex byte stream
///
/// Implementations must preserve FIFO ordering of bytes within one open
/// handle; half-duplex turnaround is the protocol layer's responsibility.
pub trait Interface: Read + Write + Send {
    /// Reconfigure the line speed; used during baud negotiation
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ConnectionError>;

    /// Bound all subsequent reads by `timeout`
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError>;

    fn timeout(&self) -> Duration;

    /// Discard bytes already received but not yet read
    fn clear_input(&mut self) -> Result<(), ConnectionError>;
}

/// The production [Interface]: a system serial port
pub struct SerialInterface {
    serial_port: Box<dyn SerialPort>,
}

impl SerialInterface {
    pub fn new(serial_port: Box<dyn SerialPort>) -> Self {
        SerialInterface { serial_port }
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.serial_port
    }
}

// Note: these impls are necessary because using `dyn SerialPort` as
// `dyn Read`/`dyn Write` requires trait upcasting.
impl Read for SerialInterface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.serial_port.read(buf)
    }
}

impl Write for SerialInterface {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.serial_port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.serial_port.flush()
    }
}

impl Interface for SerialInterface {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ConnectionError> {
        self.serial_port.set_baud_rate(baud)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        self.serial_port.set_timeout(timeout)?;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.serial_port.timeout()
    }

    fn clear_input(&mut self) -> Result<(), ConnectionError> {
        self.serial_port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}
