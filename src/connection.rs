//! Establish and drive a connection with a target device
//!
//! [Connection] owns the serial handle for the life of a session and layers
//! timeout management on top of it. It carries no protocol knowledge beyond
//! raw bytes; framing lives in [frame](crate::frame) and command sequencing in
//! the device targets.

use std::{io::Read, time::Duration};

use log::debug;

use crate::{
    error::Error,
    interface::{Interface, SerialInterface},
};

/// Read timeout applied to a freshly opened port
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// An open, exclusively owned serial channel to one device
pub struct Connection {
    serial: Box<dyn Interface>,
    baud: u32,
}

impl Connection {
    /// Open the serial device at `path` with the given initial baud rate.
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        debug!("Opening {path} at {baud} baud");
        let serial = serialport::new(path, baud)
            .timeout(DEFAULT_TIMEOUT)
            .open()?;

        Ok(Connection::new(Box::new(SerialInterface::new(serial)), baud))
    }

    /// Wrap an already configured [Interface].
    pub fn new(serial: Box<dyn Interface>, baud: u32) -> Self {
        Connection { serial, baud }
    }

    /// Reconfigure the line speed.
    pub fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        debug!("Switching to {baud} baud");
        self.serial.set_baud_rate(baud)?;
        self.baud = baud;

        Ok(())
    }

    /// The current line speed.
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Run `f` with the read timeout set to `timeout`, restoring the previous
    /// timeout afterwards on every exit path.
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = self.serial.timeout();
        self.serial.set_timeout(timeout)?;

        let result = f(self);

        self.serial.set_timeout(old_timeout)?;

        result
    }

    /// Send `bytes` and push them out of the host-side buffers.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        use std::io::Write;

        self.serial.write_all(bytes)?;
        self.serial.flush()?;

        Ok(())
    }

    /// Read a single byte, bounded by the current timeout.
    pub fn read_byte(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        self.serial.read_exact(&mut byte)?;

        Ok(byte[0])
    }

    /// Drop any stale bytes the device sent outside a command/response pair.
    pub fn clear_input(&mut self) -> Result<(), Error> {
        self.serial.clear_input()?;

        Ok(())
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.serial.read(buf)
    }
}
