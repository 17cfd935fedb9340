//! Session dispatcher
//!
//! [Programmer] owns one serial session with one device: it selects the
//! protocol variant for the configured family, runs the connection handshake,
//! and forwards flash operations to the variant while enforcing the session
//! state machine. Operations are strictly sequential; a second command is
//! never issued while one is awaiting its response.

use std::str::FromStr;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    connection::Connection,
    error::{ConnectError, Error},
    sequencer::VerifyResult,
    targets::{Chip, FlashGeometry, Target, WriteArea},
};

/// Everything needed to open a session with one device
///
/// Loaded from external configuration by the caller; immutable once a session
/// starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device family name, e.g. `rx63t`
    pub family: String,
    /// Serial device path, e.g. `/dev/ttyUSB0`
    pub serial_path: String,
    /// Baud rate used to open the port, before negotiation
    pub initial_baud: u32,
    /// Input clock the target board runs the device at
    pub target_clock_hz: u32,
}

/// Lifecycle of a session; flash operations are accepted only from `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Erasing,
    Writing,
    Reading,
    Ended,
}

/// An active programming session with one device
pub struct Programmer {
    connection: Option<Connection>,
    target: Box<dyn Target>,
    chip: Chip,
    state: SessionState,
    negotiated_baud: u32,
}

impl Programmer {
    /// Open the descriptor's serial path and establish a session.
    ///
    /// An unrecognized family is rejected before the port is opened. A failed
    /// handshake yields an error and no session object; negotiation state
    /// cannot be trusted after a failure, so the only retry is a fresh
    /// `start`.
    pub fn start(descriptor: &DeviceDescriptor) -> Result<Self, Error> {
        let chip = Self::family(descriptor)?;
        let connection = Connection::open(&descriptor.serial_path, descriptor.initial_baud)?;

        Self::connect(chip, connection, descriptor.target_clock_hz)
    }

    /// Establish a session over an already open [Connection].
    pub fn with_connection(
        descriptor: &DeviceDescriptor,
        connection: Connection,
    ) -> Result<Self, Error> {
        let chip = Self::family(descriptor)?;

        Self::connect(chip, connection, descriptor.target_clock_hz)
    }

    fn family(descriptor: &DeviceDescriptor) -> Result<Chip, Error> {
        Chip::from_str(&descriptor.family)
            .map_err(|_| ConnectError::UnsupportedDevice(descriptor.family.clone()).into())
    }

    fn connect(
        chip: Chip,
        mut connection: Connection,
        target_clock_hz: u32,
    ) -> Result<Self, Error> {
        let mut target = chip.into_target();

        debug!("Connecting to {chip}");
        let negotiated_baud = target.connect(&mut connection, target_clock_hz)?;
        info!("Connected to {chip} at {negotiated_baud} baud");

        Ok(Programmer {
            connection: Some(connection),
            target,
            chip,
            state: SessionState::Ready,
            negotiated_baud,
        })
    }

    /// The family this session is bound to
    pub fn chip(&self) -> Chip {
        self.chip
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The baud rate fixed by the handshake, immutable for the session
    pub fn negotiated_baud(&self) -> u32 {
        self.negotiated_baud
    }

    pub fn geometry(&self) -> &FlashGeometry {
        self.target.geometry()
    }

    /// Run one flash operation: leave `Ready`, delegate to the variant,
    /// return to `Ready`. The intermediate state is never observable through
    /// the public API.
    fn dispatch<T, F>(
        &mut self,
        operation: &'static str,
        busy: SessionState,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(&mut dyn Target, &mut Connection) -> Result<T, Error>,
    {
        if self.state != SessionState::Ready {
            return Err(Error::InvalidState {
                operation,
                state: self.state,
            });
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(Error::InvalidState {
                operation,
                state: self.state,
            });
        };

        self.state = busy;
        let result = f(self.target.as_mut(), connection);
        self.state = SessionState::Ready;

        result
    }

    /// Erase the block containing `address`.
    pub fn erase_page(&mut self, address: u32) -> Result<(), Error> {
        self.dispatch("erase", SessionState::Erasing, |target, connection| {
            target.erase_page(connection, address)
        })
    }

    /// Select the flash area subsequent page writes go to.
    pub fn select_write_area(&mut self, area: WriteArea) -> Result<(), Error> {
        self.dispatch("select write area", SessionState::Writing, |target, connection| {
            target.select_write_area(connection, area)
        })
    }

    /// Program one page of exactly `page_size` bytes.
    pub fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.dispatch("write", SessionState::Writing, |target, connection| {
            target.write_page(connection, address, data)
        })
    }

    /// Signal that no more pages follow.
    pub fn finish_write(&mut self) -> Result<(), Error> {
        self.dispatch("finish write", SessionState::Writing, |target, connection| {
            target.finish_write(connection)
        })
    }

    /// Read `length` bytes starting at `address`.
    pub fn read(&mut self, address: u32, length: u32) -> Result<Vec<u8>, Error> {
        self.dispatch("read", SessionState::Reading, |target, connection| {
            target.read(connection, address, length)
        })
    }

    /// Read back `expected.len()` bytes at `address` and compare byte for
    /// byte on the host. No device-side verify feature is involved, so the
    /// comparison is meaningful even where the loader offers none.
    pub fn verify(&mut self, address: u32, expected: &[u8]) -> Result<VerifyResult, Error> {
        let actual = self.read(address, expected.len() as u32)?;

        Ok(VerifyResult::compare(address, expected, &actual))
    }

    /// End the session: best-effort device reset, then close the transport.
    ///
    /// Valid in any state and idempotent; the transport is closed exactly
    /// once.
    pub fn end(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            self.target.end(&mut connection);
            debug!("Session ended, closing transport");
        }
        self.state = SessionState::Ended;
    }
}

impl Drop for Programmer {
    fn drop(&mut self) {
        if self.connection.is_some() {
            debug!("Session dropped without end()");
            self.end();
        }
    }
}
