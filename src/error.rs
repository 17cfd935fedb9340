//! Library errors

use std::io;

use miette::Diagnostic;
use strum::VariantNames;
use thiserror::Error;

use crate::{programmer::SessionState, targets::Chip};

/// All possible errors returned by rxflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connect(#[from] ConnectError),

    #[error("Erase operation failed")]
    #[diagnostic(transparent)]
    Erase(#[from] EraseError),

    #[error("Write operation failed")]
    #[diagnostic(transparent)]
    Write(#[from] WriteError),

    #[error("Read operation failed")]
    #[diagnostic(transparent)]
    Read(#[from] ReadError),

    #[error("Received frame could not be decoded")]
    #[diagnostic(transparent)]
    Frame(#[from] FrameError),

    #[error("Serial transport error")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Verify(#[from] VerifyMismatch),

    #[error("Cannot {operation} while the session is {state}")]
    #[diagnostic(
        code(rxflash::invalid_state),
        help("Flash operations are only accepted while the session is ready; create a new session if this one has ended")
    )]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

/// Errors establishing a session with a device
///
/// None of these are retried in place: baud and clock negotiation state
/// cannot be trusted after a failed handshake, so recovery is always a fresh
/// session.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("Timed out while {0}")]
    #[diagnostic(code(rxflash::connect::timeout))]
    Timeout(&'static str),

    #[error("No baud rate in the device's table produced a consistent timing reply")]
    #[diagnostic(
        code(rxflash::connect::no_common_baud),
        help("Check that the device is held in boot mode and that the configured input clock matches the board")
    )]
    NoCommonBaud,

    #[error("Device stopped responding during the handshake")]
    #[diagnostic(
        code(rxflash::connect::not_responding),
        help("Power-cycle the device into boot mode and try again")
    )]
    DeviceNotResponding,

    #[error("Unrecognized device family: '{0}'")]
    #[diagnostic(
        code(rxflash::connect::unsupported_device),
        help("Supported families are: {}", Chip::VARIANTS.join(", "))
    )]
    UnsupportedDevice(String),
}

/// Structural problems with a received frame; decoding fails closed
#[derive(Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    #[error("Expected frame start marker, found {found:#04x}")]
    #[diagnostic(code(rxflash::frame::bad_start))]
    BadStart { found: u8 },

    #[error("Frame ended early: expected {expected} bytes, found {found}")]
    #[diagnostic(code(rxflash::frame::truncated))]
    Truncated { expected: usize, found: usize },

    #[error("Declared payload length {length} exceeds the frame limit")]
    #[diagnostic(code(rxflash::frame::oversized))]
    Oversized { length: usize },

    #[error("Frame checksum mismatch: expected {expected:#04x}, found {found:#04x}")]
    #[diagnostic(code(rxflash::frame::checksum))]
    Checksum { expected: u8, found: u8 },

    #[error("Reply carries opcode {found:#04x}, expected {expected:#04x}")]
    #[diagnostic(
        code(rxflash::frame::unexpected_reply),
        help("The command/response pairing is out of step; end the session and reconnect")
    )]
    UnexpectedReply { expected: u8, found: u8 },
}

/// Errors erasing a flash page
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum EraseError {
    #[error("Erase address {address:#010x} is not on an erase boundary inside a known flash region")]
    #[diagnostic(code(rxflash::erase::out_of_range))]
    OutOfRange { address: u32 },

    #[error("Device rejected erase of {address:#010x}")]
    #[diagnostic(code(rxflash::erase::rejected))]
    DeviceRejected {
        address: u32,
        #[source]
        status: DeviceStatus,
    },

    #[error("No valid response to erase of {address:#010x}")]
    #[diagnostic(code(rxflash::erase::no_response))]
    NoResponse { address: u32 },
}

/// Errors writing a flash page
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum WriteError {
    #[error("Page data must be exactly {expected} bytes, got {found}")]
    #[diagnostic(code(rxflash::write::bad_length))]
    BadLength { expected: usize, found: usize },

    #[error("No write area selected")]
    #[diagnostic(
        code(rxflash::write::no_area),
        help("Select the user or data area before writing pages")
    )]
    NoWriteAreaSelected,

    #[error("Device rejected write to {address:#010x}")]
    #[diagnostic(code(rxflash::write::rejected))]
    DeviceRejected {
        address: u32,
        #[source]
        status: DeviceStatus,
    },

    #[error("No valid response to write at {address:#010x}")]
    #[diagnostic(code(rxflash::write::no_response))]
    NoResponse { address: u32 },
}

/// Errors reading back memory
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ReadError {
    #[error("Read span {address:#010x}+{length:#x} is outside every known flash region")]
    #[diagnostic(code(rxflash::read::out_of_range))]
    OutOfRange { address: u32, length: u32 },

    #[error("Device rejected read at {address:#010x}")]
    #[diagnostic(code(rxflash::read::rejected))]
    DeviceRejected {
        address: u32,
        #[source]
        status: DeviceStatus,
    },

    #[error("No valid response to read at {address:#010x}")]
    #[diagnostic(code(rxflash::read::no_response))]
    NoResponse { address: u32 },
}

/// Transport-level errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Serial read timed out")]
    #[diagnostic(code(rxflash::serial::timeout))]
    Timeout,

    #[error("Serial port not found")]
    #[diagnostic(
        code(rxflash::serial::not_found),
        help("Check that the device is connected and the configured path is correct")
    )]
    DeviceNotFound,

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(rxflash::serial::io))]
    Serial(#[source] serialport::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => from_error_kind(kind, err),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

fn from_error_kind<E>(kind: io::ErrorKind, err: E) -> ConnectionError
where
    E: Into<serialport::Error>,
{
    use io::ErrorKind;

    match kind {
        ErrorKind::TimedOut => ConnectionError::Timeout,
        ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

/// Status byte carried by a device NAK
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, PartialEq, Eq, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum DeviceStatus {
    #[error("Frame checksum rejected by device")]
    #[diagnostic(code(rxflash::device::checksum))]
    ChecksumMismatch = 0x11,

    #[error("Device code mismatch")]
    #[diagnostic(code(rxflash::device::device_code))]
    DeviceCodeMismatch = 0x21,

    #[error("Clock mode not supported")]
    #[diagnostic(code(rxflash::device::clock_mode))]
    ClockModeInvalid = 0x22,

    #[error("Bit rate could not be matched")]
    #[diagnostic(code(rxflash::device::bit_rate))]
    BitRateUnmatched = 0x24,

    #[error("Block number invalid")]
    #[diagnostic(code(rxflash::device::block))]
    BlockInvalid = 0x29,

    #[error("Address invalid")]
    #[diagnostic(code(rxflash::device::address))]
    AddressInvalid = 0x2A,

    #[error("Data length invalid")]
    #[diagnostic(code(rxflash::device::length))]
    LengthInvalid = 0x2B,

    #[error("Erasure failed")]
    #[diagnostic(code(rxflash::device::erase))]
    EraseFailed = 0x51,

    #[error("Programming failed")]
    #[diagnostic(code(rxflash::device::program))]
    ProgramFailed = 0x52,

    #[error("Target area is protected")]
    #[diagnostic(code(rxflash::device::protected))]
    Protected = 0x53,

    #[default]
    #[error("Other")]
    #[diagnostic(code(rxflash::device::other))]
    Other = 0xFF,
}

impl From<u8> for DeviceStatus {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// Read-back comparison that found differing bytes
///
/// Produced from a [VerifyResult](crate::sequencer::VerifyResult) when a
/// caller wants mismatches to be hard failures; the sequencer itself reports
/// them as data.
#[derive(Debug, Diagnostic, Error, Clone, Copy, PartialEq, Eq)]
#[error("Verify failed at {address:#010x}: {mismatch_count} differing byte(s)")]
#[diagnostic(code(rxflash::verify::mismatch))]
pub struct VerifyMismatch {
    pub address: u32,
    pub mismatch_count: u32,
    pub first_mismatch_offset: Option<u32>,
}
