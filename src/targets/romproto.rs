//! Shared boot-ROM command sequences
//!
//! The supported families speak the same protocol shape and differ only in
//! the constants carried by their [FamilyParams]: opcodes, device code, clock
//! mode, baud table and flash geometry. The sequences here implement that
//! shared shape once; family modules supply the constants.

use std::time::Duration;

use log::{debug, warn};

use crate::{
    command::{Command, FINISH_SENTINEL_ADDRESS, NAK_BIT},
    connection::Connection,
    error::{
        ConnectError, ConnectionError, DeviceStatus, EraseError, Error, FrameError, ReadError,
        WriteError,
    },
    frame::Frame,
    targets::{FamilyParams, WriteArea},
};

/// Transmission attempts per command before the failure escalates
pub(crate) const COMMAND_ATTEMPTS: usize = 3;

/// Sync probes sent per baud candidate before moving down the table
const SYNC_PROBE_ATTEMPTS: usize = 30;

/// Accepted deviation between a candidate baud and the rate implied by the
/// device's timing reference, in percent
const BAUD_TOLERANCE_PERCENT: u32 = 4;

/// Largest span requested in a single read frame; longer reads are split and
/// concatenated in address order
const READ_CHUNK: u32 = 256;

const PROBE_TIMEOUT: Duration = Duration::from_millis(100);
const TIMING_TIMEOUT: Duration = Duration::from_millis(500);

/// Probe byte sent while hunting for a common baud rate
const SYNC_PROBE: u8 = 0x00;
/// Boot ROM's acknowledgement that it locked onto the probe rate
const SYNC_ACK: u8 = 0xE6;
/// Confirmation byte that requests the device's timing reference
const SYNC_CONFIRM: u8 = 0x55;

/// Per-session protocol state a family carries between calls
#[derive(Debug, Default)]
pub(crate) struct ProtocolState {
    write_area: Option<WriteArea>,
}

impl ProtocolState {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

/// A decoded, checksum-valid reply to one command
pub(crate) enum Reply {
    Ack(Frame),
    Nak(DeviceStatus),
}

/// Send `command` and await its reply, retrying transmission on timeouts and
/// corrupted frames up to the fixed budget. Rejections and well-formed but
/// mispaired replies are never retried.
pub(crate) fn transact(
    connection: &mut Connection,
    params: &FamilyParams,
    command: &Command<'_>,
) -> Result<Reply, Error> {
    let kind = command.kind();
    let expected = params.ops.opcode(kind);
    let encoded = command.frame(&params.ops).encode();

    let mut last_err = Error::Connection(ConnectionError::Timeout);
    for attempt in 1..=COMMAND_ATTEMPTS {
        if attempt > 1 {
            debug!("Retrying {kind} command, attempt {attempt}/{COMMAND_ATTEMPTS}");
        }

        connection.clear_input()?;
        connection.write_all(&encoded)?;

        match connection.with_timeout(kind.timeout(), |connection| Frame::read_from(connection)) {
            Ok(frame) if frame.code == expected => return Ok(Reply::Ack(frame)),
            Ok(frame) if frame.code == expected | NAK_BIT => {
                let status = frame.payload.first().copied().unwrap_or(0xFF);
                return Ok(Reply::Nak(status.into()));
            }
            Ok(frame) => {
                return Err(FrameError::UnexpectedReply {
                    expected,
                    found: frame.code,
                }
                .into());
            }
            Err(err @ Error::Connection(ConnectionError::Timeout))
            | Err(err @ Error::Frame(FrameError::Checksum { .. })) => {
                last_err = err;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err)
}

/// True when every attempt was spent without a decodable reply
fn no_response(err: &Error) -> bool {
    matches!(
        err,
        Error::Connection(ConnectionError::Timeout) | Error::Frame(FrameError::Checksum { .. })
    )
}

/// Negotiate a baud rate and run the device-ID/clock exchange.
///
/// Walks the family's descending baud table; at each candidate the host sends
/// sync probes until the ROM acknowledges, then checks that the rate implied
/// by the device's timing reference agrees with the candidate within
/// tolerance. Returns the negotiated baud.
pub(crate) fn connect(
    params: &FamilyParams,
    connection: &mut Connection,
    target_clock_hz: u32,
) -> Result<u32, Error> {
    for &candidate in params.baud_table {
        connection.set_baud(candidate)?;
        connection.clear_input()?;

        if !probe_sync(connection)? {
            debug!("No sync acknowledgement at {candidate} baud");
            continue;
        }

        let timing = read_timing_reference(connection)?;
        if timing == 0 {
            debug!("Device returned a null timing reference at {candidate} baud");
            continue;
        }

        let implied = params.implied_baud(target_clock_hz, timing);
        if !within_tolerance(implied, candidate) {
            debug!(
                "Timing reference {timing:#04x} implies {implied} baud, candidate {candidate} out of tolerance"
            );
            continue;
        }

        debug!("Synchronized at {candidate} baud (device timing implies {implied})");
        establish(params, connection, target_clock_hz)?;

        return Ok(candidate);
    }

    Err(ConnectError::NoCommonBaud.into())
}

fn probe_sync(connection: &mut Connection) -> Result<bool, Error> {
    connection.with_timeout(PROBE_TIMEOUT, |connection| {
        for _ in 0..SYNC_PROBE_ATTEMPTS {
            connection.write_all(&[SYNC_PROBE])?;

            match connection.read_byte() {
                Ok(SYNC_ACK) => return Ok(true),
                // Noise from a mismatched rate decodes as arbitrary bytes;
                // keep probing until the attempt budget runs out.
                Ok(_) => continue,
                Err(Error::Connection(ConnectionError::Timeout)) => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(false)
    })
}

fn read_timing_reference(connection: &mut Connection) -> Result<u8, Error> {
    connection.with_timeout(TIMING_TIMEOUT, |connection| {
        connection.write_all(&[SYNC_CONFIRM])?;

        match connection.read_byte() {
            Ok(timing) => Ok(timing),
            // The ROM acknowledged the probe rate and then went silent;
            // unlike an unanswered probe this is not a baud mismatch, so
            // walking further down the table cannot help.
            Err(Error::Connection(ConnectionError::Timeout)) => {
                Err(ConnectError::Timeout("waiting for the timing reference").into())
            }
            Err(err) => Err(err),
        }
    })
}

fn within_tolerance(implied: u32, candidate: u32) -> bool {
    let delta = implied.abs_diff(candidate) as u64;
    delta * 100 <= candidate as u64 * BAUD_TOLERANCE_PERCENT as u64
}

/// Device-ID and clock-mode exchange required before any flash operation
fn establish(
    params: &FamilyParams,
    connection: &mut Connection,
    target_clock_hz: u32,
) -> Result<(), Error> {
    let baud = connection.baud();
    let sequence = [
        Command::SelectDevice {
            code: params.device_code,
        },
        Command::SetClockMode {
            mode: params.clock_mode,
        },
        Command::SetBitRate {
            baud,
            input_clock_hz: target_clock_hz,
        },
    ];

    for command in &sequence {
        match transact(connection, params, command) {
            Ok(Reply::Ack(_)) => {}
            Ok(Reply::Nak(status)) => {
                warn!("Device rejected {} during handshake: {status}", command.kind());
                return Err(ConnectError::DeviceNotResponding.into());
            }
            Err(err) if no_response(&err) => {
                return Err(ConnectError::DeviceNotResponding.into());
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

pub(crate) fn erase_page(
    params: &FamilyParams,
    connection: &mut Connection,
    address: u32,
) -> Result<(), Error> {
    let geometry = &params.geometry;
    if !geometry.erase_target(address) {
        return Err(EraseError::OutOfRange { address }.into());
    }

    match transact(connection, params, &Command::ErasePage { address }) {
        Ok(Reply::Ack(_)) => Ok(()),
        Ok(Reply::Nak(status)) => Err(EraseError::DeviceRejected { address, status }.into()),
        Err(err) if no_response(&err) => Err(EraseError::NoResponse { address }.into()),
        Err(err) => Err(err),
    }
}

pub(crate) fn select_write_area(
    params: &FamilyParams,
    state: &mut ProtocolState,
    connection: &mut Connection,
    area: WriteArea,
) -> Result<(), Error> {
    let command = match area {
        WriteArea::User => Command::SelectUserArea,
        WriteArea::Data => Command::SelectDataArea,
    };
    let region_start = params.geometry.area_start(area);

    match transact(connection, params, &command) {
        Ok(Reply::Ack(_)) => {
            state.write_area = Some(area);
            Ok(())
        }
        Ok(Reply::Nak(status)) => Err(WriteError::DeviceRejected {
            address: region_start,
            status,
        }
        .into()),
        Err(err) if no_response(&err) => Err(WriteError::NoResponse {
            address: region_start,
        }
        .into()),
        Err(err) => Err(err),
    }
}

pub(crate) fn write_page(
    params: &FamilyParams,
    state: &mut ProtocolState,
    connection: &mut Connection,
    address: u32,
    data: &[u8],
) -> Result<(), Error> {
    if state.write_area.is_none() {
        return Err(WriteError::NoWriteAreaSelected.into());
    }

    let page_size = params.geometry.page_size;
    if data.len() != page_size {
        return Err(WriteError::BadLength {
            expected: page_size,
            found: data.len(),
        }
        .into());
    }

    match transact(connection, params, &Command::WritePage { address, data }) {
        Ok(Reply::Ack(_)) => Ok(()),
        Ok(Reply::Nak(status)) => Err(WriteError::DeviceRejected { address, status }.into()),
        Err(err) if no_response(&err) => Err(WriteError::NoResponse { address }.into()),
        Err(err) => Err(err),
    }
}

/// Send the sentinel "no more pages" write and clear the area selection.
pub(crate) fn finish_write(
    params: &FamilyParams,
    state: &mut ProtocolState,
    connection: &mut Connection,
) -> Result<(), Error> {
    if state.write_area.is_none() {
        return Err(WriteError::NoWriteAreaSelected.into());
    }

    match transact(connection, params, &Command::FinishWrite) {
        Ok(Reply::Ack(_)) => {
            state.write_area = None;
            Ok(())
        }
        Ok(Reply::Nak(status)) => Err(WriteError::DeviceRejected {
            address: FINISH_SENTINEL_ADDRESS,
            status,
        }
        .into()),
        Err(err) if no_response(&err) => Err(WriteError::NoResponse {
            address: FINISH_SENTINEL_ADDRESS,
        }
        .into()),
        Err(err) => Err(err),
    }
}

pub(crate) fn read(
    params: &FamilyParams,
    connection: &mut Connection,
    address: u32,
    length: u32,
) -> Result<Vec<u8>, Error> {
    if !params.geometry.contains_span(address, length) {
        return Err(ReadError::OutOfRange { address, length }.into());
    }

    let mut out = Vec::with_capacity(length as usize);
    let mut cursor = address;
    let mut remaining = length;

    while remaining > 0 {
        let chunk = remaining.min(READ_CHUNK);
        let reply = transact(
            connection,
            params,
            &Command::Read {
                address: cursor,
                length: chunk,
            },
        );

        let frame = match reply {
            Ok(Reply::Ack(frame)) => frame,
            Ok(Reply::Nak(status)) => {
                return Err(ReadError::DeviceRejected {
                    address: cursor,
                    status,
                }
                .into());
            }
            Err(err) if no_response(&err) => {
                return Err(ReadError::NoResponse { address: cursor }.into());
            }
            Err(err) => return Err(err),
        };

        if frame.payload.len() != chunk as usize {
            return Err(FrameError::Truncated {
                expected: chunk as usize,
                found: frame.payload.len(),
            }
            .into());
        }

        out.extend_from_slice(&frame.payload);
        cursor = cursor.wrapping_add(chunk);
        remaining -= chunk;
    }

    Ok(out)
}

/// Best-effort end-of-session command. The session is over regardless of the
/// outcome, so failures are logged rather than propagated.
pub(crate) fn end(params: &FamilyParams, connection: &mut Connection) {
    match transact(connection, params, &Command::End) {
        Ok(Reply::Ack(_)) => debug!("Device acknowledged end of session"),
        Ok(Reply::Nak(status)) => warn!("Device rejected end of session: {status}"),
        Err(err) => warn!("No response to end of session: {err}"),
    }
}
