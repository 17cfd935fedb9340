//! Commands understood by the boot-mode loader
//!
//! Command *kinds* and payload layouts are shared across the supported
//! families; the opcode byte assigned to each kind is family configuration,
//! supplied through an [OpTable].

use std::time::Duration;

use strum::Display;

use crate::frame::Frame;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_TIMEOUT: Duration = Duration::from_secs(12);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const END_TIMEOUT: Duration = Duration::from_millis(500);

/// Address sent by the finalizing write that signals "no more pages"
pub const FINISH_SENTINEL_ADDRESS: u32 = 0xFFFF_FFFF;

/// Set on a reply opcode when the device rejects a command; the payload then
/// carries a [DeviceStatus](crate::error::DeviceStatus) byte
pub const NAK_BIT: u8 = 0x80;

/// Types of commands that can be sent to a target device
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommandKind {
    SelectDevice,
    SetClockMode,
    SetBitRate,
    ErasePage,
    SelectUserArea,
    SelectDataArea,
    WritePage,
    FinishWrite,
    Read,
    End,
}

impl CommandKind {
    /// Response deadline for this command; erase and write wait on the
    /// device's internal flash state machine and get longer budgets.
    pub fn timeout(&self) -> Duration {
        match self {
            CommandKind::ErasePage => ERASE_TIMEOUT,
            CommandKind::WritePage | CommandKind::FinishWrite => WRITE_TIMEOUT,
            CommandKind::End => END_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

/// Opcode byte assigned to each command kind by one chip family
#[derive(Debug, Clone, Copy)]
pub struct OpTable {
    pub select_device: u8,
    pub set_clock_mode: u8,
    pub set_bit_rate: u8,
    pub erase_page: u8,
    pub select_user_area: u8,
    pub select_data_area: u8,
    pub write_page: u8,
    pub read_memory: u8,
    pub end: u8,
}

impl OpTable {
    pub fn opcode(&self, kind: CommandKind) -> u8 {
        match kind {
            CommandKind::SelectDevice => self.select_device,
            CommandKind::SetClockMode => self.set_clock_mode,
            CommandKind::SetBitRate => self.set_bit_rate,
            CommandKind::ErasePage => self.erase_page,
            CommandKind::SelectUserArea => self.select_user_area,
            CommandKind::SelectDataArea => self.select_data_area,
            CommandKind::WritePage | CommandKind::FinishWrite => self.write_page,
            CommandKind::Read => self.read_memory,
            CommandKind::End => self.end,
        }
    }
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    SelectDevice { code: u32 },
    SetClockMode { mode: u8 },
    SetBitRate { baud: u32, input_clock_hz: u32 },
    ErasePage { address: u32 },
    SelectUserArea,
    SelectDataArea,
    WritePage { address: u32, data: &'a [u8] },
    FinishWrite,
    Read { address: u32, length: u32 },
    End,
}

impl Command<'_> {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SelectDevice { .. } => CommandKind::SelectDevice,
            Command::SetClockMode { .. } => CommandKind::SetClockMode,
            Command::SetBitRate { .. } => CommandKind::SetBitRate,
            Command::ErasePage { .. } => CommandKind::ErasePage,
            Command::SelectUserArea => CommandKind::SelectUserArea,
            Command::SelectDataArea => CommandKind::SelectDataArea,
            Command::WritePage { .. } => CommandKind::WritePage,
            Command::FinishWrite => CommandKind::FinishWrite,
            Command::Read { .. } => CommandKind::Read,
            Command::End => CommandKind::End,
        }
    }

    /// Build the wire frame for this command using a family's opcodes.
    ///
    /// Addresses and lengths travel big-endian.
    pub fn frame(&self, ops: &OpTable) -> Frame {
        let payload: Vec<u8> = match *self {
            Command::SelectDevice { code } => code.to_be_bytes().to_vec(),
            Command::SetClockMode { mode } => vec![mode],
            Command::SetBitRate {
                baud,
                input_clock_hz,
            } => {
                let mut payload = baud.to_be_bytes().to_vec();
                payload.extend_from_slice(&input_clock_hz.to_be_bytes());
                payload
            }
            Command::ErasePage { address } => address.to_be_bytes().to_vec(),
            Command::SelectUserArea | Command::SelectDataArea | Command::End => Vec::new(),
            Command::WritePage { address, data } => {
                let mut payload = address.to_be_bytes().to_vec();
                payload.extend_from_slice(data);
                payload
            }
            Command::FinishWrite => FINISH_SENTINEL_ADDRESS.to_be_bytes().to_vec(),
            Command::Read { address, length } => {
                let mut payload = address.to_be_bytes().to_vec();
                payload.extend_from_slice(&length.to_be_bytes());
                payload
            }
        };

        Frame::new(ops.opcode(self.kind()), payload)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const OPS: OpTable = OpTable {
        select_device: 0x10,
        set_clock_mode: 0x11,
        set_bit_rate: 0x3F,
        erase_page: 0x59,
        select_user_area: 0x43,
        select_data_area: 0x42,
        write_page: 0x50,
        read_memory: 0x52,
        end: 0x40,
    };

    #[test]
    fn erase_frame_layout() {
        let frame = Command::ErasePage {
            address: 0xFFF8_0000,
        }
        .frame(&OPS);

        assert_eq!(frame.code, 0x59);
        assert_eq!(frame.payload, vec![0xFF, 0xF8, 0x00, 0x00]);
    }

    #[test]
    fn write_frame_carries_address_then_data() {
        let data = [0xA5u8; 4];
        let frame = Command::WritePage {
            address: 0x0010_0000,
            data: &data,
        }
        .frame(&OPS);

        assert_eq!(frame.code, 0x50);
        assert_eq!(frame.payload[..4], [0x00, 0x10, 0x00, 0x00]);
        assert_eq!(&frame.payload[4..], &data);
    }

    #[test]
    fn finish_write_is_a_sentinel_page() {
        let frame = Command::FinishWrite.frame(&OPS);

        assert_eq!(frame.code, OPS.write_page);
        assert_eq!(frame.payload, vec![0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn read_spans_encode_address_and_length() {
        let frame = Command::Read {
            address: 0xFFF8_0100,
            length: 256,
        }
        .frame(&OPS);

        assert_eq!(frame.code, 0x52);
        assert_eq!(
            frame.payload,
            vec![0xFF, 0xF8, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00]
        );
    }
}
