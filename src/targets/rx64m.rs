//! RX64M family support

use super::{
    romproto::{self, ProtocolState},
    Chip, FamilyParams, FlashGeometry, MemoryRegion, Target, WriteArea,
};
use crate::{command::OpTable, connection::Connection, error::Error};

pub(crate) static PARAMS: FamilyParams = FamilyParams {
    device_code: 0x5236_344D,
    clock_mode: 0x02,
    baud_table: &[115_200, 57_600, 38_400, 19_200, 9_600],
    baud_divisor_unit: 32,
    pclk_multiplier: 4,
    ops: OpTable {
        select_device: 0x10,
        set_clock_mode: 0x11,
        set_bit_rate: 0x3F,
        // Newer loader generation renumbered the flash commands
        erase_page: 0x58,
        select_user_area: 0x47,
        select_data_area: 0x46,
        write_page: 0x54,
        read_memory: 0x56,
        end: 0x40,
    },
    geometry: FlashGeometry {
        page_size: 256,
        erase_granularity: 0x2000,
        // 4 MiB of code flash at the top of the address space
        user_area: MemoryRegion::new(0xFFC0_0000, 0x0040_0000),
        // 64 KiB of data flash
        data_area: Some(MemoryRegion::new(0x0010_0000, 0x0001_0000)),
    },
};

/// RX64M target
pub struct Rx64m {
    state: ProtocolState,
}

impl Rx64m {
    pub fn new() -> Self {
        Rx64m {
            state: ProtocolState::new(),
        }
    }
}

impl Default for Rx64m {
    fn default() -> Self {
        Self::new()
    }
}

impl Target for Rx64m {
    fn chip(&self) -> Chip {
        Chip::Rx64m
    }

    fn geometry(&self) -> &FlashGeometry {
        &PARAMS.geometry
    }

    fn connect(
        &mut self,
        connection: &mut Connection,
        target_clock_hz: u32,
    ) -> Result<u32, Error> {
        romproto::connect(&PARAMS, connection, target_clock_hz)
    }

    fn erase_page(&mut self, connection: &mut Connection, address: u32) -> Result<(), Error> {
        romproto::erase_page(&PARAMS, connection, address)
    }

    fn select_write_area(
        &mut self,
        connection: &mut Connection,
        area: WriteArea,
    ) -> Result<(), Error> {
        romproto::select_write_area(&PARAMS, &mut self.state, connection, area)
    }

    fn write_page(
        &mut self,
        connection: &mut Connection,
        address: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        romproto::write_page(&PARAMS, &mut self.state, connection, address, data)
    }

    fn finish_write(&mut self, connection: &mut Connection) -> Result<(), Error> {
        romproto::finish_write(&PARAMS, &mut self.state, connection)
    }

    fn read(
        &mut self,
        connection: &mut Connection,
        address: u32,
        length: u32,
    ) -> Result<Vec<u8>, Error> {
        romproto::read(&PARAMS, connection, address, length)
    }

    fn end(&mut self, connection: &mut Connection) {
        romproto::end(&PARAMS, connection)
    }
}
