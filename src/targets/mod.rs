//! Programmable target devices
//!
//! Every supported family boots into a mask-ROM serial loader speaking the
//! framed command protocol; the families differ in opcode assignments, device
//! codes, clock parameters and flash geometry. A new family is added by
//! implementing [Target], not by touching the session dispatcher.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::{command::OpTable, connection::Connection, error::Error};

pub use self::{rx24t::Rx24t, rx63t::Rx63t, rx64m::Rx64m};

mod romproto;
mod rx24t;
mod rx63t;
mod rx64m;

/// All supported device families
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    /// RX63T
    Rx63t,
    /// RX24T
    Rx24t,
    /// RX64M
    Rx64m,
}

impl Chip {
    pub fn into_target(&self) -> Box<dyn Target> {
        match self {
            Chip::Rx63t => Box::new(Rx63t::new()),
            Chip::Rx24t => Box::new(Rx24t::new()),
            Chip::Rx64m => Box::new(Rx64m::new()),
        }
    }

    /// The family's static flash layout
    pub fn geometry(&self) -> &'static FlashGeometry {
        &self.params().geometry
    }

    pub(crate) fn params(&self) -> &'static FamilyParams {
        match self {
            Chip::Rx63t => &rx63t::PARAMS,
            Chip::Rx24t => &rx24t::PARAMS,
            Chip::Rx64m => &rx64m::PARAMS,
        }
    }
}

/// One of the distinct flash regions a family exposes for writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteArea {
    /// Code flash
    User,
    /// Data flash
    Data,
}

/// A contiguous span of device addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u32,
    pub length: u32,
}

impl MemoryRegion {
    pub const fn new(start: u32, length: u32) -> Self {
        MemoryRegion { start, length }
    }

    /// Does `[address, address + length)` fall entirely inside this region?
    pub fn contains_span(&self, address: u32, length: u32) -> bool {
        let start = self.start as u64;
        let end = start + self.length as u64;
        let span_start = address as u64;
        let span_end = span_start + length as u64;

        span_start >= start && span_end <= end
    }
}

/// Static flash layout of one family; never mutated at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashGeometry {
    /// Bytes programmed by a single write command
    pub page_size: usize,
    /// Alignment and minimum size of a single erase
    pub erase_granularity: u32,
    /// Code flash
    pub user_area: MemoryRegion,
    /// Data flash, where the family has one
    pub data_area: Option<MemoryRegion>,
}

impl FlashGeometry {
    /// Is `address` a valid erase target: aligned to the erase granularity
    /// and covering a block that lies inside a known flash region?
    pub fn erase_target(&self, address: u32) -> bool {
        if address % self.erase_granularity != 0 {
            return false;
        }

        self.contains_span(address, self.erase_granularity)
    }

    /// Does the span fall entirely inside the user or data area?
    pub fn contains_span(&self, address: u32, length: u32) -> bool {
        self.user_area.contains_span(address, length)
            || self
                .data_area
                .is_some_and(|data| data.contains_span(address, length))
    }

    pub(crate) fn area_start(&self, area: WriteArea) -> u32 {
        match area {
            WriteArea::User => self.user_area.start,
            WriteArea::Data => self.data_area.map(|data| data.start).unwrap_or_default(),
        }
    }
}

/// Family-specific protocol constants
#[derive(Debug)]
pub struct FamilyParams {
    /// Identity exchanged during the handshake
    pub device_code: u32,
    /// Clock mode announced after device selection
    pub clock_mode: u8,
    /// Baud candidates, highest first
    pub baud_table: &'static [u32],
    /// Divisor applied to the peripheral clock per bit
    pub baud_divisor_unit: u32,
    /// Input clock to peripheral clock multiplier
    pub pclk_multiplier: u32,
    /// Opcode assignments
    pub ops: OpTable,
    pub geometry: FlashGeometry,
}

impl FamilyParams {
    /// The baud rate implied by a device timing-reference byte, given the
    /// configured input clock.
    pub fn implied_baud(&self, input_clock_hz: u32, timing: u8) -> u32 {
        let pclk = input_clock_hz as u64 * self.pclk_multiplier as u64;

        (pclk / (self.baud_divisor_unit as u64 * timing as u64)) as u32
    }
}

/// Operations every device protocol variant implements
///
/// All methods borrow the session's [Connection]; the half-duplex
/// command/response pairing is enforced by this structure, not by locking.
pub trait Target {
    fn chip(&self) -> Chip;

    fn geometry(&self) -> &FlashGeometry;

    /// Negotiate a baud rate and complete the device-ID/clock exchange;
    /// returns the negotiated baud.
    fn connect(
        &mut self,
        connection: &mut Connection,
        target_clock_hz: u32,
    ) -> Result<u32, Error>;

    /// Erase the block at `address`, which must be erase-aligned and inside
    /// a known flash region.
    fn erase_page(&mut self, connection: &mut Connection, address: u32) -> Result<(), Error>;

    /// Select which flash area subsequent page writes program.
    fn select_write_area(
        &mut self,
        connection: &mut Connection,
        area: WriteArea,
    ) -> Result<(), Error>;

    /// Program one page; `data` must be exactly `page_size` bytes.
    fn write_page(
        &mut self,
        connection: &mut Connection,
        address: u32,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Send the family's "no more pages" sentinel and clear the area
    /// selection.
    fn finish_write(&mut self, connection: &mut Connection) -> Result<(), Error>;

    /// Read `length` bytes starting at `address`, split into as many frames
    /// as needed and concatenated in address order.
    fn read(
        &mut self,
        connection: &mut Connection,
        address: u32,
        length: u32,
    ) -> Result<Vec<u8>, Error>;

    /// Best-effort session end; never fails from the caller's perspective.
    fn end(&mut self, connection: &mut Connection);
}
