//! Serial boot-mode flash programming for RX-family microcontrollers
//!
//! Connects to a device's mask-ROM loader over a serial port, negotiates the
//! communication rate, and drives the erase/write/read/verify cycle through a
//! family-specific protocol variant.

pub mod command;
pub mod connection;
pub mod error;
pub mod frame;
pub mod interface;
pub mod programmer;
pub mod sequencer;
pub mod targets;

pub use self::{
    connection::Connection,
    error::Error,
    interface::Interface,
    programmer::{DeviceDescriptor, Programmer, SessionState},
    targets::{Chip, FlashGeometry, MemoryRegion, Target, WriteArea},
};
