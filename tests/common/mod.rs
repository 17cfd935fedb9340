//! An emulated RX63T boot ROM sitting behind the [Interface] seam
//!
//! Faithful enough for the protocol engine to exercise its real code paths:
//! it only syncs at its supported baud rate, answers the timing-reference
//! exchange from its peripheral clock, validates erase alignment, models
//! flash content, and can be told to drop, corrupt or reject replies.

// Not every test binary uses every knob
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use rxflash::{frame::Frame, Connection, DeviceDescriptor, Interface};

// RX63T constants, mirrored from the family configuration
const DEVICE_CODE: u32 = 0x5263_3354;
const OP_SELECT_DEVICE: u8 = 0x10;
const OP_SET_CLOCK_MODE: u8 = 0x11;
const OP_SET_BIT_RATE: u8 = 0x3F;
const OP_ERASE: u8 = 0x59;
const OP_SELECT_USER: u8 = 0x43;
const OP_SELECT_DATA: u8 = 0x42;
const OP_WRITE: u8 = 0x50;
const OP_READ: u8 = 0x52;
const OP_END: u8 = 0x40;
const NAK: u8 = 0x80;

const PAGE_SIZE: usize = 256;
const ERASE_GRANULARITY: u32 = 0x800;
const USER_START: u32 = 0xFFF8_0000;
const USER_LEN: u32 = 0x0008_0000;
const DATA_START: u32 = 0x0010_0000;
const DATA_LEN: u32 = 0x8000;

/// Peripheral clock the emulated part derives its timing reference from:
/// 12 MHz input clock times the family's x4 multiplier
const PCLK_HZ: u64 = 48_000_000;

pub const INPUT_CLOCK_HZ: u32 = 12_000_000;

pub fn descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        family: "rx63t".into(),
        serial_path: "emulated".into(),
        initial_baud: 115_200,
        target_clock_hz: INPUT_CLOCK_HZ,
    }
}

#[derive(Default)]
struct Inner {
    baud: u32,
    supported_baud: u32,
    timeout: Duration,
    probed: bool,
    synced: bool,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    mem: HashMap<u32, u8>,
    write_area_selected: bool,
    // Fault injection
    silent: bool,
    mute_timing: bool,
    timing_override: Option<u8>,
    corrupt_replies: u32,
    drop_replies: u32,
    nak_next: Option<u8>,
    // Observability
    set_bauds: Vec<u32>,
    frames_handled: u32,
    end_count: u32,
    closes: u32,
}

impl Inner {
    fn process(&mut self, byte: u8) {
        if self.silent {
            return;
        }

        if !self.synced {
            if self.baud != self.supported_baud {
                // The ROM sees line noise at a mismatched rate
                return;
            }
            match byte {
                0x00 if !self.probed => {
                    self.probed = true;
                    self.tx.push_back(0xE6);
                }
                0x55 if self.probed => {
                    if self.mute_timing {
                        return;
                    }
                    let timing = self
                        .timing_override
                        .unwrap_or((PCLK_HZ / (32 * self.supported_baud as u64)) as u8);
                    self.tx.push_back(timing);
                    self.synced = true;
                }
                _ => {}
            }
            return;
        }

        self.rx.push(byte);
        self.pump_frames();
    }

    fn pump_frames(&mut self) {
        loop {
            if self.rx.len() < 5 {
                return;
            }
            let declared = u16::from_be_bytes([self.rx[2], self.rx[3]]) as usize;
            let total = declared + 5;
            if self.rx.len() < total {
                return;
            }

            let bytes: Vec<u8> = self.rx.drain(..total).collect();
            let frame = Frame::decode(&bytes).expect("host sent a malformed frame");
            self.handle(frame);
        }
    }

    fn handle(&mut self, frame: Frame) {
        self.frames_handled += 1;

        if let Some(status) = self.nak_next.take() {
            self.reply(Frame::new(frame.code | NAK, vec![status]));
            return;
        }

        let reply = match frame.code {
            OP_SELECT_DEVICE => {
                if frame.payload == DEVICE_CODE.to_be_bytes() {
                    Frame::new(frame.code, vec![])
                } else {
                    Frame::new(frame.code | NAK, vec![0x21])
                }
            }
            OP_SET_CLOCK_MODE | OP_SET_BIT_RATE => Frame::new(frame.code, vec![]),
            OP_ERASE => {
                let address = be_u32(&frame.payload[..4]);
                if address % ERASE_GRANULARITY == 0 && in_flash(address, ERASE_GRANULARITY) {
                    for offset in 0..ERASE_GRANULARITY {
                        self.mem.remove(&(address + offset));
                    }
                    Frame::new(frame.code, vec![])
                } else {
                    Frame::new(frame.code | NAK, vec![0x2A])
                }
            }
            OP_SELECT_USER | OP_SELECT_DATA => {
                self.write_area_selected = true;
                Frame::new(frame.code, vec![])
            }
            OP_WRITE => {
                let address = be_u32(&frame.payload[..4]);
                let data = &frame.payload[4..];
                if address == 0xFFFF_FFFF && data.is_empty() {
                    self.write_area_selected = false;
                    Frame::new(frame.code, vec![])
                } else if !self.write_area_selected {
                    Frame::new(frame.code | NAK, vec![0x53])
                } else if data.len() != PAGE_SIZE {
                    Frame::new(frame.code | NAK, vec![0x2B])
                } else {
                    for (offset, value) in data.iter().enumerate() {
                        self.mem.insert(address + offset as u32, *value);
                    }
                    Frame::new(frame.code, vec![])
                }
            }
            OP_READ => {
                let address = be_u32(&frame.payload[..4]);
                let length = be_u32(&frame.payload[4..8]);
                let data: Vec<u8> = (0..length)
                    .map(|offset| *self.mem.get(&(address + offset)).unwrap_or(&0xFF))
                    .collect();
                Frame::new(frame.code, data)
            }
            OP_END => {
                self.end_count += 1;
                Frame::new(frame.code, vec![])
            }
            other => Frame::new(other | NAK, vec![0xFF]),
        };

        self.reply(reply);
    }

    fn reply(&mut self, frame: Frame) {
        if self.drop_replies > 0 {
            self.drop_replies -= 1;
            return;
        }

        let mut bytes = frame.encode();
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
        }
        self.tx.extend(bytes);
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes.try_into().expect("4 byte field"))
}

fn in_flash(address: u32, length: u32) -> bool {
    let span = |start: u32, len: u32| {
        address as u64 >= start as u64 && address as u64 + length as u64 <= start as u64 + len as u64
    };
    span(USER_START, USER_LEN) || span(DATA_START, DATA_LEN)
}

/// Handle over the emulated device; stays valid after the port half has been
/// moved into a session
#[derive(Clone)]
pub struct BootRom(Arc<Mutex<Inner>>);

impl BootRom {
    pub fn new(supported_baud: u32) -> Self {
        BootRom(Arc::new(Mutex::new(Inner {
            supported_baud,
            timeout: Duration::from_secs(1),
            ..Inner::default()
        })))
    }

    pub fn connection(&self) -> Connection {
        Connection::new(Box::new(BootRomPort(self.0.clone())), 115_200)
    }

    pub fn silent(self) -> Self {
        self.0.lock().unwrap().silent = true;
        self
    }

    pub fn skew_timing(&self, timing: u8) {
        self.0.lock().unwrap().timing_override = Some(timing);
    }

    /// Acknowledge the sync probe but never answer the timing request
    pub fn mute_timing(&self) {
        self.0.lock().unwrap().mute_timing = true;
    }

    pub fn corrupt_replies(&self, count: u32) {
        self.0.lock().unwrap().corrupt_replies = count;
    }

    pub fn drop_replies(&self, count: u32) {
        self.0.lock().unwrap().drop_replies = count;
    }

    pub fn nak_next(&self, status: u8) {
        self.0.lock().unwrap().nak_next = Some(status);
    }

    pub fn poke(&self, address: u32, value: u8) {
        self.0.lock().unwrap().mem.insert(address, value);
    }

    pub fn mem(&self, address: u32, length: usize) -> Vec<u8> {
        let inner = self.0.lock().unwrap();
        (0..length as u32)
            .map(|offset| *inner.mem.get(&(address + offset)).unwrap_or(&0xFF))
            .collect()
    }

    pub fn set_bauds(&self) -> Vec<u32> {
        self.0.lock().unwrap().set_bauds.clone()
    }

    pub fn frames_handled(&self) -> u32 {
        self.0.lock().unwrap().frames_handled
    }

    pub fn end_count(&self) -> u32 {
        self.0.lock().unwrap().end_count
    }

    pub fn closes(&self) -> u32 {
        self.0.lock().unwrap().closes
    }
}

struct BootRomPort(Arc<Mutex<Inner>>);

impl Read for BootRomPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.0.lock().unwrap();
        if inner.tx.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no reply within timeout",
            ));
        }

        let count = buf.len().min(inner.tx.len());
        for slot in &mut buf[..count] {
            *slot = inner.tx.pop_front().unwrap();
        }
        Ok(count)
    }
}

impl Write for BootRomPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.0.lock().unwrap();
        for &byte in buf {
            inner.process(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Interface for BootRomPort {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), rxflash::error::ConnectionError> {
        let mut inner = self.0.lock().unwrap();
        inner.set_bauds.push(baud);
        inner.baud = baud;
        inner.probed = false;
        inner.synced = false;
        inner.rx.clear();
        inner.tx.clear();
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), rxflash::error::ConnectionError> {
        self.0.lock().unwrap().timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.0.lock().unwrap().timeout
    }

    fn clear_input(&mut self) -> Result<(), rxflash::error::ConnectionError> {
        self.0.lock().unwrap().tx.clear();
        Ok(())
    }
}

impl Drop for BootRomPort {
    fn drop(&mut self) {
        self.0.lock().unwrap().closes += 1;
    }
}
