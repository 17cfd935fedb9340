//! Top-level programming sequence
//!
//! Drives the documented operation order against a connected
//! [Programmer]: erase every planned block, select the write area, stream
//! the pages, send the finishing sentinel, then read everything back and
//! compare on the host. Any step failure aborts the remainder of the plan
//! and ends the session; a partially written page is a genuine fault that
//! needs operator attention, not silent continuation.

use std::borrow::Cow;

use log::{debug, info};

use crate::{
    error::{Error, VerifyMismatch},
    programmer::Programmer,
    targets::{FlashGeometry, WriteArea},
};

/// One contiguous run of bytes destined for flash
#[derive(Debug, Clone)]
pub struct Segment<'a> {
    pub addr: u32,
    pub data: Cow<'a, [u8]>,
}

impl<'a> Segment<'a> {
    pub fn new(addr: u32, data: impl Into<Cow<'a, [u8]>>) -> Self {
        Segment {
            addr,
            data: data.into(),
        }
    }
}

/// Everything one programming pass does: which blocks to erase, which pages
/// to write into which area, and whether to verify afterwards
#[derive(Debug, Clone)]
pub struct ProgramPlan<'a> {
    pub area: WriteArea,
    pub segments: Vec<Segment<'a>>,
    /// Erase block addresses, executed in order
    pub erase: Vec<u32>,
    pub verify: bool,
}

impl<'a> ProgramPlan<'a> {
    /// Build a plan whose erase list covers exactly the blocks the segments
    /// touch.
    pub fn for_segments(
        geometry: &FlashGeometry,
        area: WriteArea,
        segments: Vec<Segment<'a>>,
        verify: bool,
    ) -> Self {
        let granularity = geometry.erase_granularity as u64;
        let mut erase = Vec::new();

        for segment in &segments {
            let start = segment.addr as u64 / granularity * granularity;
            let end = segment.addr as u64 + segment.data.len() as u64;

            let mut block = start;
            while block < end {
                erase.push(block as u32);
                block += granularity;
            }
        }
        erase.sort_unstable();
        erase.dedup();

        ProgramPlan {
            area,
            segments,
            erase,
            verify,
        }
    }
}

/// Outcome of one programming pass
#[derive(Debug, Clone)]
pub struct ProgramReport {
    /// One entry per segment when verification was requested
    pub verify: Vec<VerifyResult>,
}

/// Host-side comparison of a read-back span against the source image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyResult {
    pub address: u32,
    pub mismatch_count: u32,
    pub first_mismatch_offset: Option<u32>,
}

impl VerifyResult {
    /// Compare `actual` read back from `address` against `expected`.
    pub fn compare(address: u32, expected: &[u8], actual: &[u8]) -> Self {
        debug_assert_eq!(expected.len(), actual.len());

        let mut mismatch_count = 0;
        let mut first_mismatch_offset = None;
        for (offset, (expected, actual)) in expected.iter().zip(actual).enumerate() {
            if expected != actual {
                mismatch_count += 1;
                if first_mismatch_offset.is_none() {
                    first_mismatch_offset = Some(offset as u32);
                }
            }
        }

        VerifyResult {
            address,
            mismatch_count,
            first_mismatch_offset,
        }
    }

    pub fn is_match(&self) -> bool {
        self.mismatch_count == 0
    }

    /// Turn a mismatch into a hard error for callers that want one.
    pub fn into_result(self) -> Result<(), VerifyMismatch> {
        if self.is_match() {
            Ok(())
        } else {
            Err(VerifyMismatch {
                address: self.address,
                mismatch_count: self.mismatch_count,
                first_mismatch_offset: self.first_mismatch_offset,
            })
        }
    }
}

/// Execute `plan` on a connected session and end it.
///
/// The session is ended on every path, success or failure, so the device is
/// left in a known state. Verify mismatches do not abort the pass; they come
/// back as data in the report for the caller to act on.
pub fn run(programmer: &mut Programmer, plan: &ProgramPlan<'_>) -> Result<ProgramReport, Error> {
    let result = drive(programmer, plan);
    programmer.end();

    result
}

fn drive(programmer: &mut Programmer, plan: &ProgramPlan<'_>) -> Result<ProgramReport, Error> {
    for &address in &plan.erase {
        debug!("Erasing block at {address:#010x}");
        programmer.erase_page(address)?;
    }

    programmer.select_write_area(plan.area)?;

    let page_size = programmer.geometry().page_size;
    for segment in &plan.segments {
        debug!(
            "Writing {} bytes at {:#010x}",
            segment.data.len(),
            segment.addr
        );
        for (index, chunk) in segment.data.chunks(page_size).enumerate() {
            let address = segment.addr + (index * page_size) as u32;
            if chunk.len() == page_size {
                programmer.write_page(address, chunk)?;
            } else {
                // Tail shorter than a page; pad with erased-state bytes
                let mut page = vec![0xFF; page_size];
                page[..chunk.len()].copy_from_slice(chunk);
                programmer.write_page(address, &page)?;
            }
        }
    }

    programmer.finish_write()?;

    let mut verify = Vec::new();
    if plan.verify {
        for segment in &plan.segments {
            let result = programmer.verify(segment.addr, &segment.data)?;
            if result.is_match() {
                debug!("Verify clean at {:#010x}", segment.addr);
            } else {
                info!(
                    "Verify found {} mismatching byte(s) at {:#010x}",
                    result.mismatch_count, segment.addr
                );
            }
            verify.push(result);
        }
    }

    Ok(ProgramReport { verify })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::targets::Chip;

    #[test]
    fn identical_spans_verify_clean() {
        let data = [0xA5u8; 256];
        let result = VerifyResult::compare(0xFFF8_0000, &data, &data);

        assert_eq!(result.mismatch_count, 0);
        assert_eq!(result.first_mismatch_offset, None);
        assert!(result.is_match());
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn single_differing_byte_is_located() {
        let expected = [0x00u8; 128];
        let mut actual = expected;
        actual[77] ^= 0x10;

        let result = VerifyResult::compare(0x0010_0000, &expected, &actual);

        assert_eq!(result.mismatch_count, 1);
        assert_eq!(result.first_mismatch_offset, Some(77));

        let err = result.into_result().unwrap_err();
        assert_eq!(err.mismatch_count, 1);
        assert_eq!(err.first_mismatch_offset, Some(77));
    }

    #[test]
    fn multiple_mismatches_report_the_first_offset() {
        let expected = [0xFFu8; 64];
        let mut actual = expected;
        actual[3] = 0;
        actual[40] = 0;
        actual[63] = 0;

        let result = VerifyResult::compare(0, &expected, &actual);

        assert_eq!(result.mismatch_count, 3);
        assert_eq!(result.first_mismatch_offset, Some(3));
    }

    #[test]
    fn erase_plan_covers_every_touched_block() {
        let geometry = Chip::Rx63t.geometry();
        let base = geometry.user_area.start;
        let granularity = geometry.erase_granularity;

        // One segment spanning two blocks, one inside the first block
        let segments = vec![
            Segment::new(base, vec![0u8; granularity as usize + 1]),
            Segment::new(base + 16, vec![0u8; 16]),
        ];
        let plan = ProgramPlan::for_segments(geometry, WriteArea::User, segments, true);

        assert_eq!(plan.erase, vec![base, base + granularity]);
    }

    #[test]
    fn erase_plan_aligns_unaligned_segments_down() {
        let geometry = Chip::Rx24t.geometry();
        let base = geometry.user_area.start;
        let granularity = geometry.erase_granularity;

        let segments = vec![Segment::new(base + granularity / 2, vec![0u8; 8])];
        let plan = ProgramPlan::for_segments(geometry, WriteArea::User, segments, false);

        assert_eq!(plan.erase, vec![base]);
    }
}
