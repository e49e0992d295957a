use crate::error::Error;
use crate::platform::{AlignedOps, Platform};
use core::cmp;
use core::mem::{offset_of, size_of};
#[cfg(feature = "defmt")]
use defmt::trace;

/// Marks a header page as initialized. Anything else at offset 0, including the erased value, is
/// an invalid signature and the sector is free for allocation.
pub(crate) const SIGNATURE: u32 = 0x2706_2021;

/// The leading part of every physical sector that is reserved for the header. The payload starts
/// right after it.
pub const HEADER_PAGE_SIZE: usize = 256;

pub(crate) const ERASED: u8 = 0xFF;

/// On-media layout of the header, little endian. Only used for offsets and size; the bytes are
/// encoded explicitly.
#[repr(C, packed)]
struct RawSectorHeader {
    signature: u32,
    logical_id: u16,
    write_count: u16,
    sub_index: u8,
}

const SIGNATURE_OFFSET: usize = offset_of!(RawSectorHeader, signature);
const LOGICAL_ID_OFFSET: usize = offset_of!(RawSectorHeader, logical_id);
const WRITE_COUNT_OFFSET: usize = offset_of!(RawSectorHeader, write_count);
const SUB_INDEX_OFFSET: usize = offset_of!(RawSectorHeader, sub_index);
pub(crate) const HEADER_SIZE: usize = size_of::<RawSectorHeader>();

const _: () = assert!(HEADER_SIZE <= HEADER_PAGE_SIZE);

/// Identity and wear counter of one physical sector, as stored in its header page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SectorHeader {
    pub logical_id: u16,
    pub write_count: u16,
    pub sub_index: u8,
}

impl SectorHeader {
    /// Header for a sector that has just been assigned by the allocator.
    pub(crate) fn fresh(logical_id: u16, sub_index: u8) -> Self {
        Self {
            logical_id,
            write_count: 1,
            sub_index,
        }
    }

    /// The header to program after the sector has been erased once more. The counter saturates
    /// instead of wrapping so it never goes backwards.
    pub(crate) fn next_generation(self) -> Self {
        Self {
            write_count: self.write_count.saturating_add(1),
            ..self
        }
    }

    pub(crate) fn is_member(&self, logical_id: u16, sub_index: u8) -> bool {
        self.logical_id == logical_id && self.sub_index == sub_index
    }

    pub(crate) fn encode(&self, buf: &mut [u8; HEADER_PAGE_SIZE]) {
        buf.fill(ERASED);
        buf[SIGNATURE_OFFSET..LOGICAL_ID_OFFSET].copy_from_slice(&SIGNATURE.to_le_bytes());
        buf[LOGICAL_ID_OFFSET..WRITE_COUNT_OFFSET].copy_from_slice(&self.logical_id.to_le_bytes());
        buf[WRITE_COUNT_OFFSET..SUB_INDEX_OFFSET].copy_from_slice(&self.write_count.to_le_bytes());
        buf[SUB_INDEX_OFFSET] = self.sub_index;
    }

    /// Returns `None` if the signature doesn't match, e.g. erased or invalidated sectors.
    pub(crate) fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }

        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != SIGNATURE {
            return None;
        }

        Some(Self {
            logical_id: u16::from_le_bytes([buf[LOGICAL_ID_OFFSET], buf[LOGICAL_ID_OFFSET + 1]]),
            write_count: u16::from_le_bytes([
                buf[WRITE_COUNT_OFFSET],
                buf[WRITE_COUNT_OFFSET + 1],
            ]),
            sub_index: buf[SUB_INDEX_OFFSET],
        })
    }
}

/// Header page that clears all header bytes, which destroys the signature. Programming it never
/// requires an erase as it only flips bits from 1 to 0.
pub(crate) fn invalidated_header_page() -> [u8; HEADER_PAGE_SIZE] {
    let mut buf = [ERASED; HEADER_PAGE_SIZE];
    buf[..HEADER_SIZE].fill(0x00);
    buf
}

#[inline(always)]
pub(crate) fn sector_address<T: Platform>(physical: u32) -> u32 {
    physical * T::ERASE_SIZE as u32
}

pub(crate) fn read_header<T: Platform>(
    hal: &mut T,
    physical: u32,
) -> Result<Option<SectorHeader>, Error> {
    #[cfg(feature = "defmt")]
    trace!("read_header: #{}", physical);

    let mut buf = [ERASED; HEADER_PAGE_SIZE];
    let len = T::align_read_ceil(HEADER_SIZE);
    hal.read(sector_address::<T>(physical), &mut buf[..len])
        .map_err(|_| Error::FlashError)?;

    Ok(SectorHeader::decode(&buf[..len]))
}

/// Reads `bytes.len()` bytes from an arbitrary offset. The flash only accepts `READ_SIZE` aligned
/// accesses, so an unaligned head and tail go through a one word scratch buffer while the aligned
/// middle is read straight into `bytes`.
pub(crate) fn read_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &mut [u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("read_aligned @{:#08x}: [{}]", offset, bytes.len());

    // READ_SIZE divides HEADER_PAGE_SIZE, checked when the store is created
    let mut scratch = [ERASED; HEADER_PAGE_SIZE];
    let word = &mut scratch[..T::READ_SIZE];

    let offset = offset as usize;
    let mut done = 0;

    let head_start = T::align_read_floor(offset);
    if head_start != offset && !bytes.is_empty() {
        let skip = offset - head_start;
        let len = cmp::min(T::READ_SIZE - skip, bytes.len());
        hal.read(head_start as u32, word)?;
        bytes[..len].copy_from_slice(&word[skip..skip + len]);
        done = len;
    }

    let middle = T::align_read_floor(bytes.len() - done);
    if middle > 0 {
        hal.read((offset + done) as u32, &mut bytes[done..done + middle])?;
        done += middle;
    }

    let tail = bytes.len() - done;
    if tail > 0 {
        hal.read((offset + done) as u32, word)?;
        bytes[done..].copy_from_slice(&word[..tail]);
    }

    Ok(())
}

/// Programs `bytes` at an arbitrary offset of an erased range. Head and trailer are padded with
/// the erased value which leaves the neighbouring bytes untouched.
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", offset, bytes.len());

    // WRITE_SIZE divides HEADER_PAGE_SIZE, checked when the store is created
    let mut scratch = [ERASED; HEADER_PAGE_SIZE];
    let offset = offset as usize;
    let mut done = 0;

    let head_start = T::align_write_floor(offset);
    if head_start != offset && !bytes.is_empty() {
        let skip = offset - head_start;
        let len = cmp::min(T::WRITE_SIZE - skip, bytes.len());
        let word = &mut scratch[..T::WRITE_SIZE];
        word[skip..skip + len].copy_from_slice(&bytes[..len]);
        hal.write(head_start as u32, word)?;
        done = len;
    }

    let middle = T::align_write_floor(bytes.len() - done);
    if middle > 0 {
        hal.write((offset + done) as u32, &bytes[done..done + middle])?;
        done += middle;
    }

    // no need to write the trailer if it is all ones, the erased state of the flash
    let trailer = &bytes[done..];
    if trailer.iter().any(|&e| e != ERASED) {
        let word = &mut scratch[..T::WRITE_SIZE];
        word.fill(ERASED);
        word[..trailer.len()].copy_from_slice(trailer);
        hal.write((offset + done) as u32, word)?;
    }

    Ok(())
}
