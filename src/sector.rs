use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    ERASED, HEADER_PAGE_SIZE, SectorHeader, read_aligned, read_header, sector_address,
    write_aligned,
};
use crate::{Ftl, index};
use core::cmp;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};
use rand_core::RngCore;

impl<T, R> Ftl<T, R>
where
    T: Platform,
    R: RngCore,
{
    /// Looks up the physical sector of one member in the recovered mapping.
    pub(crate) fn resolve(&self, logical_id: u16, sub_index: u8) -> Result<u32, Error> {
        if sub_index >= self.config.group_by {
            return Err(Error::OutOfBounds);
        }
        self.map.get(logical_id, sub_index).ok_or(Error::NotFound)
    }

    fn check_range(&self, logical_id: u16, offset: usize, len: usize) -> Result<(), Error> {
        if logical_id >= self.config.logical_sectors_count {
            return Err(Error::NotFound);
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.logical_sector_size() => Ok(()),
            _ => Err(Error::OutOfBounds),
        }
    }

    pub(crate) fn read_data(
        &mut self,
        logical_id: u16,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("read_data: {}@{}[{}]", logical_id, offset, buf.len());

        self.check_range(logical_id, offset, buf.len())?;

        let mut done = 0;
        for (sub_index, local_offset, len) in chunks(self.sector_data_size(), offset, buf.len()) {
            let physical = self.resolve(logical_id, sub_index)?;
            let address =
                sector_address::<T>(physical) + (HEADER_PAGE_SIZE + local_offset) as u32;

            #[cfg(feature = "debug-logs")]
            println!("sector: read {logical_id}[{sub_index}] #{physical} @{address:#08x}[{len}]");

            read_aligned(&mut self.hal, address, &mut buf[done..done + len])
                .map_err(|_| Error::FlashError)?;
            done += len;
        }

        Ok(())
    }

    pub(crate) fn write_data(
        &mut self,
        logical_id: u16,
        offset: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_data: {}@{}[{}]", logical_id, offset, data.len());

        self.check_range(logical_id, offset, data.len())?;

        let data_size = self.sector_data_size();
        self.check_members(
            logical_id,
            chunks(data_size, offset, data.len()).map(|(sub_index, _, _)| sub_index),
        )?;

        let mut done = 0;
        for (sub_index, local_offset, len) in chunks(data_size, offset, data.len()) {
            self.rewrite_sector(
                logical_id,
                sub_index,
                Some((local_offset, &data[done..done + len])),
            )?;
            done += len;
        }

        Ok(())
    }

    pub(crate) fn erase_group(&mut self, logical_id: u16) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_group: {}", logical_id);

        self.check_range(logical_id, 0, 0)?;

        let group_by = self.config.group_by;
        self.check_members(logical_id, 0..group_by)?;

        // members are placed independently, so each one gets its own erase
        for sub_index in 0..group_by {
            self.rewrite_sector(logical_id, sub_index, None)?;
        }

        Ok(())
    }

    /// Reads the header of every listed member before anything is erased. A single corrupt member
    /// fails the whole operation with flash left untouched.
    fn check_members(
        &mut self,
        logical_id: u16,
        sub_indices: impl Iterator<Item = u8>,
    ) -> Result<(), Error> {
        for sub_index in sub_indices {
            let physical = self.resolve(logical_id, sub_index)?;
            match read_header(&mut self.hal, physical)? {
                Some(header) if header.is_member(logical_id, sub_index) => {}
                _ => {
                    #[cfg(feature = "defmt")]
                    warn!("check_members: {}[{}] corrupt at #{}", logical_id, sub_index, physical);
                    return Err(Error::Corrupt);
                }
            }
        }

        Ok(())
    }

    /// Erases one member and restores its header with an incremented write count, optionally
    /// followed by a payload at `local_offset` of the data area. The whole sequence runs in one
    /// atomic section.
    pub(crate) fn rewrite_sector(
        &mut self,
        logical_id: u16,
        sub_index: u8,
        payload: Option<(usize, &[u8])>,
    ) -> Result<SectorHeader, Error> {
        #[cfg(feature = "defmt")]
        trace!("rewrite_sector: {}[{}]", logical_id, sub_index);

        let physical = self.resolve(logical_id, sub_index)?;
        let address = sector_address::<T>(physical);
        let hal = &mut self.hal;

        let header = T::atomic(|| {
            let header = read_header(hal, physical)?.ok_or(Error::Corrupt)?;
            if !header.is_member(logical_id, sub_index) {
                return Err(Error::Corrupt);
            }

            let header = header.next_generation();
            let mut page = [ERASED; HEADER_PAGE_SIZE];
            header.encode(&mut page);

            hal.erase(address, address + T::ERASE_SIZE as u32)
                .map_err(|_| Error::FlashError)?;
            hal.write(address, &page).map_err(|_| Error::FlashError)?;

            if let Some((local_offset, data)) = payload {
                write_aligned(hal, address + (HEADER_PAGE_SIZE + local_offset) as u32, data)
                    .map_err(|_| Error::FlashError)?;
            }

            Ok(header)
        })?;

        #[cfg(feature = "debug-logs")]
        println!("sector: rewrote {logical_id}[{sub_index}] #{physical} -> {header:?}");

        Ok(header)
    }

    pub(crate) fn load_header(
        &mut self,
        logical_id: u16,
        sub_index: u8,
    ) -> Result<SectorHeader, Error> {
        let physical = self.resolve(logical_id, sub_index)?;
        read_header(&mut self.hal, physical)?.ok_or(Error::Corrupt)
    }

    pub(crate) fn scan_first(&mut self, logical_id: u16) -> Result<Option<u32>, Error> {
        index::find_first(&mut self.hal, &self.config, logical_id)
    }

    pub(crate) fn scan_member(&mut self, logical_id: u16, sub_index: u8) -> Result<u32, Error> {
        index::find_member(&mut self.hal, &self.config, logical_id, sub_index)
    }
}

/// Splits `offset..offset + len` of a logical sector into `(sub_index, local_offset, len)` chunks,
/// one per touched member.
fn chunks(data_size: usize, offset: usize, len: usize) -> impl Iterator<Item = (u8, usize, usize)> {
    let mut position = offset;
    let end = offset + len;
    core::iter::from_fn(move || {
        if position >= end {
            return None;
        }
        let sub_index = (position / data_size) as u8;
        let local_offset = position % data_size;
        let chunk_len = cmp::min(data_size - local_offset, end - position);
        position += chunk_len;
        Some((sub_index, local_offset, chunk_len))
    })
}
