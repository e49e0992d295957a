#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
mod index;
pub mod platform;
mod raw;
mod recovery;
mod sector;
mod wear;

/// Recommended group sizes. Larger groups mean fewer logical sectors to recover at startup.
pub const GROUP_BY_1: u8 = 1;
pub const GROUP_BY_8: u8 = 8;
pub const GROUP_BY_16: u8 = 16;
pub const GROUP_BY_64: u8 = 64;

pub use raw::{HEADER_PAGE_SIZE, SectorHeader};
pub use recovery::RecoveryReport;

extern crate alloc;

use crate::error::Error;
use crate::index::SectorMap;
use crate::platform::Platform;
use crate::raw::read_header;
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::trace;
use rand_core::RngCore;

/// Physical range and logical layout of a store. Physical sector `n` starts at byte address
/// `n * ERASE_SIZE`. The store uses every sector in `lower_bound..upper_bound()`, so make sure the
/// range doesn't overlap with the firmware image.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// First physical sector index used by the store.
    pub lower_bound: u32,
    /// Logical sectors exposed to the application, ids are `0..logical_sectors_count`.
    pub logical_sectors_count: u16,
    /// Physical sectors backing one logical sector.
    pub group_by: u8,
}

impl Config {
    pub const fn new(lower_bound: u32, logical_sectors_count: u16, group_by: u8) -> Self {
        Self {
            lower_bound,
            logical_sectors_count,
            group_by,
        }
    }

    /// Number of physical sectors in the pool.
    pub const fn pool_size(&self) -> u32 {
        self.logical_sectors_count as u32 * self.group_by as u32
    }

    /// One past the last physical sector index used by the store.
    pub const fn upper_bound(&self) -> u32 {
        self.lower_bound.saturating_add(self.pool_size())
    }

    pub(crate) fn physical_range(&self) -> Range<u32> {
        self.lower_bound..self.upper_bound()
    }

    fn validate<T: Platform>(&self, hal: &T) -> Result<(), Error> {
        if T::ERASE_SIZE <= HEADER_PAGE_SIZE
            || !HEADER_PAGE_SIZE.is_multiple_of(T::WRITE_SIZE)
            || !HEADER_PAGE_SIZE.is_multiple_of(T::READ_SIZE)
            || !T::ERASE_SIZE.is_multiple_of(T::READ_SIZE)
        {
            return Err(Error::InvalidGeometry);
        }

        if self.group_by == 0 || self.logical_sectors_count == 0 {
            return Err(Error::InvalidConfig);
        }

        let end = (self.lower_bound as u64 + self.pool_size() as u64) * T::ERASE_SIZE as u64;
        if end > hal.capacity() as u64 || end > u32::MAX as u64 {
            return Err(Error::InvalidConfig);
        }

        Ok(())
    }
}

/// Wear observed over the pool. Write counts are recorded on every rewrite but don't influence
/// where sectors are placed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WearStatistics {
    pub assigned: u32,
    pub free: u32,
    pub min_write_count: u16,
    pub max_write_count: u16,
    pub total_write_count: u64,
}

/// The Ftl keeps the logical to physical mapping of all members in memory. Increases in size
/// with the number of physical sectors in the pool.
///
/// All mutating operations expect a single caller. Add a lock around the store if it is shared
/// between tasks.
pub struct Ftl<T: Platform, R: RngCore> {
    pub(crate) hal: T,
    pub(crate) rng: R,
    pub(crate) config: Config,
    pub(crate) faulted: bool,

    // set after calling self.recover
    pub(crate) map: SectorMap,
    pub(crate) report: RecoveryReport,
}

impl<T: Platform, R: RngCore> Ftl<T, R> {
    /// Reads the header of every physical sector in the configured range and
    /// 1. Invalidates headers left over from a configuration with more logical sectors or a
    ///    larger `group_by`
    /// 2. Invalidates duplicate members, keeping the one with the higher write count
    /// 3. Assigns a free physical sector, chosen by `rng`, to every missing member
    ///
    /// The first start on an erased range, or after the configuration changed, writes one header
    /// per member and may take a long time. On a consistent store no writes happen.
    pub fn new(config: Config, hal: T, rng: R) -> Result<Ftl<T, R>, Error> {
        config.validate(&hal)?;

        let mut ftl = Self {
            hal,
            rng,
            config,
            faulted: false,
            map: SectorMap::new(&config),
            report: RecoveryReport::default(),
        };

        ftl.report = ftl.recover()?;
        Ok(ftl)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// What the recovery on startup did.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Usable bytes per physical sector.
    pub fn sector_data_size(&self) -> usize {
        T::ERASE_SIZE - HEADER_PAGE_SIZE
    }

    /// Usable bytes per logical sector.
    pub fn logical_sector_size(&self) -> usize {
        self.sector_data_size() * self.config.group_by as usize
    }

    /// Fill `buf` with the data of a logical sector, starting at `offset`. Reads may span
    /// multiple members of the group.
    pub fn read(&mut self, logical_id: u16, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self.read_data(logical_id, offset, buf);
        self.track_fault(result)
    }

    /// Write `data` at `offset` of a logical sector.
    ///
    /// Every touched member is erased and its header restored before the payload is
    /// programmed, so bytes of a touched member outside of `data` read as 0xFF afterwards.
    /// Members that are not touched keep their content.
    pub fn write(&mut self, logical_id: u16, offset: usize, data: &[u8]) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self.write_data(logical_id, offset, data);
        self.track_fault(result)
    }

    /// Erase the payload of one member. The header keeps its identity and its write count is
    /// incremented.
    pub fn erase_physical_sector(&mut self, logical_id: u16, sub_index: u8) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self
            .rewrite_sector(logical_id, sub_index, None)
            .map(|_| ());
        self.track_fault(result)
    }

    /// Erase the payload of every member of a logical sector, one member at a time.
    pub fn erase_logical_sector(&mut self, logical_id: u16) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self.erase_group(logical_id);
        self.track_fault(result)
    }

    /// The header currently stored for one member.
    pub fn header(&mut self, logical_id: u16, sub_index: u8) -> Result<SectorHeader, Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self.load_header(logical_id, sub_index);
        self.track_fault(result)
    }

    /// Scan the flash for the physical sector with the lowest index that belongs to
    /// `logical_id`.
    pub fn find_first(&mut self, logical_id: u16) -> Result<Option<u32>, Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self.scan_first(logical_id);
        self.track_fault(result)
    }

    /// Scan the flash for the physical sector of one member.
    pub fn find_member(&mut self, logical_id: u16, sub_index: u8) -> Result<u32, Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self.scan_member(logical_id, sub_index);
        self.track_fault(result)
    }

    /// Verify the headers on flash against the mapping without repairing anything.
    pub fn check(&mut self) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self.verify();
        self.track_fault(result)
    }

    /// Returns the write counts observed over the pool
    pub fn statistics(&mut self) -> Result<WearStatistics, Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        #[cfg(feature = "defmt")]
        trace!("statistics");

        let mut statistics = WearStatistics {
            assigned: 0,
            free: 0,
            min_write_count: u16::MAX,
            max_write_count: 0,
            total_write_count: 0,
        };

        for physical in self.config.physical_range() {
            let header = match read_header(&mut self.hal, physical) {
                Ok(header) => header,
                Err(e) => return self.track_fault(Err(e)),
            };

            match header {
                Some(header) => {
                    statistics.assigned += 1;
                    statistics.min_write_count = statistics.min_write_count.min(header.write_count);
                    statistics.max_write_count = statistics.max_write_count.max(header.write_count);
                    statistics.total_write_count += header.write_count as u64;
                }
                None => statistics.free += 1,
            }
        }

        if statistics.assigned == 0 {
            statistics.min_write_count = 0;
        }

        Ok(statistics)
    }

    /// Invalidate every header in the configured range and hand back the flash. Creating a new
    /// store on the same range afterwards starts from scratch.
    ///
    /// The flash is handed back on failure too, together with the error. Headers invalidated
    /// before the failure stay invalidated and are reallocated by the next recovery.
    pub fn wipe(mut self) -> Result<T, (Error, T)> {
        if self.faulted {
            return Err((Error::FlashError, self.hal));
        }

        #[cfg(feature = "defmt")]
        trace!("wipe");

        match self.invalidate_all() {
            Ok(()) => Ok(self.hal),
            Err(e) => Err((e, self.hal)),
        }
    }

    fn invalidate_all(&mut self) -> Result<(), Error> {
        for physical in self.config.physical_range() {
            if read_header(&mut self.hal, physical)?.is_some() {
                recovery::invalidate(&mut self.hal, physical)?;
            }
        }

        Ok(())
    }

    fn track_fault<V>(&mut self, result: Result<V, Error>) -> Result<V, Error> {
        match result {
            Ok(val) => Ok(val),
            Err(Error::FlashError) => {
                self.faulted = true;
                Err(Error::FlashError)
            }
            Err(e) => Err(e),
        }
    }
}
