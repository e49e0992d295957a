use crate::error::Error;
use crate::index::SectorMap;
use crate::platform::Platform;
use crate::raw::{
    ERASED, HEADER_PAGE_SIZE, SectorHeader, invalidated_header_page, read_header, sector_address,
};
use crate::{Ftl, wear};
use alloc::vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};
use rand_core::RngCore;

/// What recovery found and did. A second recovery over the same flash reports only assigned
/// sectors and performs no writes.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecoveryReport {
    /// Sectors with a valid header for the current configuration.
    pub assigned: u32,
    /// Sectors without a valid signature.
    pub free: u32,
    /// Sectors left over from a configuration with more logical sectors or a larger group and
    /// that were invalidated.
    pub stale: u32,
    /// Second copies of an already seen `(logical_id, sub_index)` that were invalidated.
    pub duplicates: u32,
    /// Fresh headers written for members that were missing.
    pub allocated: u32,
}

#[derive(strum::Display, Debug, PartialEq)]
enum SectorState {
    Free,
    Assigned,
    Stale,
    Duplicate,
}

impl<T, R> Ftl<T, R>
where
    T: Platform,
    R: RngCore,
{
    /// Brings the pool into a consistent state in two linear passes:
    /// 1. Validate every header in range, collecting the assigned members and invalidating stale
    ///    and duplicate headers
    /// 2. Allocate a fresh header for every `(logical_id, sub_index)` that is still missing
    ///
    /// Returns `OutOfSpace` if a member could not be placed.
    pub(crate) fn recover(&mut self) -> Result<RecoveryReport, Error> {
        #[cfg(feature = "defmt")]
        trace!("recover");

        #[cfg(feature = "debug-logs")]
        println!("recovery: recover {:?}", self.config);

        let config = self.config;
        let range = config.physical_range();
        let mut report = RecoveryReport::default();
        let mut map = SectorMap::new(&config);
        let mut write_counts = vec![0u16; config.pool_size() as usize];
        let mut occupied = vec![false; config.pool_size() as usize];
        let pool_offset = |physical: u32| (physical - config.lower_bound) as usize;
        let slot = |header: &SectorHeader| {
            header.logical_id as usize * config.group_by as usize + header.sub_index as usize
        };

        let mut missing = 0u32;
        for physical in range.clone() {
            let state = match read_header(&mut self.hal, physical)? {
                None => SectorState::Free,
                Some(header)
                    if header.logical_id >= config.logical_sectors_count
                        || header.sub_index >= config.group_by =>
                {
                    invalidate(&mut self.hal, physical)?;
                    SectorState::Stale
                }
                Some(header) => match map.get(header.logical_id, header.sub_index) {
                    None => {
                        map.insert(header.logical_id, header.sub_index, physical);
                        write_counts[slot(&header)] = header.write_count;
                        occupied[pool_offset(physical)] = true;
                        SectorState::Assigned
                    }
                    Some(other) => {
                        // keep the copy that has been rewritten more often
                        if header.write_count > write_counts[slot(&header)] {
                            invalidate(&mut self.hal, other)?;
                            occupied[pool_offset(other)] = false;
                            occupied[pool_offset(physical)] = true;
                            map.insert(header.logical_id, header.sub_index, physical);
                            write_counts[slot(&header)] = header.write_count;
                        } else {
                            invalidate(&mut self.hal, physical)?;
                        }
                        SectorState::Duplicate
                    }
                },
            };

            #[cfg(feature = "debug-logs")]
            println!("recovery: #{physical} -> {state}");

            match state {
                SectorState::Free => {
                    report.free += 1;
                    missing += 1;
                }
                SectorState::Assigned => report.assigned += 1,
                SectorState::Stale => {
                    #[cfg(feature = "defmt")]
                    warn!("recover: invalidated stale sector #{}", physical);
                    report.stale += 1;
                    missing += 1;
                }
                SectorState::Duplicate => {
                    #[cfg(feature = "defmt")]
                    warn!("recover: invalidated duplicate sector");
                    report.duplicates += 1;
                    missing += 1;
                }
            }
        }

        if missing == 0 {
            self.map = map;
            return Ok(report);
        }

        'ids: for logical_id in 0..config.logical_sectors_count {
            for sub_index in 0..config.group_by {
                if map.get(logical_id, sub_index).is_some() {
                    continue;
                }

                let physical = wear::allocate(&mut self.rng, range.clone(), |candidate| {
                    Ok(!occupied[pool_offset(candidate)])
                })?;

                #[cfg(feature = "debug-logs")]
                println!("recovery: assigning {logical_id}[{sub_index}] to #{physical}");

                assign(
                    &mut self.hal,
                    physical,
                    SectorHeader::fresh(logical_id, sub_index),
                )?;
                occupied[pool_offset(physical)] = true;
                map.insert(logical_id, sub_index, physical);
                report.allocated += 1;

                missing -= 1;
                if missing == 0 {
                    break 'ids;
                }
            }
        }

        if !map.is_complete() {
            #[cfg(feature = "defmt")]
            warn!("recover: {} members could not be placed", map.missing());
            return Err(Error::OutOfSpace);
        }

        self.map = map;
        Ok(report)
    }

    /// Same scan as the validation pass of [`Self::recover`] but anything unexpected is reported
    /// instead of repaired.
    pub(crate) fn verify(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("verify");

        let config = self.config;
        let mut seen = SectorMap::new(&config);

        for physical in config.physical_range() {
            let Some(header) = read_header(&mut self.hal, physical)? else {
                continue;
            };

            if header.logical_id >= config.logical_sectors_count
                || header.sub_index >= config.group_by
            {
                return Err(Error::ConfigMismatch);
            }

            if seen.get(header.logical_id, header.sub_index).is_some()
                || self.map.get(header.logical_id, header.sub_index) != Some(physical)
            {
                return Err(Error::Corrupt);
            }
            seen.insert(header.logical_id, header.sub_index, physical);
        }

        if !seen.is_complete() {
            return Err(Error::NotFound);
        }

        Ok(())
    }
}

/// Clears the signature so the sector becomes eligible for allocation. Only flips bits from 1 to
/// 0, no erase needed.
pub(crate) fn invalidate<T: Platform>(hal: &mut T, physical: u32) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("invalidate: #{}", physical);

    let page = invalidated_header_page();
    T::atomic(|| hal.write(sector_address::<T>(physical), &page))
        .map_err(|_| Error::FlashError)
}

/// Erases a free sector and programs a new header page into it.
fn assign<T: Platform>(hal: &mut T, physical: u32, header: SectorHeader) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("assign: #{}", physical);

    let mut page = [ERASED; HEADER_PAGE_SIZE];
    header.encode(&mut page);

    let address = sector_address::<T>(physical);
    T::atomic(|| {
        hal.erase(address, address + T::ERASE_SIZE as u32)?;
        hal.write(address, &page)
    })
    .map_err(|_| Error::FlashError)
}
