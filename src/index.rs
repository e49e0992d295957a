use crate::Config;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::read_header;
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

/// In-memory mapping from `(logical_id, sub_index)` to the physical sector carrying that
/// identity. Built once by recovery, afterwards every slot is filled. Grows with the size of the
/// pool.
pub(crate) struct SectorMap {
    group_by: u8,
    slots: Vec<Option<u32>>,
}

impl SectorMap {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            group_by: config.group_by,
            slots: vec![None; config.pool_size() as usize],
        }
    }

    #[inline(always)]
    fn slot(&self, logical_id: u16, sub_index: u8) -> usize {
        logical_id as usize * self.group_by as usize + sub_index as usize
    }

    pub(crate) fn get(&self, logical_id: u16, sub_index: u8) -> Option<u32> {
        if sub_index >= self.group_by {
            return None;
        }
        self.slots
            .get(self.slot(logical_id, sub_index))
            .copied()
            .flatten()
    }

    pub(crate) fn insert(&mut self, logical_id: u16, sub_index: u8, physical: u32) {
        let slot = self.slot(logical_id, sub_index);
        self.slots[slot] = Some(physical);
    }

    #[cfg(any(test, feature = "defmt"))]
    pub(crate) fn missing(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

/// Scans the pool upwards and returns the first physical sector with a valid header for
/// `logical_id`. Since members are placed independently this is the member with the lowest
/// address, not necessarily sub index 0.
pub(crate) fn find_first<T: Platform>(
    hal: &mut T,
    config: &Config,
    logical_id: u16,
) -> Result<Option<u32>, Error> {
    #[cfg(feature = "defmt")]
    trace!("find_first: {}", logical_id);

    for physical in config.physical_range() {
        match read_header(hal, physical)? {
            Some(header) if header.logical_id == logical_id => return Ok(Some(physical)),
            _ => continue,
        }
    }

    Ok(None)
}

/// Resolves one member of a logical sector. Starts at [`find_first`] and keeps scanning upwards,
/// every other member lies above the first one.
pub(crate) fn find_member<T: Platform>(
    hal: &mut T,
    config: &Config,
    logical_id: u16,
    sub_index: u8,
) -> Result<u32, Error> {
    #[cfg(feature = "defmt")]
    trace!("find_member: {}[{}]", logical_id, sub_index);

    let first = find_first(hal, config, logical_id)?.ok_or(Error::NotFound)?;

    for physical in first..config.upper_bound() {
        match read_header(hal, physical)? {
            Some(header) if header.is_member(logical_id, sub_index) => return Ok(physical),
            _ => continue,
        }
    }

    Err(Error::NotFound)
}
