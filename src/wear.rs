use crate::error::Error;
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::trace;
use rand_core::RngCore;

/// Picks a free physical sector by starting at a random position in `range`, scanning upwards
/// and then downwards from the start. Randomizing the start spreads the assignments, and with
/// them the erase cycles, over the whole pool.
///
/// The write counts of the candidates are not taken into account.
///
/// `is_free` is only ever called with indices inside `range`.
pub(crate) fn allocate<R, F>(rng: &mut R, range: Range<u32>, mut is_free: F) -> Result<u32, Error>
where
    R: RngCore,
    F: FnMut(u32) -> Result<bool, Error>,
{
    if range.is_empty() {
        return Err(Error::OutOfSpace);
    }

    let start = range.start + rng.next_u32() % (range.end - range.start);

    #[cfg(feature = "defmt")]
    trace!("allocate: start #{}", start);

    for physical in start..range.end {
        if is_free(physical)? {
            return Ok(physical);
        }
    }

    for physical in (range.start..start).rev() {
        if is_free(physical)? {
            return Ok(physical);
        }
    }

    Err(Error::OutOfSpace)
}
