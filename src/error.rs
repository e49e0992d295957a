use thiserror::Error;

/// Errors that can occur during flash translation layer operations. Marked as non-exhaustive to
/// allow for future additions without breaking the API. After a successful recovery a caller would
/// usually only see FlashError and OutOfBounds, the other errors indicate corruption or a
/// misconfigured store.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// `group_by` and `logical_sectors_count` must be at least 1 and the resulting physical range
    /// has to fit into the flash.
    #[error("invalid configuration")]
    InvalidConfig,

    /// The flash sector has to be larger than the header page and the header page has to be a
    /// multiple of the read and write granularity.
    #[error("unsupported flash geometry")]
    InvalidGeometry,

    /// The internal error value is returned from the provided `&mut impl NorFlash`
    #[error("internal flash error")]
    FlashError,

    /// The logical sector (or one of its members) has no physical sector assigned. Should not
    /// happen after recovery and points to corruption or a configuration mismatch.
    #[error("logical sector not found")]
    NotFound,

    /// Every physical sector in the configured range carries a valid header.
    #[error("no free physical sector")]
    OutOfSpace,

    /// A header signature was invalid, or its identity did not match, where a valid one was
    /// expected.
    #[error("corrupted sector header")]
    Corrupt,

    /// A header references a logical id or sub index outside the current configuration.
    #[error("sector belongs to a different configuration")]
    ConfigMismatch,

    /// Offset, length or sub index exceed the size of the logical sector.
    #[error("access out of bounds")]
    OutOfBounds,
}
