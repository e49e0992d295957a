use embedded_storage::nor_flash::NorFlash;

/// See README.md for an example implementation.
pub trait Platform: Atomic + NorFlash {}

impl<T: Atomic + NorFlash> Platform for T {}

/// Runs a closure with interrupts masked so no handler observes, or causes, a partially erased or
/// programmed sector. Flash must not be read by anyone else while it is being reprogrammed.
///
/// The default implementation defers to the `critical-section` implementation linked into the
/// final binary.
pub trait Atomic {
    fn atomic<R>(f: impl FnOnce() -> R) -> R {
        critical_section::with(|_cs| f())
    }
}

impl<T: Atomic> Atomic for &mut T {
    fn atomic<R>(f: impl FnOnce() -> R) -> R {
        T::atomic(f)
    }
}

pub trait AlignedOps: Platform {
    fn align_read_ceil(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_read_floor(size: usize) -> usize {
        align_floor(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }

    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }
}

#[inline(always)]
const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
mod chip {
    // links the critical-section implementation of esp-hal that masks interrupts on the current
    // core, the default `Atomic::atomic` relies on it
    use esp_hal as _;
    use esp_storage::FlashStorage;

    use crate::platform::Atomic;

    impl Atomic for FlashStorage<'_> {}
}
