#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use nor_ftl::SectorHeader;
use nor_ftl::platform::Atomic;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub const FLASH_SECTOR_SIZE: usize = 4096;
pub const HEADER_PAGE_SIZE: usize = 256;
pub const DATA_SIZE: usize = FLASH_SECTOR_SIZE - HEADER_PAGE_SIZE;
pub const WORD_SIZE: usize = 4;
pub const SIGNATURE: u32 = 0x2706_2021;

thread_local! {
    static ATOMIC_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn in_atomic_section() -> bool {
    ATOMIC_DEPTH.with(|depth| depth.get() > 0)
}

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(sectors: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * sectors],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(sectors: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * sectors],
            fail_after_operation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    pub fn fail_after(&mut self, operations: usize) {
        self.fail_after_operation = self.operations.len() + operations;
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn sector(&self, physical: u32) -> &[u8] {
        let start = physical as usize * FLASH_SECTOR_SIZE;
        &self.buf[start..start + FLASH_SECTOR_SIZE]
    }

    pub fn data(&self, physical: u32) -> &[u8] {
        &self.sector(physical)[HEADER_PAGE_SIZE..]
    }

    /// Decodes the header independently of the library.
    pub fn header(&self, physical: u32) -> Option<SectorHeader> {
        let raw = self.sector(physical);
        if u32::from_le_bytes(raw[0..4].try_into().unwrap()) != SIGNATURE {
            return None;
        }
        Some(SectorHeader {
            logical_id: u16::from_le_bytes(raw[4..6].try_into().unwrap()),
            write_count: u16::from_le_bytes(raw[6..8].try_into().unwrap()),
            sub_index: raw[8],
        })
    }

    /// Programs a header the way an older firmware would have left it.
    pub fn put_header(&mut self, physical: u32, logical_id: u16, write_count: u16, sub_index: u8) {
        let start = physical as usize * FLASH_SECTOR_SIZE;
        self.buf[start..start + FLASH_SECTOR_SIZE].fill(0xff);
        self.buf[start..start + 4].copy_from_slice(&SIGNATURE.to_le_bytes());
        self.buf[start + 4..start + 6].copy_from_slice(&logical_id.to_le_bytes());
        self.buf[start + 6..start + 8].copy_from_slice(&write_count.to_le_bytes());
        self.buf[start + 8] = sub_index;
    }

    /// All `(physical, header)` pairs with a valid signature in `range`.
    pub fn headers(&self, range: std::ops::Range<u32>) -> Vec<(u32, SectorHeader)> {
        range
            .filter_map(|physical| self.header(physical).map(|header| (physical, header)))
            .collect()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }
}

pub fn rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::READ_SIZE));

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(in_atomic_section(), "erase outside of an atomic section");

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(in_atomic_section(), "write outside of an atomic section");

        println!(
            "    flash: write: 0x{offset:06X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        assert!(!bytes.is_empty());

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl Atomic for Flash {
    fn atomic<R>(f: impl FnOnce() -> R) -> R {
        critical_section::with(|_cs| {
            ATOMIC_DEPTH.with(|depth| depth.set(depth.get() + 1));
            let result = f();
            ATOMIC_DEPTH.with(|depth| depth.set(depth.get() - 1));
            result
        })
    }
}

/// Gives the test access to the flash while a store is using it, e.g. to corrupt headers.
#[derive(Clone)]
pub struct SharedFlash(pub Rc<RefCell<Flash>>);

impl SharedFlash {
    pub fn new(sectors: usize) -> Self {
        Self(Rc::new(RefCell::new(Flash::new(sectors))))
    }
}

impl ErrorType for SharedFlash {
    type Error = FlashError;
}

impl ReadNorFlash for SharedFlash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.0.borrow_mut().read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.0.borrow().capacity()
    }
}

impl NorFlash for SharedFlash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.0.borrow_mut().erase(from, to)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.0.borrow_mut().write(offset, bytes)
    }
}

impl Atomic for SharedFlash {
    fn atomic<R>(f: impl FnOnce() -> R) -> R {
        Flash::atomic(f)
    }
}
