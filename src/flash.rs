//! The boundary between the disk image and the flash peripheral that
//! persists it.
//!
//! The backing region is a byte-for-byte copy of the RAM mirror (the boot
//! sector is a compile-time constant and is never persisted). Erase
//! geometry differs wildly between parts — some give us 1 KiB pages, some
//! a single large sector covering the whole region — so the trait reports
//! its granularity and the commit logic in `disk` picks a strategy.

use core::fmt::Debug;

/// How the backing flash erases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EraseGranularity {
    /// Independently erasable pages of `fat::PAGE_BYTES` bytes (e.g. the
    /// 1 KiB pages on STM32F1 parts). Dirty pages can be rewritten one at
    /// a time.
    Page,
    /// The whole region is one erase unit (e.g. a 16 KiB STM32F4 sector).
    /// Any dirty byte means a full erase-and-rewrite.
    Region,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FlashError<T> {
    /// For operations that fall outside the backing region. The offset (or
    /// offset + length) must be within `fat::IMAGE_BYTES`.
    OutOfRange { requested_offset: usize },
    Other(T),
}

impl<T> From<T> for FlashError<T> {
    fn from(other: T) -> Self {
        FlashError::Other(other)
    }
}

/// Implementors of this trait provide access to the flash region that backs
/// the disk image.
///
/// `erase` and `program_halfword` block the CPU for however long the part
/// takes; callers must only reach for them from the main-loop context (see
/// `Disk::process`), never from the USB transport context.
pub trait Flash {
    type Err: Debug;

    fn granularity(&self) -> EraseGranularity;

    /// Reads `buffer.len()` bytes starting at `offset` into the region.
    ///
    /// Reading is allowed at any time; flash is memory-mapped on the parts
    /// we care about.
    fn read(&mut self, offset: usize, buffer: &mut [u8]) -> Result<(), FlashError<Self::Err>>;

    fn unlock(&mut self) -> Result<(), FlashError<Self::Err>>;
    fn lock(&mut self) -> Result<(), FlashError<Self::Err>>;

    /// Erases `len` bytes starting at `offset`. Both must line up with the
    /// part's erase geometry: a single page for `Page` granularity, the
    /// whole region for `Region`.
    fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError<Self::Err>>;

    /// Programs one little-endian halfword. `offset` must be 2-aligned and
    /// the target must have been erased since it was last programmed.
    fn program_halfword(&mut self, offset: usize, data: u16) -> Result<(), FlashError<Self::Err>>;

    /// Programs a freshly-erased range, halfword by halfword.
    ///
    /// This has a default implementation that just loops over
    /// `program_halfword`; implementations with wider program words can do
    /// better.
    #[inline]
    fn program_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), FlashError<Self::Err>> {
        debug_assert!(bytes.len() % 2 == 0);

        for (idx, pair) in bytes.chunks_exact(2).enumerate() {
            let half = u16::from_le_bytes([pair[0], pair[1]]);
            self.program_halfword(offset + idx * 2, half)?;
        }

        Ok(())
    }
}

using_std! {
    use crate::fat::IMAGE_BYTES;

    /// An in-memory `Flash` for tests and benches.
    ///
    /// Models the properties the commit path depends on: erase sets bytes
    /// to `0xFF`, programming requires the flash to be unlocked, and the
    /// erase granularity is selectable. `fail_next_program` lets tests
    /// exercise the retry path.
    #[derive(Debug, Clone)]
    pub struct RamFlash {
        mem: Vec<u8>,
        granularity: EraseGranularity,
        locked: bool,
        pub fail_next_program: bool,
        pub program_calls: usize,
        pub erase_calls: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum RamFlashError {
        Locked,
        Misaligned,
        FailureInjected,
    }

    impl RamFlash {
        fn new(granularity: EraseGranularity) -> Self {
            Self {
                // Fresh parts read erased.
                mem: vec![0xFF; IMAGE_BYTES],
                granularity,
                locked: true,
                fail_next_program: false,
                program_calls: 0,
                erase_calls: 0,
            }
        }

        /// A part with independently erasable 1 KiB pages (STM32F1-like).
        pub fn small_page() -> Self {
            Self::new(EraseGranularity::Page)
        }

        /// A part whose whole region is one erase unit (STM32F4-like).
        pub fn large_sector() -> Self {
            Self::new(EraseGranularity::Region)
        }

        pub fn contents(&self) -> &[u8] {
            &self.mem
        }

        /// Pre-loads the region, as if a previous session had committed.
        pub fn preload(&mut self, image: &[u8]) {
            self.mem[..image.len()].copy_from_slice(image);
        }
    }

    impl Flash for RamFlash {
        type Err = RamFlashError;

        fn granularity(&self) -> EraseGranularity {
            self.granularity
        }

        fn read(&mut self, offset: usize, buffer: &mut [u8]) -> Result<(), FlashError<RamFlashError>> {
            if offset + buffer.len() > self.mem.len() {
                return Err(FlashError::OutOfRange { requested_offset: offset + buffer.len() });
            }

            buffer.copy_from_slice(&self.mem[offset..offset + buffer.len()]);
            Ok(())
        }

        fn unlock(&mut self) -> Result<(), FlashError<RamFlashError>> {
            self.locked = false;
            Ok(())
        }

        fn lock(&mut self) -> Result<(), FlashError<RamFlashError>> {
            self.locked = true;
            Ok(())
        }

        fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError<RamFlashError>> {
            if self.locked {
                return Err(RamFlashError::Locked.into());
            }
            if offset + len > self.mem.len() {
                return Err(FlashError::OutOfRange { requested_offset: offset + len });
            }

            let expected = match self.granularity {
                EraseGranularity::Page => crate::fat::PAGE_BYTES,
                EraseGranularity::Region => IMAGE_BYTES,
            };
            if len != expected || offset % expected != 0 {
                return Err(RamFlashError::Misaligned.into());
            }

            self.erase_calls += 1;
            for b in &mut self.mem[offset..offset + len] {
                *b = 0xFF;
            }
            Ok(())
        }

        fn program_halfword(&mut self, offset: usize, data: u16) -> Result<(), FlashError<RamFlashError>> {
            if self.locked {
                return Err(RamFlashError::Locked.into());
            }
            if offset % 2 != 0 {
                return Err(RamFlashError::Misaligned.into());
            }
            if offset + 2 > self.mem.len() {
                return Err(FlashError::OutOfRange { requested_offset: offset + 2 });
            }
            if self.fail_next_program {
                self.fail_next_program = false;
                return Err(RamFlashError::FailureInjected.into());
            }

            self.program_calls += 1;
            self.mem[offset..offset + 2].copy_from_slice(&data.to_le_bytes());
            Ok(())
        }
    }
}
