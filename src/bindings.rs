//! C Bindings for this crate.
//!
//! The firmware's C side provides the HAL (flash access, the millisecond
//! tick, and — under `external_mutex` — the USB IRQ mask hooks); we
//! provide the disk. One `Disk` singleton lives behind the crate mutex and
//! every export funnels through it, so the USB transport context and the
//! main loop never race on it.

use crate::disk::Disk;
use crate::fat::{SECTOR_BYTES, SECTOR_COUNT};
use crate::mutex::{Mutex, MutexInterface};
use crate::registry::MAX_ENTRIES;

use generic_array::GenericArray;

use core::slice;
use core::str;

pub mod hal {
    //! The HAL functions the C side must provide.

    use crate::flash::{EraseGranularity, Flash, FlashError};
    use crate::fat::IMAGE_BYTES;

    /// `HAL_StatusTypeDef`, as the ST HALs define it.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum HalStatus {
        Ok = 0,
        Error = 1,
        Busy = 2,
        Timeout = 3,
    }

    extern "C" {
        /// Copies `len` bytes from the backing region (offset-relative)
        /// into `buffer`.
        pub fn cfgdisk_flash_read(offset: u32, buffer: *mut u8, len: u32) -> HalStatus;
        pub fn cfgdisk_flash_unlock() -> HalStatus;
        pub fn cfgdisk_flash_lock() -> HalStatus;
        pub fn cfgdisk_flash_erase(offset: u32, len: u32) -> HalStatus;
        pub fn cfgdisk_flash_program_halfword(offset: u32, data: u16) -> HalStatus;
        /// Nonzero when the part erases in 1 KiB pages; zero when the
        /// whole region is a single erase unit.
        pub fn cfgdisk_flash_page_granular() -> u8;

        /// Monotonic millisecond tick (`HAL_GetTick`).
        pub fn cfgdisk_now_ms() -> u32;
    }

    pub struct HalFlash;

    impl Flash for HalFlash {
        type Err = HalStatus;

        fn granularity(&self) -> EraseGranularity {
            if unsafe { cfgdisk_flash_page_granular() } != 0 {
                EraseGranularity::Page
            } else {
                EraseGranularity::Region
            }
        }

        fn read(&mut self, offset: usize, buffer: &mut [u8]) -> Result<(), FlashError<HalStatus>> {
            if offset + buffer.len() > IMAGE_BYTES {
                return Err(FlashError::OutOfRange { requested_offset: offset + buffer.len() });
            }

            match unsafe {
                cfgdisk_flash_read(offset as u32, buffer.as_mut_ptr(), buffer.len() as u32)
            } {
                HalStatus::Ok => Ok(()),
                e => Err(e.into()),
            }
        }

        fn unlock(&mut self) -> Result<(), FlashError<HalStatus>> {
            match unsafe { cfgdisk_flash_unlock() } {
                HalStatus::Ok => Ok(()),
                e => Err(e.into()),
            }
        }

        fn lock(&mut self) -> Result<(), FlashError<HalStatus>> {
            match unsafe { cfgdisk_flash_lock() } {
                HalStatus::Ok => Ok(()),
                e => Err(e.into()),
            }
        }

        fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError<HalStatus>> {
            if offset + len > IMAGE_BYTES {
                return Err(FlashError::OutOfRange { requested_offset: offset + len });
            }

            match unsafe { cfgdisk_flash_erase(offset as u32, len as u32) } {
                HalStatus::Ok => Ok(()),
                e => Err(e.into()),
            }
        }

        fn program_halfword(&mut self, offset: usize, data: u16) -> Result<(), FlashError<HalStatus>> {
            if offset + 2 > IMAGE_BYTES {
                return Err(FlashError::OutOfRange { requested_offset: offset + 2 });
            }

            match unsafe { cfgdisk_flash_program_halfword(offset as u32, data) } {
                HalStatus::Ok => Ok(()),
                e => Err(e.into()),
            }
        }
    }
}

static DISK: Mutex<Option<Disk<hal::HalFlash>>> = Mutex::new(None);

fn with_disk<R, F: FnOnce(&mut Disk<hal::HalFlash>) -> R>(func: F) -> Option<R> {
    DISK.cs(|slot| slot.as_mut().map(func))
}

#[no_mangle]
pub extern "C" fn cfgdisk_init() {
    let now = unsafe { hal::cfgdisk_now_ms() };
    DISK.cs(|slot| {
        slot.get_or_insert_with(|| Disk::new(hal::HalFlash)).init(now);
    });
}

#[no_mangle]
pub extern "C" fn cfgdisk_reload_from_flash() {
    with_disk(|disk| disk.reload_from_flash());
}

#[no_mangle]
pub extern "C" fn cfgdisk_process() {
    let now = unsafe { hal::cfgdisk_now_ms() };
    with_disk(|disk| disk.process(now));
}

#[no_mangle]
pub extern "C" fn cfgdisk_sector_size() -> u32 {
    SECTOR_BYTES as u32
}

#[no_mangle]
pub extern "C" fn cfgdisk_sector_count() -> u32 {
    SECTOR_COUNT
}

/// # Safety
///
/// `buffer` must point at 512 writable bytes.
#[no_mangle]
pub unsafe extern "C" fn cfgdisk_read_sector(buffer: *mut u8, sector: u32) {
    let out = slice::from_raw_parts_mut(buffer, SECTOR_BYTES);

    let served =
        with_disk(|disk| disk.read_sector(sector, GenericArray::from_mut_slice(&mut *out)));
    if served.is_none() {
        // Not initialized yet; the transport gets zeros.
        for b in out.iter_mut() {
            *b = 0;
        }
    }
}

/// # Safety
///
/// `buffer` must point at `nsectors * 512` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn cfgdisk_write_sector(buffer: *const u8, sector: u32, nsectors: u32) -> u8 {
    let buf = slice::from_raw_parts(buffer, nsectors as usize * SECTOR_BYTES);
    let now = hal::cfgdisk_now_ms();

    with_disk(|disk| disk.write_sector(buf, sector, now));
    0
}

/// The C callback signatures, as the firmware declares them. Values handed
/// to `validate`/`update` are NUL-terminated.
pub type CValidateFn = unsafe extern "C" fn(value: *const u8) -> bool;
pub type CUpdateFn = unsafe extern "C" fn(value: *const u8);
/// Writes a NUL-terminated `KEY=VALUE` line into the buffer.
pub type CPrintFn = unsafe extern "C" fn(out: *mut u8, cap: usize);

/// # Safety
///
/// `label` and `comment` must be NUL-terminated strings. `default_value`
/// may be null; when it isn't, it must be NUL-terminated and stay valid
/// for the life of the program (it is borrowed, not copied).
#[no_mangle]
pub unsafe extern "C" fn cfgdisk_register_entry(
    label: *const u8,
    default_value: *const u8,
    comment: *const u8,
    validate: Option<CValidateFn>,
    update: Option<CUpdateFn>,
    print: Option<CPrintFn>,
) -> bool {
    let label = match cstr(label) {
        Some(s) => s,
        None => return false,
    };
    let comment = cstr(comment).unwrap_or("");
    let default_value = cstr(default_value);

    DISK.cs(|slot| {
        let disk = slot.get_or_insert_with(|| Disk::new(hal::HalFlash));

        let idx = disk.entry_count();
        if idx >= MAX_ENTRIES {
            return false;
        }

        // Hook installation and all later hook calls happen inside the
        // disk's critical section, so the static table is never raced.
        unsafe { thunks::install(idx, validate, update, print) };

        disk.register_entry(
            label,
            default_value,
            comment,
            validate.map(|_| thunks::VALIDATE[idx]),
            update.map(|_| thunks::UPDATE[idx]),
            print.map(|_| thunks::PRINT[idx]),
        )
    })
}

/// Reads a NUL-terminated C string. Returns `None` for null pointers and
/// non-UTF-8 content. The 4 KiB cap bounds the scan for strings that were
/// never terminated.
unsafe fn cstr<'a>(ptr: *const u8) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }

    let mut len = 0;
    while len < 4096 && *ptr.add(len) != 0 {
        len += 1;
    }

    str::from_utf8(slice::from_raw_parts(ptr, len)).ok()
}

mod thunks {
    //! Per-slot trampolines from the registry's plain `fn` callbacks to
    //! the C function pointers.
    //!
    //! The registry dispatches through Rust `fn` pointers, which cannot
    //! close over a slot index, so each of the 8 slots gets its own
    //! monomorphic trampoline reading the C pointer from this table.

    use super::{CPrintFn, CUpdateFn, CValidateFn};
    use crate::registry::{PrintFn, UpdateFn, ValidateFn, MAX_ENTRIES};

    // Written once per slot under the disk mutex, read under the same
    // mutex during normalization.
    static mut HOOKS: [(Option<CValidateFn>, Option<CUpdateFn>, Option<CPrintFn>); MAX_ENTRIES] =
        [(None, None, None); MAX_ENTRIES];

    pub(super) unsafe fn install(
        idx: usize,
        validate: Option<CValidateFn>,
        update: Option<CUpdateFn>,
        print: Option<CPrintFn>,
    ) {
        HOOKS[idx] = (validate, update, print);
    }

    macro_rules! thunk_slots {
        ($($slot:ident => $idx:expr),* $(,)?) => {
            $(
                mod $slot {
                    use super::HOOKS;

                    // Values from the codec are backed by a NUL-terminated
                    // scratch buffer, which is what the C side scans for.
                    pub fn validate(value: &[u8]) -> bool {
                        unsafe { (HOOKS[$idx].0.unwrap())(value.as_ptr()) }
                    }

                    pub fn update(value: &[u8]) {
                        unsafe { (HOOKS[$idx].1.unwrap())(value.as_ptr()) }
                    }

                    pub fn print(out: &mut [u8]) -> usize {
                        unsafe { (HOOKS[$idx].2.unwrap())(out.as_mut_ptr(), out.len()) };
                        out.iter().position(|b| *b == 0).unwrap_or(out.len())
                    }
                }
            )*

            pub(super) static VALIDATE: [ValidateFn; MAX_ENTRIES] = [$($slot::validate),*];
            pub(super) static UPDATE: [UpdateFn; MAX_ENTRIES] = [$($slot::update),*];
            pub(super) static PRINT: [PrintFn; MAX_ENTRIES] = [$($slot::print),*];
        };
    }

    thunk_slots! {
        slot0 => 0, slot1 => 1, slot2 => 2, slot3 => 3,
        slot4 => 4, slot5 => 5, slot6 => 6, slot7 => 7,
    }
}
