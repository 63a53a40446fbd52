//! The block-device façade and the deferred-commit scheduler.
//!
//! Two caller contexts share a `Disk`: the USB transport calls
//! [`read_sector`](Disk::read_sector) / [`write_sector`](Disk::write_sector)
//! and must never block, and the main loop calls
//! [`process`](Disk::process), which is the only place flash is ever
//! erased or programmed — and only after the host has been idle for
//! [`COMMIT_DELAY_MS`]. Flash erase stalls the CPU for tens of
//! milliseconds on these parts; doing it mid-enumeration wedges the USB
//! stack.

use crate::codec::{self, Scratch};
use crate::fat::boot_sector::BootSector;
use crate::fat::dir::{self, find_config, ConfigLocation};
use crate::fat::{
    DirtyPages, Sector, VolumeImage, DATA_BYTES, DATA_FIRST_SECTOR, FAT1_SECTOR, FAT2_SECTOR,
    IMAGE_BYTES, PAGE_BYTES, ROOT_DIR_OFFSET, ROOT_DIR_SECTOR, SECTOR_BYTES, SECTOR_COUNT,
};
use crate::flash::{EraseGranularity, Flash};
use crate::gatekeeper;
use crate::registry::{PrintFn, Registry, UpdateFn, ValidateFn};

use generic_array::GenericArray;
use typenum::consts::U512;

/// Quiet time after the last accepted host write before dirty state is
/// flushed to flash.
pub const COMMIT_DELAY_MS: u32 = 500;

pub struct Disk<F: Flash> {
    flash: F,

    image: VolumeImage,
    dirty: DirtyPages,
    registry: Registry,
    scratch: Scratch,

    /// Rendered once; handed back on every read of sector 0.
    boot: GenericArray<u8, U512>,

    pending: bool,
    last_write_ms: u32,
    /// Whether the root directory has shown a non-empty `CONFIG.TXT`;
    /// feeds the gatekeeper's transient-deletion rule.
    saw_config: bool,
}

impl<F: Flash> Disk<F> {
    pub fn new(flash: F) -> Self {
        let mut boot = GenericArray::default();
        BootSector::new().write(&mut boot);

        Self {
            flash,
            image: VolumeImage::new(),
            dirty: DirtyPages::new(),
            registry: Registry::new(),
            scratch: Scratch::new(),
            boot,
            pending: false,
            last_write_ms: 0,
            saw_config: false,
        }
    }

    pub fn sector_size(&self) -> u32 {
        SECTOR_BYTES as u32
    }

    pub fn sector_count(&self) -> u32 {
        SECTOR_COUNT
    }

    /// Registers a configuration entry; see [`Registry::register`].
    pub fn register_entry(
        &mut self,
        label: &str,
        default_value: Option<&'static str>,
        comment: &str,
        validate: Option<ValidateFn>,
        update: Option<UpdateFn>,
        print: Option<PrintFn>,
    ) -> bool {
        self.registry.register(label, default_value, comment, validate, update, print)
    }

    /// Re-populates the mirror from flash and drops all dirty state.
    pub fn reload_from_flash(&mut self) {
        if let Err(e) = self.flash.read(0, self.image.as_mut_bytes()) {
            log::error!("unable to read flash region: {:?}", e);
        }
        self.dirty.clear_all();
        self.pending = false;
        log::debug!("loaded disk image from flash");
    }

    /// Loads the mirror from flash and brings it to canonical shape:
    /// normalizes an existing `CONFIG.TXT`, or synthesizes one from
    /// registry defaults onto a blank volume. A commit is scheduled only
    /// if something actually changed.
    pub fn init(&mut self, now_ms: u32) {
        self.reload_from_flash();

        match find_config(self.image.root_dir()) {
            Some(loc) => {
                let repaired = codec::normalize(
                    &mut self.image,
                    &mut self.dirty,
                    &self.registry,
                    &mut self.scratch,
                    &mut self.flash,
                    &loc,
                );
                self.saw_config = true;
                if repaired {
                    self.pending = true;
                    self.last_write_ms = now_ms;
                }
            }
            None => {
                codec::bootstrap(&mut self.image, &mut self.dirty, &self.registry, &mut self.scratch);
                self.saw_config = true;
                self.pending = true;
                self.last_write_ms = now_ms;
            }
        }
    }

    /// Serves one sector to the host. Pure — never touches state — and
    /// safe to call before any entry is registered.
    pub fn read_sector(&self, sector: Sector, out: &mut GenericArray<u8, U512>) {
        let out = out.as_mut_slice();

        match sector {
            0 => {
                log::trace!("read boot sector");
                out.copy_from_slice(self.boot.as_slice());
            }
            FAT1_SECTOR => out.copy_from_slice(self.image.fat1()),
            FAT2_SECTOR => out.copy_from_slice(self.image.fat2()),
            ROOT_DIR_SECTOR => out.copy_from_slice(self.image.root_dir()),

            s if s >= DATA_FIRST_SECTOR && s < SECTOR_COUNT => {
                let offset = (s - DATA_FIRST_SECTOR) as usize * SECTOR_BYTES;
                if offset + SECTOR_BYTES <= DATA_BYTES {
                    out.copy_from_slice(&self.image.data()[offset..offset + SECTOR_BYTES]);
                } else {
                    // Allocatable but never materialized: reads as zeros.
                    zero(out);
                }
            }

            s if s < SECTOR_COUNT => {
                // Reserved/filler sectors inside the advertised disk.
                zero(out);
            }

            s => {
                log::warn!("read of out-of-range sector {}", s);
                zero(out);
            }
        }
    }

    /// Accepts a host write of one or more whole sectors starting at
    /// `first_sector` (`buf.len()` must be a multiple of 512). Each sector
    /// is screened by the gatekeeper; the commit clock restarts whether or
    /// not anything was kept.
    pub fn write_sector(&mut self, buf: &[u8], first_sector: Sector, now_ms: u32) {
        debug_assert!(buf.len() % SECTOR_BYTES == 0);

        for (idx, payload) in buf.chunks_exact(SECTOR_BYTES).enumerate() {
            gatekeeper::handle_sector(
                &mut self.image,
                &mut self.dirty,
                &self.registry,
                &mut self.saw_config,
                first_sector + idx as u32,
                payload,
            );
        }

        self.pending = true;
        self.last_write_ms = now_ms;
    }

    /// Main-loop tick: once the host has been quiet for
    /// [`COMMIT_DELAY_MS`], re-validate `CONFIG.TXT` (every sector of the
    /// burst has landed by now) and flush dirty pages to flash.
    pub fn process(&mut self, now_ms: u32) {
        if !self.pending || now_ms.wrapping_sub(self.last_write_ms) < COMMIT_DELAY_MS {
            return;
        }

        match find_config(self.image.root_dir()) {
            Some(loc) if loc.size > 0 => {
                codec::normalize(
                    &mut self.image,
                    &mut self.dirty,
                    &self.registry,
                    &mut self.scratch,
                    &mut self.flash,
                    &loc,
                );
                self.saw_config = true;
            }
            _ => {
                // The host deleted the file (or a metadata file took over
                // its directory slot) and never brought it back. Reinstate
                // it at the canonical location; the data region still holds
                // the protected content, so prior values survive.
                log::info!("CONFIG.TXT missing from root; reinstating");
                let entry = dir::synthesize_config(2);
                self.image.write_bytes(ROOT_DIR_OFFSET, &entry, &mut self.dirty);

                let loc = ConfigLocation { index: 0, start_cluster: 2, size: 0 };
                codec::normalize(
                    &mut self.image,
                    &mut self.dirty,
                    &self.registry,
                    &mut self.scratch,
                    &mut self.flash,
                    &loc,
                );
                self.saw_config = true;
            }
        }

        self.commit();
    }

    /// Writes dirty pages out. Page-granular parts drain one page per tick
    /// to bound main-loop latency; region-granular parts rewrite the whole
    /// image in one pass. A failed erase/program leaves the page marked so
    /// the next tick retries.
    fn commit(&mut self) {
        if self.dirty.none() {
            self.pending = false;
            return;
        }

        if let Err(e) = self.flash.unlock() {
            log::error!("unable to unlock flash: {:?}", e);
            return;
        }

        let drained = match self.flash.granularity() {
            EraseGranularity::Page => self.commit_one_page(),
            EraseGranularity::Region => self.commit_region(),
        };

        if let Err(e) = self.flash.lock() {
            log::error!("unable to lock flash: {:?}", e);
        }

        self.pending = !drained;
        if drained {
            log::debug!("flash commit complete");
        }
    }

    fn commit_one_page(&mut self) -> bool {
        let page = match self.dirty.first() {
            Some(page) => page,
            None => return true,
        };
        self.dirty.clear(page);

        let offset = page * PAGE_BYTES;
        let mut result = self.flash.erase(offset, PAGE_BYTES);
        if result.is_ok() {
            result = self
                .flash
                .program_bytes(offset, &self.image.as_bytes()[offset..offset + PAGE_BYTES]);
        }

        if let Err(e) = result {
            log::error!("flash write for page {} failed: {:?}", page, e);
            self.dirty.set(page);
        }

        self.dirty.none()
    }

    fn commit_region(&mut self) -> bool {
        // The whole region goes; clear the set up front so host writes
        // arriving mid-rewrite get tracked for the next pass.
        self.dirty.clear_all();
        log::trace!("erasing flash region");

        let mut result = self.flash.erase(0, IMAGE_BYTES);
        if result.is_ok() {
            result = self.flash.program_bytes(0, self.image.as_bytes());
        }

        if let Err(e) = result {
            log::error!("flash region rewrite failed: {:?}", e);
            self.dirty.mark_all();
            return false;
        }

        true
    }

    pub fn entry_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_commit_pending(&self) -> bool {
        self.pending
    }

    pub fn image(&self) -> &VolumeImage {
        &self.image
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }
}

fn zero(out: &mut [u8]) {
    for b in out.iter_mut() {
        *b = 0;
    }
}

#[cfg(test)]
mod disk {
    use super::*;
    use crate::flash::RamFlash;

    use assert_eq as eq;

    fn disk(flash: RamFlash) -> Disk<RamFlash> {
        let mut d = Disk::new(flash);
        d.register_entry("SSID", Some("net"), "# network", None, None, None);
        d.register_entry("PSK", Some("pw"), "# key", None, None, None);
        d
    }

    fn sector(d: &Disk<RamFlash>, idx: u32) -> Vec<u8> {
        let mut out = GenericArray::default();
        d.read_sector(idx, &mut out);
        out.as_slice().to_vec()
    }

    #[test]
    fn read_map_matches_the_advertised_layout() {
        let mut d = disk(RamFlash::small_page());
        d.init(0);

        let boot = sector(&d, 0);
        eq!(&boot[0x036..0x03E], b"FAT12   ");

        for filler in [1u32, 7, 9, 19, 21, 31, 33, 63, 100, 4095].iter() {
            assert!(sector(&d, *filler).iter().all(|b| *b == 0), "sector {}", filler);
        }
        assert!(sector(&d, 4096).iter().all(|b| *b == 0));

        eq!(sector(&d, 8), d.image().fat1().to_vec());
        eq!(sector(&d, 20), d.image().fat2().to_vec());
        eq!(sector(&d, 32), d.image().root_dir().to_vec());
        assert!(sector(&d, 64).starts_with(b"SSID=net"));
    }

    #[test]
    fn cold_boot_commits_defaults_after_the_delay() {
        let mut d = disk(RamFlash::small_page());
        d.init(0);
        assert!(d.is_commit_pending());

        // Too early: nothing programmed.
        d.process(COMMIT_DELAY_MS - 1);
        eq!(d.flash().program_calls, 0);

        // Page mode drains one page per tick.
        let mut tick = COMMIT_DELAY_MS;
        while d.is_commit_pending() {
            d.process(tick);
            tick += 10;
        }

        eq!(d.flash().contents(), d.image().as_bytes());
    }

    #[test]
    fn second_init_round_trips_without_a_reflash() {
        let mut d = disk(RamFlash::small_page());
        d.init(0);
        let mut tick = COMMIT_DELAY_MS;
        while d.is_commit_pending() {
            d.process(tick);
            tick += 10;
        }

        // Same flash, fresh driver: everything round-trips, nothing to do.
        let flash = d.flash().clone();
        let mut d2 = disk(flash);
        d2.init(0);

        assert!(!d2.is_commit_pending());
        eq!(d2.flash().contents(), d2.image().as_bytes());
    }

    #[test]
    fn tick_wraparound_still_fires() {
        let mut d = disk(RamFlash::large_sector());
        d.init(u32::max_value() - 100);

        d.process(u32::max_value() - 50); // not yet
        eq!(d.flash().erase_calls, 0);

        d.process(400); // wrapped past the delay
        assert!(!d.is_commit_pending());
        eq!(d.flash().erase_calls, 1);
    }

    #[test]
    fn failed_program_is_retried_next_tick() {
        let mut d = disk(RamFlash::large_sector());
        d.init(0);

        d.flash_mut().fail_next_program = true;
        d.process(COMMIT_DELAY_MS);
        assert!(d.is_commit_pending());

        d.process(COMMIT_DELAY_MS + 10);
        assert!(!d.is_commit_pending());
        eq!(d.flash().contents(), d.image().as_bytes());
    }
}
