//! FAT12 layout knowledge: geometry, the RAM mirror of the disk, and the
//! dirty-page bookkeeping that feeds the flash commit path.
//!
//! The advertised disk is much larger than what we actually keep in RAM:
//! only the first sector of each FAT, the first root-directory sector, and
//! the file-data run hold meaningful bytes. Everything else reads as
//! zeros, and writes to those filler sectors are accepted and dropped.

use crate::util::BitMap;

use typenum::consts::U16;

pub mod boot_sector;
pub mod table;
pub mod dir;

pub type Sector = u32;
pub type Cluster = u16;

/// Bytes per sector; also bytes per cluster (1 sector/cluster).
pub const SECTOR_BYTES: usize = 512;
/// Sectors the volume advertises to the host.
pub const SECTOR_COUNT: u32 = 4096;

/// Reserved region: sectors 0..8, boot sector at 0.
pub const RESERVED_SECTORS: u32 = 8;
/// Sectors per FAT copy (only the first of each is materialized).
pub const SECTORS_PER_FAT: u32 = 12;
pub const FAT1_SECTOR: Sector = 8;
pub const FAT2_SECTOR: Sector = 20;
/// Root directory: 32 sectors (512 entries); only the first sector (16
/// entries) is materialized, and directory scans stop there.
pub const ROOT_DIR_SECTOR: Sector = 32;
pub const ROOT_DIR_SECTORS: u32 = 32;
/// First data sector; this is cluster 2.
pub const DATA_FIRST_SECTOR: Sector = 64;

/// Size of the RAM mirror (and of the backing flash region).
pub const IMAGE_BYTES: usize = 0x4000;

// Mirror layout:
//   0x0000..0x0200  FAT1
//   0x0200..0x0400  FAT2
//   0x0400..0x0600  root directory
//   0x0600..0x4000  file data (cluster 2 onward)
pub const FAT1_OFFSET: usize = 0x0000;
pub const FAT2_OFFSET: usize = 0x0200;
pub const ROOT_DIR_OFFSET: usize = 0x0400;
pub const DATA_OFFSET: usize = 0x0600;
pub const DATA_BYTES: usize = IMAGE_BYTES - DATA_OFFSET;

/// Flash pages tracked for dirtiness (matches the smallest erase unit we
/// target; larger-granularity parts just commit the whole region).
pub const PAGE_BYTES: usize = 1024;
pub const PAGE_COUNT: usize = IMAGE_BYTES / PAGE_BYTES;

pub const fn sector_to_cluster(sector: Sector) -> Cluster {
    (sector - DATA_FIRST_SECTOR + 2) as Cluster
}

/// The set of flash pages on which the mirror and flash disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyPages {
    map: BitMap<U16>,
}

impl DirtyPages {
    pub fn new() -> Self {
        Self { map: BitMap::new() }
    }

    /// Marks every page overlapping `offset..offset + len`.
    pub fn mark(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }

        let first = offset / PAGE_BYTES;
        let last = (offset + len - 1) / PAGE_BYTES;
        for page in first..=last {
            let _ = self.map.set(page, true);
        }
    }

    pub fn mark_all(&mut self) {
        self.map.set_all();
    }

    pub fn clear(&mut self, page: usize) {
        let _ = self.map.set(page, false);
    }

    pub fn clear_all(&mut self) {
        self.map.clear_all();
    }

    pub fn set(&mut self, page: usize) {
        let _ = self.map.set(page, true);
    }

    pub fn get(&self, page: usize) -> bool {
        self.map.get(page).unwrap_or(false)
    }

    pub fn none(&self) -> bool {
        self.map.none_set()
    }

    pub fn first(&mut self) -> Option<usize> {
        self.map.first_set().ok()
    }
}

/// The RAM mirror of the flash region; single source of truth while a host
/// session is live.
///
/// All mutation goes through [`write_bytes`](VolumeImage::write_bytes) and
/// [`fill_zero`](VolumeImage::fill_zero), which compare before they copy:
/// pages only become dirty when bytes actually change, so a no-op
/// normalization round-trip leaves nothing to commit.
pub struct VolumeImage {
    buf: [u8; IMAGE_BYTES],
}

impl VolumeImage {
    pub const fn new() -> Self {
        Self { buf: [0; IMAGE_BYTES] }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn fat1(&self) -> &[u8] {
        &self.buf[FAT1_OFFSET..FAT1_OFFSET + SECTOR_BYTES]
    }

    pub fn fat2(&self) -> &[u8] {
        &self.buf[FAT2_OFFSET..FAT2_OFFSET + SECTOR_BYTES]
    }

    pub fn root_dir(&self) -> &[u8] {
        &self.buf[ROOT_DIR_OFFSET..ROOT_DIR_OFFSET + SECTOR_BYTES]
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[DATA_OFFSET..]
    }

    /// Copies `src` to `offset`, page chunk by page chunk, marking only the
    /// pages whose contents actually change.
    pub fn write_bytes(&mut self, offset: usize, src: &[u8], dirty: &mut DirtyPages) {
        debug_assert!(offset + src.len() <= IMAGE_BYTES);

        let mut at = offset;
        let mut remaining = src;
        while !remaining.is_empty() {
            let page = at / PAGE_BYTES;
            let page_end = (page + 1) * PAGE_BYTES;
            let n = remaining.len().min(page_end - at);

            let (chunk, rest) = remaining.split_at(n);
            if &self.buf[at..at + n] != chunk {
                self.buf[at..at + n].copy_from_slice(chunk);
                dirty.set(page);
            }

            at += n;
            remaining = rest;
        }
    }

    /// Zeroes `offset..offset + len`, marking only pages that held nonzero
    /// bytes.
    pub fn fill_zero(&mut self, offset: usize, len: usize, dirty: &mut DirtyPages) {
        debug_assert!(offset + len <= IMAGE_BYTES);

        let mut at = offset;
        let end = offset + len;
        while at < end {
            let page = at / PAGE_BYTES;
            let page_end = (page + 1) * PAGE_BYTES;
            let n = (end - at).min(page_end - at);

            if self.buf[at..at + n].iter().any(|b| *b != 0) {
                for b in &mut self.buf[at..at + n] {
                    *b = 0;
                }
                dirty.set(page);
            }

            at += n;
        }
    }
}
