//! The write gatekeeper: decides, sector by sector, what a host write is
//! allowed to touch.
//!
//! The problem this solves: macOS (and friends) "save" a file by deleting
//! it and writing a new one, and in between they spray metadata files
//! (`._CONFIG.TXT`, `.fseventsd`, ...) whose clusters the host FAT driver
//! happily allocates right where `CONFIG.TXT` used to live. Accepting
//! those bytes verbatim would shred the canonical image, so data-area
//! writes are screened: the cluster the directory says belongs to
//! `CONFIG.TXT` is always writable, the canonical cluster demands content
//! that starts with a registered `label=`, and everything else in range is
//! checked against a small dot-file signature.

use crate::fat::dir::find_config;
use crate::fat::{
    sector_to_cluster, DirtyPages, Sector, VolumeImage, DATA_BYTES, DATA_FIRST_SECTOR, DATA_OFFSET,
    FAT1_OFFSET, FAT1_SECTOR, FAT2_OFFSET, FAT2_SECTOR, PAGE_BYTES, ROOT_DIR_OFFSET,
    ROOT_DIR_SECTOR, SECTOR_BYTES, SECTOR_COUNT,
};
use crate::registry::Registry;

const FAT_PAGE: usize = FAT1_OFFSET / PAGE_BYTES;
const ROOT_PAGE: usize = ROOT_DIR_OFFSET / PAGE_BYTES;

/// What to do with one incoming sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Zero-filler, reserved, or out-of-mirror sector: accept and drop.
    Ignore,
    Fat1,
    Fat2,
    RootDir,
    /// Data-area write accepted at this offset into the data region.
    Data { offset: usize },
    Reject(Reason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Non-config content aimed at the canonical cluster.
    ForeignAtCanonical,
    /// Content matching the dot-file signature aimed at a cluster that
    /// could be part of our file.
    DotFileSignature,
}

/// First byte `0x00` (resource-fork padding), `0x05` (deleted-entry
/// marker), or a `.` leading actual content. Empirical, but the invariant
/// that matters is that non-config bytes never land at canonical offsets;
/// [`classify`] only consults this where that invariant is at stake.
fn looks_like_dot_file(payload: &[u8]) -> bool {
    match payload[0] {
        0x00 | 0x05 => true,
        b'.' => payload.get(1).map_or(false, |b| *b != 0),
        _ => false,
    }
}

/// Classifies one sector of a host write. Pure: consults the mirror and
/// registry but changes nothing.
pub fn classify(
    image: &VolumeImage,
    registry: &Registry,
    sector: Sector,
    payload: &[u8],
) -> Disposition {
    match sector {
        FAT1_SECTOR => Disposition::Fat1,
        FAT2_SECTOR => Disposition::Fat2,
        ROOT_DIR_SECTOR => Disposition::RootDir,

        s if s >= DATA_FIRST_SECTOR && s < SECTOR_COUNT => {
            let offset = (s - DATA_FIRST_SECTOR) as usize * SECTOR_BYTES;
            if offset + SECTOR_BYTES > DATA_BYTES {
                // Past what the mirror materializes.
                return Disposition::Ignore;
            }

            let cluster = sector_to_cluster(s);
            let config_cluster = find_config(image.root_dir())
                .map(|loc| loc.start_cluster)
                .unwrap_or(0);

            // The active copy of the file, wherever the host put it.
            if config_cluster > 0 && cluster == config_cluster {
                return Disposition::Data { offset };
            }

            if cluster == 2 {
                // Our normalized location: only file-shaped content may
                // land here.
                if registry.looks_like_config(payload) {
                    Disposition::Data { offset }
                } else {
                    Disposition::Reject(Reason::ForeignAtCanonical)
                }
            } else if (cluster as usize) <= 2 + DATA_BYTES / SECTOR_BYTES
                && registry.looks_like_config(image.data())
            {
                // Could be a continuation of the file; screen for host
                // metadata patterns.
                if looks_like_dot_file(payload) {
                    Disposition::Reject(Reason::DotFileSignature)
                } else {
                    Disposition::Data { offset }
                }
            } else {
                Disposition::Data { offset }
            }
        }

        _ => Disposition::Ignore,
    }
}

/// Classifies and applies one sector of a host write.
///
/// `saw_config` is the cross-write memory behind the transient-deletion
/// rule: when the host rewrites the root directory with a zero-size (or
/// absent) `CONFIG.TXT` right after we had real content, the FAT and
/// root-dir dirt is dropped so the deletion never reaches flash — the
/// recreate that follows coalesces into the same commit window.
pub(crate) fn handle_sector(
    image: &mut VolumeImage,
    dirty: &mut DirtyPages,
    registry: &Registry,
    saw_config: &mut bool,
    sector: Sector,
    payload: &[u8],
) {
    match classify(image, registry, sector, payload) {
        Disposition::Ignore => { }

        Disposition::Fat1 => {
            if payload != image.fat1() {
                image.write_bytes(FAT1_OFFSET, payload, dirty);
            }
        }

        Disposition::Fat2 => {
            if payload != image.fat2() {
                image.write_bytes(FAT2_OFFSET, payload, dirty);
            }
        }

        Disposition::RootDir => {
            if payload == image.root_dir() {
                return;
            }
            image.write_bytes(ROOT_DIR_OFFSET, payload, dirty);

            match find_config(image.root_dir()) {
                Some(loc) if loc.size > 0 => {
                    log::trace!(
                        "root update: CONFIG.TXT cluster={} size={}",
                        loc.start_cluster,
                        loc.size
                    );
                    *saw_config = true;
                    dirty.set(FAT_PAGE);
                }
                _ => {
                    if *saw_config {
                        log::trace!("root update: transient deletion, holding back commit");
                        *saw_config = false;
                        dirty.clear(FAT_PAGE);
                        dirty.clear(ROOT_PAGE);
                    } else {
                        dirty.set(FAT_PAGE);
                    }
                }
            }
        }

        Disposition::Data { offset } => {
            image.write_bytes(DATA_OFFSET + offset, payload, dirty);
        }

        Disposition::Reject(reason) => {
            log::trace!(
                "rejecting write to sector {} ({:?}, first byte 0x{:02X})",
                sector,
                reason,
                payload[0]
            );
        }
    }
}
