//! The `CONFIG.TXT` codec: parse whatever the host handed us, run it past
//! the registry, and lay the canonical form back down.
//!
//! Normalization is the part that makes the rest of the system tractable:
//! whatever cluster the host's FAT driver picked, whatever line endings
//! the editor used, whatever half-valid values the user typed — after
//! `normalize` the file starts at cluster 2, the FAT is a single
//! contiguous chain, and the content is the registry's canonical
//! serialization. Reads and the write gatekeeper can then assume that
//! shape.

use crate::fat::dir::{self, ConfigLocation, ENTRY_BYTES};
use crate::fat::{
    table, DirtyPages, VolumeImage, DATA_BYTES, DATA_OFFSET, FAT1_OFFSET, FAT2_OFFSET,
    ROOT_DIR_OFFSET, SECTOR_BYTES,
};
use crate::flash::Flash;
use crate::registry::{Entry, Registry, MAX_COMMENT_BYTES, MAX_ENTRIES};

/// Longest accepted line (generous, for private keys).
pub const MAX_LINE_BYTES: usize = 2048;
/// Longest serialized file.
pub const MAX_FILE_BYTES: usize = 8192;

const RENDER_BYTES: usize = MAX_LINE_BYTES + MAX_COMMENT_BYTES;

/// Parse/render buffers, too large for an embedded stack; they live inside
/// the `Disk` value instead.
pub struct Scratch {
    /// Snapshot of the parse source.
    file_buf: [u8; MAX_FILE_BYTES],
    /// One rendered line + its comment.
    line_buf: [u8; RENDER_BYTES],
    /// One extracted value, NUL-terminated for the C callback contract.
    value_buf: [u8; MAX_LINE_BYTES],
}

impl Scratch {
    pub const fn new() -> Self {
        Self {
            file_buf: [0; MAX_FILE_BYTES],
            line_buf: [0; RENDER_BYTES],
            value_buf: [0; MAX_LINE_BYTES],
        }
    }
}

/// Re-parses `CONFIG.TXT`, applies accepted values through the registry,
/// and rewrites the mirror into canonical layout. Returns whether anything
/// had to be repaired (bad value, missing line, unusable source).
///
/// `loc` is where the root directory currently claims the file lives; the
/// actual parse source is chosen from (in preference order) the mirror at
/// that location, the mirror's canonical location, and the flash copy.
/// Rejected host writes never reach the mirror, so the first candidate is
/// exactly what the gatekeeper accepted.
pub fn normalize<F: Flash>(
    image: &mut VolumeImage,
    dirty: &mut DirtyPages,
    registry: &Registry,
    scratch: &mut Scratch,
    flash: &mut F,
    loc: &ConfigLocation,
) -> bool {
    let mut repaired = select_source(image, registry, scratch, flash, loc);

    let Scratch { file_buf, line_buf, value_buf } = scratch;

    // Split the snapshot into lines (CRLF or LF; a NUL ends the file). We
    // keep at most one line per possible entry.
    let mut lines = [(0usize, 0usize); MAX_ENTRIES];
    let mut line_count = 0;
    {
        let mut at = 0;
        while line_count < MAX_ENTRIES && at < MAX_FILE_BYTES && file_buf[at] != 0 {
            let start = at;
            while at < MAX_FILE_BYTES && file_buf[at] != 0 {
                match file_buf[at] {
                    b'\n' => break,
                    b'\r' if file_buf.get(at + 1) == Some(&b'\n') => break,
                    _ => at += 1,
                }
            }
            lines[line_count] = (start, at);
            line_count += 1;

            // Step over the terminator we stopped on.
            if at < MAX_FILE_BYTES {
                at += match file_buf[at] {
                    b'\r' => 2,
                    b'\n' => 1,
                    _ => break, // NUL or end of buffer
                };
            }
        }
    }
    log::trace!("parsed {} line(s)", line_count);

    // Resolve and serialize in registration order. `m` tracks the
    // serialized length; once the file would overflow we stop emitting but
    // still resolve the remaining entries so their `update` hooks run.
    let mut m = 0;
    let mut full = false;
    for entry in registry.iter() {
        let found = lines[..line_count]
            .iter()
            .find(|&&(s, e)| entry.matches_prefix(&file_buf[s..e]))
            .copied();

        let rendered = match found {
            Some((s, e)) => {
                let raw_value = &file_buf[s + entry.label().len() + 1..e];
                // Whole lines are capped at MAX_LINE_BYTES; clamping the
                // value to what the line can hold keeps what `validate`
                // sees identical to what gets serialized back.
                let cap = MAX_LINE_BYTES - 1 - (entry.label().len() + 1);
                let value_len = comment_start(raw_value)
                    .unwrap_or(raw_value.len())
                    .min(cap);

                value_buf[..value_len].copy_from_slice(&raw_value[..value_len]);
                value_buf[value_len] = 0;
                let value = &value_buf[..value_len];

                if entry.validate.map_or(true, |validate| validate(value)) {
                    if let Some(update) = entry.update {
                        update(value);
                    }
                    match entry.print {
                        Some(print) => print(&mut line_buf[..MAX_LINE_BYTES]).min(MAX_LINE_BYTES),
                        None => render_plain(entry.label(), &value_buf[..value_len], line_buf),
                    }
                } else {
                    log::debug!("value rejected; falling back to default");
                    repaired = true;
                    apply_default(entry, value_buf, line_buf)
                }
            }
            None => {
                repaired = true;
                apply_default(entry, value_buf, line_buf)
            }
        };

        let comment = entry.comment();
        line_buf[rendered..rendered + comment.len()].copy_from_slice(comment);
        let total = rendered + comment.len();

        if !full {
            if m + total <= MAX_FILE_BYTES {
                image.write_bytes(DATA_OFFSET + m, &line_buf[..total], dirty);
                m += total;
            } else {
                log::warn!("serialized config exceeds capacity; truncating at a line boundary");
                full = true;
            }
        }
    }

    // Canonicalize: the root directory holds exactly our entry (size set,
    // start forced to cluster 2 no matter where the host put it), both
    // FATs chain contiguously from 2, and the content sits at the start of
    // the data region with nothing stale after it.
    let mut root = [0u8; SECTOR_BYTES];
    let entry_at = loc.index * ENTRY_BYTES;
    root[entry_at..entry_at + ENTRY_BYTES]
        .copy_from_slice(&image.root_dir()[entry_at..entry_at + ENTRY_BYTES]);
    dir::set_size(&mut root[entry_at..entry_at + ENTRY_BYTES], m as u32);
    dir::set_start_cluster(&mut root[entry_at..entry_at + ENTRY_BYTES], 2);
    image.write_bytes(ROOT_DIR_OFFSET, &root, dirty);

    let mut fat = [0u8; SECTOR_BYTES];
    table::build_chain(&mut fat, m);
    image.write_bytes(FAT1_OFFSET, &fat, dirty);
    image.write_bytes(FAT2_OFFSET, &fat, dirty);

    image.fill_zero(DATA_OFFSET + m, DATA_BYTES - m, dirty);

    log::trace!("normalized: {} bytes at cluster 2 (repaired: {})", m, repaired);
    repaired
}

/// First-boot synthesis: no `CONFIG.TXT` in the root directory at all, so
/// wipe the mirror and build the whole volume from registry defaults.
/// Everything is marked dirty; the caller schedules the commit.
pub fn bootstrap(
    image: &mut VolumeImage,
    dirty: &mut DirtyPages,
    registry: &Registry,
    scratch: &mut Scratch,
) {
    log::info!("no config file on volume; creating one from defaults");

    let Scratch { line_buf, value_buf, .. } = scratch;

    image.fill_zero(0, crate::fat::IMAGE_BYTES, dirty);

    let mut m = 0;
    for entry in registry.iter() {
        let rendered = apply_default(entry, value_buf, line_buf);
        let comment = entry.comment();
        line_buf[rendered..rendered + comment.len()].copy_from_slice(comment);
        let total = rendered + comment.len();

        if m + total > MAX_FILE_BYTES {
            log::warn!("default config exceeds capacity; truncating at a line boundary");
            break;
        }
        image.write_bytes(DATA_OFFSET + m, &line_buf[..total], dirty);
        m += total;
    }

    let mut entry_raw = dir::synthesize_config(2);
    dir::set_size(&mut entry_raw, m as u32);
    image.write_bytes(ROOT_DIR_OFFSET, &entry_raw, dirty);

    let mut fat = [0u8; SECTOR_BYTES];
    table::build_chain(&mut fat, m);
    image.write_bytes(FAT1_OFFSET, &fat, dirty);
    image.write_bytes(FAT2_OFFSET, &fat, dirty);

    dirty.mark_all();
}

/// Picks the parse source and snapshots it into `scratch.file_buf`.
/// Returns true when no candidate looked like our file (the caller then
/// serializes pure defaults).
fn select_source<F: Flash>(
    image: &VolumeImage,
    registry: &Registry,
    scratch: &mut Scratch,
    flash: &mut F,
    loc: &ConfigLocation,
) -> bool {
    let host_offset = if loc.start_cluster >= 2 {
        let offset = (loc.start_cluster as usize - 2) * SECTOR_BYTES;
        if offset < DATA_BYTES { offset } else { 0 }
    } else {
        0
    };

    if registry.looks_like_config(&image.data()[host_offset..]) {
        log::trace!("parsing from the host's location (cluster {})", loc.start_cluster);
        snapshot(&mut scratch.file_buf, &image.data()[host_offset..]);
        return false;
    }

    if registry.looks_like_config(image.data()) {
        log::trace!("parsing from the canonical location");
        snapshot(&mut scratch.file_buf, image.data());
        return false;
    }

    // Neither RAM location is usable (host metadata may have chewed the
    // mirror before we protected it). Try the persisted copy.
    log::warn!("no valid config in the mirror; trying flash");
    if flash.read(DATA_OFFSET, &mut scratch.file_buf).is_ok()
        && registry.looks_like_config(&scratch.file_buf)
    {
        log::debug!("recovered config from flash");
        return false;
    }

    log::warn!("flash copy unusable too; rebuilding from defaults");
    for b in scratch.file_buf.iter_mut() {
        *b = 0;
    }
    true
}

fn snapshot(file_buf: &mut [u8; MAX_FILE_BYTES], source: &[u8]) {
    let n = source.len().min(MAX_FILE_BYTES);
    file_buf[..n].copy_from_slice(&source[..n]);
    for b in file_buf[n..].iter_mut() {
        *b = 0;
    }
}

/// Byte offset of a `\t#` comment marker within a value, if any.
fn comment_start(value: &[u8]) -> Option<usize> {
    value.windows(2).position(|pair| pair == b"\t#")
}

/// Renders `label=value` into `line_buf`, returning the length.
fn render_plain(label: &[u8], value: &[u8], line_buf: &mut [u8; RENDER_BYTES]) -> usize {
    let mut n = 0;
    line_buf[n..n + label.len()].copy_from_slice(label);
    n += label.len();
    line_buf[n] = b'=';
    n += 1;

    let value_len = value.len().min(MAX_LINE_BYTES - n);
    line_buf[n..n + value_len].copy_from_slice(&value[..value_len]);
    n + value_len
}

/// Renders `label=default` and runs the entry's `update` hook on the
/// default (through the NUL-terminated scratch, like any other value).
fn apply_default(
    entry: &Entry,
    value_buf: &mut [u8; MAX_LINE_BYTES],
    line_buf: &mut [u8; RENDER_BYTES],
) -> usize {
    let default = entry.default_value().unwrap_or("").as_bytes();
    let len = default.len().min(MAX_LINE_BYTES - 1 - (entry.label().len() + 1));

    value_buf[..len].copy_from_slice(&default[..len]);
    value_buf[len] = 0;

    if let Some(update) = entry.update {
        if entry.default_value().is_some() {
            update(&value_buf[..len]);
        }
    }

    render_plain(entry.label(), &value_buf[..len], line_buf)
}
