//! End-to-end host sessions against a `Disk<RamFlash>`: the sector
//! traffic a USB mass-storage host actually generates, followed by the
//! main-loop ticks that land it in flash.

use cfgdisk::disk::COMMIT_DELAY_MS;
use cfgdisk::fat::table;
use cfgdisk::flash::RamFlash;
use cfgdisk::Disk;

use generic_array::GenericArray;

const SECTOR: usize = 512;

fn psk_ok(value: &[u8]) -> bool {
    value.len() >= 8
}

fn fresh_disk(flash: RamFlash) -> Disk<RamFlash> {
    let mut disk = Disk::new(flash);
    assert!(disk.register_entry("SSID", Some("net"), "# network", None, None, None));
    assert!(disk.register_entry("PSK", Some("pw"), "# key", Some(psk_ok), None, None));
    disk
}

fn read(disk: &Disk<RamFlash>, sector: u32) -> [u8; SECTOR] {
    let mut out = GenericArray::default();
    disk.read_sector(sector, &mut out);
    let mut bytes = [0u8; SECTOR];
    bytes.copy_from_slice(out.as_slice());
    bytes
}

/// One sector's worth of `payload`, zero-padded.
fn sector_of(payload: &[u8]) -> [u8; SECTOR] {
    let mut s = [0u8; SECTOR];
    s[..payload.len()].copy_from_slice(payload);
    s
}

/// A root-directory sector holding a single `CONFIG.TXT` entry.
fn root_with_config(cluster: u16, size: u32) -> [u8; SECTOR] {
    let mut s = [0u8; SECTOR];
    s[0..11].copy_from_slice(b"CONFIG  TXT");
    s[0x1A..0x1C].copy_from_slice(&cluster.to_le_bytes());
    s[0x1C..0x20].copy_from_slice(&size.to_le_bytes());
    s
}

/// Ticks `process` until the deferred commit drains; returns the tick
/// clock afterwards.
fn settle(disk: &mut Disk<RamFlash>, after: u32) -> u32 {
    let mut now = after + COMMIT_DELAY_MS;
    for _ in 0..64 {
        disk.process(now);
        now += 10;
        if !disk.is_commit_pending() {
            return now;
        }
    }
    panic!("commit never drained");
}

/// The whole-volume invariant: exactly one directory entry, at cluster 2,
/// FAT2 mirroring FAT1, a contiguous chain covering the file, content
/// starting at sector 64.
fn assert_canonical(disk: &Disk<RamFlash>, expected_content: &[u8]) {
    let root = read(disk, 32);
    let nonempty: Vec<usize> = (0..16).filter(|i| root[i * 32] != 0).collect();
    assert_eq!(nonempty.len(), 1, "root should hold exactly CONFIG.TXT");

    let at = nonempty[0] * 32;
    assert_eq!(&root[at..at + 11], b"CONFIG  TXT");
    let cluster = u16::from_le_bytes([root[at + 0x1A], root[at + 0x1B]]);
    let size = u32::from_le_bytes([
        root[at + 0x1C],
        root[at + 0x1D],
        root[at + 0x1E],
        root[at + 0x1F],
    ]) as usize;
    assert_eq!(cluster, 2);
    assert_eq!(size, expected_content.len());

    let fat1 = read(disk, 8);
    assert_eq!(read(disk, 20), fat1, "FAT2 must mirror FAT1");
    let clusters = 1.max((size + SECTOR - 1) / SECTOR);
    assert_eq!(table::chain_len(&fat1, 2, 64), clusters);
    for i in 0..clusters {
        let next = table::entry(&fat1, 2 + i as u16);
        if i == clusters - 1 {
            assert_eq!(next, 0xFFF);
        } else {
            assert_eq!(next, 3 + i as u16);
        }
    }

    let mut content = Vec::new();
    for i in 0..clusters {
        content.extend_from_slice(&read(disk, 64 + i as u32));
    }
    content.truncate(size);
    assert_eq!(content, expected_content);
}

const DEFAULTS: &[u8] = b"SSID=net\t# network\r\nPSK=pw\t# key\r\n";

#[test]
fn cold_boot_synthesizes_defaults() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);

    assert_canonical(&disk, DEFAULTS);

    // Single-cluster chain straight out of the bootstrap.
    let fat1 = read(&disk, 8);
    assert_eq!(&fat1[..5], &[0xF8, 0xFF, 0xFF, 0xFF, 0x0F]);

    // The boot sector says FAT12 either way.
    let boot = read(&disk, 0);
    assert_eq!(&boot[0x036..0x03E], b"FAT12   ");

    assert!(disk.is_commit_pending());
    settle(&mut disk, 0);
    assert_eq!(disk.flash().contents(), disk.image().as_bytes());
}

#[test]
fn cold_boot_on_a_large_sector_part() {
    let mut disk = fresh_disk(RamFlash::large_sector());
    disk.init(0);
    settle(&mut disk, 0);

    assert_canonical(&disk, DEFAULTS);
    assert_eq!(disk.flash().contents(), disk.image().as_bytes());
    assert_eq!(disk.flash().erase_calls, 1);
}

#[test]
fn host_edit_lands_after_the_idle_delay() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);
    let now = settle(&mut disk, 0);
    let programs_before = disk.flash().program_calls;

    // The host saves: FAT, directory, data — in its own order.
    let payload = b"SSID=home\t#ap\r\nPSK=secret99\t#k\r\n";
    disk.write_sector(&read(&disk, 8), 8, now);
    disk.write_sector(&root_with_config(2, payload.len() as u32), 32, now + 10);
    disk.write_sector(&sector_of(payload), 64, now + 20);

    // Not yet: the burst may still be in flight.
    disk.process(now + 20 + COMMIT_DELAY_MS - 1);
    assert_eq!(disk.flash().program_calls, programs_before);

    settle(&mut disk, now + 20);

    // Comments are regenerated from the registry, values from the host.
    assert_canonical(&disk, b"SSID=home\t# network\r\nPSK=secret99\t# key\r\n");
    assert_eq!(disk.flash().contents(), disk.image().as_bytes());
}

#[test]
fn dot_file_attack_is_survived() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);
    let now = settle(&mut disk, 0);

    let edited: &[u8] = b"SSID=home\t# network\r\nPSK=secret99\t# key\r\n";
    disk.write_sector(&root_with_config(2, edited.len() as u32), 32, now);
    disk.write_sector(&sector_of(b"SSID=home\r\nPSK=secret99\r\n"), 64, now + 10);
    let now = settle(&mut disk, now + 10);
    assert_canonical(&disk, edited);

    // Finder "deletes" the file (0xE5 marker) and hands its cluster to a
    // metadata file whose content starts with 0x05.
    let mut deleted_root = root_with_config(2, edited.len() as u32);
    deleted_root[0] = 0xE5;
    disk.write_sector(&deleted_root, 32, now);
    disk.write_sector(&sector_of(&[0x05, 0xDE, 0xAD]), 64, now + 10);

    let now = settle(&mut disk, now + 10);

    // The gatekeeper dropped the metadata write and `process` reinstated
    // the file with the values from before the attack.
    assert_canonical(&disk, edited);
    assert_eq!(disk.flash().contents(), disk.image().as_bytes());

    // And the volume still mounts sanely on the next boot.
    let mut rebooted = fresh_disk(disk.flash().clone());
    rebooted.init(now);
    assert_canonical(&rebooted, edited);
}

#[test]
fn rejected_value_reverts_to_default() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);
    let now = settle(&mut disk, 0);

    let payload = b"SSID=home\r\nPSK=abc\r\n"; // too short for psk_ok
    disk.write_sector(&root_with_config(2, payload.len() as u32), 32, now);
    disk.write_sector(&sector_of(payload), 64, now + 10);
    settle(&mut disk, now + 10);

    assert_canonical(&disk, b"SSID=home\t# network\r\nPSK=pw\t# key\r\n");
}

#[test]
fn file_at_a_non_canonical_cluster_is_reconciled() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);
    let now = settle(&mut disk, 0);

    // The host's FAT driver decided cluster 5 was a fine home.
    let payload = b"SSID=moved\r\nPSK=relocated\r\n";
    disk.write_sector(&root_with_config(5, payload.len() as u32), 32, now);
    disk.write_sector(&sector_of(payload), 64 + 3, now + 10); // cluster 5
    settle(&mut disk, now + 10);

    assert_canonical(&disk, b"SSID=moved\t# network\r\nPSK=relocated\t# key\r\n");
    assert_eq!(disk.flash().contents(), disk.image().as_bytes());
}

#[test]
fn write_bursts_coalesce_into_one_erase_pass() {
    let mut disk = fresh_disk(RamFlash::large_sector());
    disk.init(0);
    let now = settle(&mut disk, 0);
    let erases_before = disk.flash().erase_calls;

    // Ten writes spread across the burst window, `process` ticking every
    // 10 ms throughout.
    let payload = b"SSID=busy\r\nPSK=busybusy\r\n";
    let mut last_write = now;
    for i in 0..50 {
        let tick = now + i * 10;
        if i % 4 == 0 && i < 40 {
            disk.write_sector(&sector_of(payload), 64, tick);
            last_write = tick;
        }
        disk.process(tick);
        assert_eq!(disk.flash().erase_calls, erases_before, "no commit mid-burst");
    }

    // One pass, COMMIT_DELAY after the last write.
    let mut tick = last_write + COMMIT_DELAY_MS;
    disk.process(tick);
    assert_eq!(disk.flash().erase_calls, erases_before + 1);

    // Quiet afterwards.
    tick += 10;
    disk.process(tick);
    assert_eq!(disk.flash().erase_calls, erases_before + 1);
    assert!(!disk.is_commit_pending());
}

#[test]
fn rewriting_what_was_read_is_a_no_op() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);
    let now = settle(&mut disk, 0);

    let flash_before = disk.flash().contents().to_vec();
    let programs_before = disk.flash().program_calls;

    // Echo every live sector back at the device.
    let mut now = now;
    for sector in [8u32, 20, 32].iter().chain([64u32, 65, 66].iter()) {
        let bytes = read(&disk, *sector);
        disk.write_sector(&bytes, *sector, now);
        now += 10;
    }
    settle(&mut disk, now);

    assert_eq!(disk.flash().contents(), &flash_before[..]);
    assert_eq!(disk.flash().program_calls, programs_before);
    assert_canonical(&disk, DEFAULTS);
}

#[test]
fn consecutive_commits_are_idempotent() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);
    let mut now = settle(&mut disk, 0);
    let flash_first = disk.flash().contents().to_vec();

    // Force another full pass by writing a (changed) value.
    let payload = b"SSID=twice\r\nPSK=pwpwpwpw\r\n";
    disk.write_sector(&root_with_config(2, payload.len() as u32), 32, now);
    disk.write_sector(&sector_of(payload), 64, now);
    now = settle(&mut disk, now);
    let flash_second = disk.flash().contents().to_vec();
    assert_ne!(flash_first, flash_second);

    // Same edit again: nothing changes on flash.
    let canonical = read(&disk, 64);
    disk.write_sector(&canonical, 64, now);
    settle(&mut disk, now);
    assert_eq!(disk.flash().contents(), &flash_second[..]);
}

#[test]
fn lines_serialize_in_registration_order() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);
    let now = settle(&mut disk, 0);

    // File order reversed relative to registration order.
    let payload = b"PSK=ordering1\r\nSSID=order\r\n";
    disk.write_sector(&root_with_config(2, payload.len() as u32), 32, now);
    disk.write_sector(&sector_of(payload), 64, now + 10);
    settle(&mut disk, now + 10);

    assert_canonical(&disk, b"SSID=order\t# network\r\nPSK=ordering1\t# key\r\n");
}

#[test]
fn filler_writes_are_accepted_and_dropped() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);
    let now = settle(&mut disk, 0);
    let flash_before = disk.flash().contents().to_vec();

    let junk = sector_of(b".fseventsd or whatever");
    for sector in [1u32, 9, 21, 33, 63, 100, 4000].iter() {
        disk.write_sector(&junk, *sector, now);
    }
    settle(&mut disk, now);

    assert_eq!(disk.flash().contents(), &flash_before[..]);
    assert_canonical(&disk, DEFAULTS);
}

#[test]
fn reads_are_pure_before_registration() {
    // No entries registered, nothing initialized: reads still serve a
    // mountable (if empty) volume and never crash.
    let disk = Disk::new(RamFlash::small_page());

    let boot = read(&disk, 0);
    assert_eq!(&boot[0x1FE..], &[0x55, 0xAA]);
    assert!(read(&disk, 64).iter().all(|b| *b == 0));
    assert!(read(&disk, 5000).iter().all(|b| *b == 0));
}

#[test]
fn multi_sector_write_calls_are_split_per_sector() {
    let mut disk = fresh_disk(RamFlash::small_page());
    disk.init(0);
    let now = settle(&mut disk, 0);

    // One transport call covering sectors 63..=65: filler, config data,
    // and a continuation sector.
    let payload = b"SSID=span\r\nPSK=spanspan\r\n";
    let mut buf = vec![0u8; 3 * SECTOR];
    buf[SECTOR..SECTOR + payload.len()].copy_from_slice(payload);
    buf[2 * SECTOR..2 * SECTOR + 4].copy_from_slice(b"more");

    disk.write_sector(&buf, 63, now);
    disk.write_sector(&root_with_config(2, payload.len() as u32), 32, now);
    settle(&mut disk, now);

    assert_canonical(&disk, b"SSID=span\t# network\r\nPSK=spanspan\t# key\r\n");
}
