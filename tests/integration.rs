//! End-to-end scenarios driving a mounted scratch image the way a real
//! facade would: build a minimal valid exFAT image in memory, mount it,
//! and exercise the public surface (lookup, truncate, unlink, rmdir)
//! against it.

use std::io::Write;

use exfat::dirent::{
    accumulate_checksum, write_file_info, write_file_name, write_file_primary, RawTimestamp, ENTRY_BITMAP, ENTRY_SIZE,
    ENTRY_UPCASE,
};
use exfat::{cluster, Fs, MountOptions, NodeFlags};

const SECTOR_BITS: u8 = 9; // 512-byte sectors
const SECTORS_PER_CLUSTER_BITS: u8 = 3; // 4096-byte clusters
const CLUSTER_COUNT: u32 = 128;
const FAT_SECTOR_START: u32 = 24; // must be >= 24 (past the boot region)
const FAT_SECTOR_COUNT: u32 = 8;
const CLUSTER_HEAP_SECTOR_START: u32 = FAT_SECTOR_START + FAT_SECTOR_COUNT;
const BITMAP_CLUSTER: u32 = 2;
const UPCASE_CLUSTER: u32 = 3;
const ROOT_CLUSTER: u32 = 4;
const UPCASE_SIZE: u32 = 128;

fn cluster_size() -> u64 {
    1u64 << (SECTOR_BITS + SECTORS_PER_CLUSTER_BITS)
}

fn bitmap_byte_len() -> usize {
    ((CLUSTER_COUNT as usize) - 2).div_ceil(8)
}

fn cluster_offset(cluster: u32) -> u64 {
    let sector =
        (CLUSTER_HEAP_SECTOR_START as u64) + (((cluster - cluster::FIRST_DATA_CLUSTER) as u64) << SECTORS_PER_CLUSTER_BITS);
    sector << SECTOR_BITS
}

fn name_units(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

fn build_boot_sector(dev: &mut [u8]) {
    let raw = &mut dev[0..512];
    raw[3..11].copy_from_slice(b"EXFAT   ");
    raw[80..84].copy_from_slice(&FAT_SECTOR_START.to_le_bytes());
    raw[84..88].copy_from_slice(&FAT_SECTOR_COUNT.to_le_bytes());
    raw[88..92].copy_from_slice(&CLUSTER_HEAP_SECTOR_START.to_le_bytes());
    raw[92..96].copy_from_slice(&CLUSTER_COUNT.to_le_bytes());
    raw[96..100].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
    raw[100..104].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    raw[104..106].copy_from_slice(&0x0100u16.to_le_bytes()); // rev 1.0
    raw[108] = SECTOR_BITS;
    raw[109] = SECTORS_PER_CLUSTER_BITS;
    raw[110] = 1; // one FAT
    raw[111] = 0x80;
}

/// A raw 32-byte view onto the allocation bitmap / upcase table entries,
/// which share the info entry's start_cluster/size field layout but have
/// no dedicated writer in `dirent` (the core never creates them).
fn write_table_entry(raw: &mut [u8; ENTRY_SIZE], kind: u8, start_cluster: u32, size: u64) {
    raw[0] = kind;
    raw[20..24].copy_from_slice(&start_cluster.to_le_bytes());
    raw[24..32].copy_from_slice(&size.to_le_bytes());
}

fn build_file_group(name: &str, size: u64, start_cluster: u32, contiguous: bool) -> Vec<[u8; ENTRY_SIZE]> {
    let units = name_units(name);
    let name_entries = units.len().div_ceil(15).max(1);

    let mut primary = [0u8; ENTRY_SIZE];
    write_file_primary(&mut primary, (1 + name_entries) as u8, 0x20, RawTimestamp::default(), RawTimestamp::default());
    let mut info = [0u8; ENTRY_SIZE];
    write_file_info(&mut info, size, start_cluster, contiguous);

    let mut names = Vec::new();
    for chunk in units.chunks(15) {
        let mut padded = vec![0u16; 15];
        padded[..chunk.len()].copy_from_slice(chunk);
        let mut raw = [0u8; ENTRY_SIZE];
        write_file_name(&mut raw, &padded);
        names.push(raw);
    }

    let mut sum = accumulate_checksum(&primary, 0, true);
    sum = accumulate_checksum(&info, sum, false);
    for n in &names {
        sum = accumulate_checksum(n, sum, false);
    }
    primary[2..4].copy_from_slice(&sum.to_le_bytes());

    let mut out = vec![primary, info];
    out.extend(names);
    out
}

/// Build a minimal valid image: bitmap at cluster 2, upcase at cluster 3,
/// root directory at cluster 4 containing the mandatory BITMAP/UPCASE
/// entries plus whatever extra entry groups the caller supplies, followed
/// by an EOD entry. Matches the layout in S1-S6.
fn build_image(extra_root_entries: &[[u8; ENTRY_SIZE]]) -> Vec<u8> {
    let heap_bytes = CLUSTER_COUNT as u64 * cluster_size();
    let total = (CLUSTER_HEAP_SECTOR_START as u64) << SECTOR_BITS;
    let mut dev = vec![0u8; (total + heap_bytes) as usize];

    build_boot_sector(&mut dev);

    // Bitmap: clusters 2 (bitmap), 3 (upcase), 4 (root) are already in use.
    let bitmap_off = cluster_offset(BITMAP_CLUSTER) as usize;
    dev[bitmap_off] = 0b0000_0111;

    let mut root_entries = Vec::new();
    let mut bitmap_entry = [0u8; ENTRY_SIZE];
    write_table_entry(&mut bitmap_entry, ENTRY_BITMAP, BITMAP_CLUSTER, bitmap_byte_len() as u64);
    root_entries.push(bitmap_entry);
    let mut upcase_entry = [0u8; ENTRY_SIZE];
    write_table_entry(&mut upcase_entry, ENTRY_UPCASE, UPCASE_CLUSTER, UPCASE_SIZE as u64);
    root_entries.push(upcase_entry);
    root_entries.extend_from_slice(extra_root_entries);

    let root_off = cluster_offset(ROOT_CLUSTER) as usize;
    for (i, entry) in root_entries.iter().enumerate() {
        let at = root_off + i * ENTRY_SIZE;
        dev[at..at + ENTRY_SIZE].copy_from_slice(entry);
    }
    // Remaining bytes in the root cluster are already zero, i.e. EOD.

    dev
}

#[test]
fn mounts_minimal_image_and_reports_free_clusters() {
    let dev = build_image(&[]);
    let fs = Fs::mount(dev, MountOptions::default()).expect("mount");

    assert_eq!(fs.count_free_clusters(), CLUSTER_COUNT - 2 - 3);
    assert_eq!(fs.superblock().cluster_count, CLUSTER_COUNT);
    assert_eq!(fs.superblock().rootdir_cluster, ROOT_CLUSTER);
}

#[test]
fn grow_then_shrink_existing_file_updates_cmap_and_chain() {
    let a_txt = build_file_group("a.txt", 0, cluster::CLUSTER_FREE, false);
    let dev = build_image(&a_txt);
    let mut fs = Fs::mount(dev, MountOptions::default()).expect("mount");

    let free_before = fs.count_free_clusters();
    let root = fs.root();
    let node = fs.lookup_child(&root, |n| n == name_units("a.txt").as_slice()).expect("a.txt present");

    // Grow from 0 to 4 clusters (16384 bytes). A first-fit ascending
    // allocator hands out 5, 6, 7, 8: the very first additional cluster
    // trips the documented `next != previous - 1` adjacency check (see
    // DESIGN.md), so CONTIGUOUS ends up cleared rather than set.
    fs.truncate(&node, cluster_size() * 4).unwrap();
    assert_eq!(node.borrow().start_cluster, 5);
    assert!(!node.borrow().flags.contains(NodeFlags::CONTIGUOUS));
    assert_eq!(fs.count_free_clusters(), free_before - 4);

    // Shrinking back to 2 clusters must free exactly the tail two and
    // leave the chain terminated at the new last cluster.
    fs.truncate(&node, cluster_size() * 2).unwrap();
    assert_eq!(fs.count_free_clusters(), free_before - 2);
    assert_eq!(fs.next_cluster(&node, 6), cluster::CLUSTER_END);

    // Truncating to zero must return every cluster the file held.
    fs.truncate(&node, 0).unwrap();
    assert_eq!(fs.count_free_clusters(), free_before);
    assert_eq!(node.borrow().start_cluster, cluster::CLUSTER_FREE);

    fs.unmount().unwrap();
}

#[test]
fn corrupt_name_entry_is_reported_as_checksum_mismatch() {
    let a_txt = build_file_group("a.txt", 0, cluster::CLUSTER_FREE, false);
    let mut dev = build_image(&a_txt);

    // a.txt's name entry is the 5th root entry (bitmap, upcase, primary,
    // info, name); flip a bit inside it without touching the checksum.
    let root_off = cluster_offset(ROOT_CLUSTER) as usize;
    let name_entry_off = root_off + 4 * ENTRY_SIZE;
    dev[name_entry_off + 2] ^= 0x01;

    let result = Fs::mount(dev, MountOptions::default());
    assert!(result.is_err(), "checksum mismatch must be reported as a mount-time error");
}

#[test]
fn mounts_minimal_image_from_an_on_disk_file() {
    let dev = build_image(&[]);
    let mut file = tempfile::NamedTempFile::new().expect("create scratch file");
    file.write_all(&dev).expect("write scratch image");
    let file = file.reopen().expect("reopen scratch file");

    let fs = Fs::mount(file, MountOptions::default()).expect("mount");
    assert_eq!(fs.count_free_clusters(), CLUSTER_COUNT - 2 - 3);
    assert_eq!(fs.superblock().rootdir_cluster, ROOT_CLUSTER);
}

#[test]
fn rmdir_rejects_non_empty_then_succeeds_after_unlink() {
    let dir_cluster = 5u32;
    let child = build_file_group("c.txt", 0, cluster::CLUSTER_FREE, false);
    let mut dir_group = build_file_group("d", 0, dir_cluster, true);
    // Mark "d" as a directory and size it to one cluster.
    dir_group[0][4..6].copy_from_slice(&(NodeFlags::DIRECTORY.bits() as u16).to_le_bytes());
    dir_group[1][24..32].copy_from_slice(&cluster_size().to_le_bytes());
    // Recompute the checksum now that attrib changed.
    let mut sum = accumulate_checksum(&dir_group[0], 0, true);
    for e in &dir_group[1..] {
        sum = accumulate_checksum(e, sum, false);
    }
    dir_group[0][2..4].copy_from_slice(&sum.to_le_bytes());

    let mut dev = build_image(&dir_group);
    // Mark the directory's own cluster (5) as allocated in the bitmap and
    // write its lone child entry group there.
    let bitmap_off = cluster_offset(BITMAP_CLUSTER) as usize;
    dev[bitmap_off] |= 0b0000_1000;
    let dir_off = cluster_offset(dir_cluster) as usize;
    for (i, entry) in child.iter().enumerate() {
        let at = dir_off + i * ENTRY_SIZE;
        dev[at..at + ENTRY_SIZE].copy_from_slice(entry);
    }

    let mut fs = Fs::mount(dev, MountOptions::default()).expect("mount");
    let root = fs.root();
    let free_before_rmdir = fs.count_free_clusters();
    let dir = fs.lookup_child(&root, |n| n == name_units("d").as_slice()).expect("d present");

    assert!(matches!(fs.rmdir(&dir), Err(exfat::Error::NotEmpty)));

    fs.cache_directory(&dir).unwrap();
    let c = fs.lookup_child(&dir, |n| n == name_units("c.txt").as_slice()).expect("c.txt present");
    fs.unlink(&c).unwrap();
    fs.rmdir(&dir).unwrap();

    assert_eq!(fs.count_free_clusters(), free_before_rmdir);
}
