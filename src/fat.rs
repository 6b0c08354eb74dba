//! FAT-chain traversal and linkage (§4.2, §4.3).
//!
//! Grounded in `libexfat/cluster.c`'s `exfat_next_cluster`,
//! `exfat_advance_cluster`, and `set_next_cluster`. Every function here
//! takes a `contiguous` flag explicitly rather than a `Node` reference,
//! since the node type itself lives in a higher module and this one only
//! needs to know whether to trust the FAT for a given chain.

use crate::block::{read_raw, write_raw, BlockDevice};
use crate::cluster::cluster_invalid;
use crate::superblock::SuperBlock;

fn fat_entry_offset(sb: &SuperBlock, cluster: u32) -> u64 {
    sb.fat_byte_offset() + (cluster as u64) * 4
}

/// Round a byte length up to a whole number of clusters.
pub fn bytes_to_clusters(sb: &SuperBlock, bytes: u64) -> u32 {
    let cluster_size = sb.cluster_size();
    bytes.div_ceil(cluster_size) as u32
}

/// The cluster following `cluster` in a chain. For a contiguous run this is
/// just `cluster + 1`; otherwise it is read out of the on-disk FAT.
pub fn next_cluster<D: BlockDevice>(sb: &SuperBlock, dev: &D, contiguous: bool, cluster: u32) -> u32 {
    if contiguous {
        return cluster + 1;
    }
    let mut buf = [0u8; 4];
    read_raw(dev, &mut buf, fat_entry_offset(sb, cluster));
    u32::from_le_bytes(buf)
}

/// Walk `count` links forward from `cluster`, stopping early (returning
/// whatever sentinel/invalid value was found) if the chain ends first.
pub fn advance_cluster<D: BlockDevice>(
    sb: &SuperBlock,
    dev: &D,
    contiguous: bool,
    mut cluster: u32,
    count: u32,
) -> u32 {
    for _ in 0..count {
        cluster = next_cluster(sb, dev, contiguous, cluster);
        if cluster_invalid(sb, cluster) {
            break;
        }
    }
    cluster
}

/// Write `next` as the FAT entry following `current`. A no-op for
/// contiguous chains, whose linkage is implicit in cluster adjacency.
pub fn set_next_cluster<D: BlockDevice>(
    sb: &SuperBlock,
    dev: &mut D,
    contiguous: bool,
    current: u32,
    next: u32,
) {
    if contiguous {
        return;
    }
    write_raw(dev, &next.to_le_bytes(), fat_entry_offset(sb, current));
}

/// Lay down explicit FAT links for every cluster in `[first, last]`,
/// turning what used to be an implicitly-contiguous run into an ordinary
/// linked chain. Called when a contiguous file can no longer be kept
/// contiguous (see the `next != previous - 1` check in
/// `crate::truncate::grow_file`).
pub fn make_noncontiguous<D: BlockDevice>(sb: &SuperBlock, dev: &mut D, first: u32, last: u32) {
    let mut c = first;
    while c < last {
        set_next_cluster(sb, dev, false, c, c + 1);
        c += 1;
    }
}
