//! Grow/shrink of a node's cluster chain (§4.3).
//!
//! Grounded in `libexfat/cluster.c`'s `grow_file`/`shrink_file`/
//! `exfat_truncate`. Operates on the small [`Chain`] view rather than the
//! full `Node` type so it stays testable without a directory-entry stream
//! behind it; [`crate::node`] adapts a real node to this trait.

use crate::block::BlockDevice;
use crate::cluster::{self, cluster_invalid, ClusterMap, CLUSTER_END, CLUSTER_FREE};
use crate::error::{Error, Result};
use crate::fat::{advance_cluster, bytes_to_clusters, make_noncontiguous, next_cluster, set_next_cluster};
use crate::superblock::SuperBlock;

/// The handful of fields `truncate` needs to read and mutate on a node.
/// Kept separate from [`crate::node::Node`] so the allocator math can be
/// exercised without the rest of the directory-entry machinery.
pub trait Chain {
    fn start_cluster(&self) -> u32;
    fn set_start_cluster(&mut self, c: u32);
    fn size(&self) -> u64;
    fn set_size(&mut self, size: u64);
    fn contiguous(&self) -> bool;
    fn set_contiguous(&mut self, v: bool);
}

/// Grow `node`'s chain by `difference` clusters. Mirrors `grow_file`
/// including its "possibly buggy" adjacency test (§9): a freshly allocated
/// cluster keeps the chain contiguous only when it equals `previous − 1`,
/// not `previous + 1`. This is preserved bit-for-bit rather than corrected.
fn grow_file<D: BlockDevice, N: Chain>(
    sb: &SuperBlock,
    cmap: &mut ClusterMap,
    dev: &mut D,
    zero_block: &[u8],
    node: &mut N,
    mut difference: u32,
) -> Result<()> {
    if difference == 0 {
        crate::log::bug("zero clusters count passed to grow_file");
    }

    let mut previous;
    if node.start_cluster() != CLUSTER_FREE {
        previous = advance_cluster(
            sb,
            dev,
            node.contiguous(),
            node.start_cluster(),
            bytes_to_clusters(sb, node.size()) - 1,
        );
        if cluster_invalid(sb, previous) {
            return Err(Error::format("invalid cluster in file"));
        }
    } else {
        previous = cluster::allocate_cluster(sb, cmap, dev, zero_block)?;
        node.set_start_cluster(previous);
        difference -= 1;
        node.set_contiguous(true);
    }

    while difference > 0 {
        difference -= 1;
        let next = cluster::allocate_cluster(sb, cmap, dev, zero_block)?;
        if next != previous - 1 && node.contiguous() {
            make_noncontiguous(sb, dev, node.start_cluster(), previous);
            node.set_contiguous(false);
        }
        set_next_cluster(sb, dev, node.contiguous(), previous, next);
        previous = next;
    }

    set_next_cluster(sb, dev, node.contiguous(), previous, CLUSTER_END);
    Ok(())
}

/// Shrink `node`'s chain by `difference` clusters. Mirrors `shrink_file`.
fn shrink_file<D: BlockDevice, N: Chain>(
    sb: &SuperBlock,
    cmap: &mut ClusterMap,
    dev: &mut D,
    node: &mut N,
    difference: u32,
) -> Result<()> {
    let current = bytes_to_clusters(sb, node.size());
    if difference == 0 {
        crate::log::bug("zero difference passed to shrink_file");
    }
    if node.start_cluster() == CLUSTER_FREE {
        crate::log::bug(format!("unable to shrink empty file ({current} clusters)"));
    }
    if current < difference {
        crate::log::bug(format!("file underflow ({current} < {difference})"));
    }

    let mut previous;
    if current > difference {
        let last = advance_cluster(sb, dev, node.contiguous(), node.start_cluster(), current - difference - 1);
        if cluster_invalid(sb, last) {
            return Err(Error::format("invalid cluster in file"));
        }
        previous = next_cluster(sb, dev, node.contiguous(), last);
        set_next_cluster(sb, dev, node.contiguous(), last, CLUSTER_END);
    } else {
        previous = node.start_cluster();
        node.set_start_cluster(CLUSTER_FREE);
    }

    let mut remaining = difference;
    while remaining > 0 {
        remaining -= 1;
        if cluster_invalid(sb, previous) {
            return Err(Error::format("invalid cluster in file"));
        }
        let next = next_cluster(sb, dev, node.contiguous(), previous);
        set_next_cluster(sb, dev, node.contiguous(), previous, CLUSTER_FREE);
        cluster::free_cluster(sb, cmap, dev, previous);
        previous = next;
    }
    Ok(())
}

/// Resize `node` to `size` bytes, growing or shrinking its cluster chain as
/// needed, then updating the in-memory size. Does not flush the directory
/// entry; callers that need the size change durable must do so themselves
/// (matching the source, which flushes from a higher layer after this
/// returns — see [`crate::node::flush_node`]).
pub fn truncate<D: BlockDevice, N: Chain>(
    sb: &SuperBlock,
    cmap: &mut ClusterMap,
    dev: &mut D,
    zero_block: &[u8],
    node: &mut N,
    size: u64,
) -> Result<()> {
    let c1 = bytes_to_clusters(sb, node.size());
    let c2 = bytes_to_clusters(sb, size);

    if c1 < c2 {
        grow_file(sb, cmap, dev, zero_block, node, c2 - c1)?;
    } else if c1 > c2 {
        shrink_file(sb, cmap, dev, node, c1 - c2)?;
    }

    node.set_size(size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestNode {
        start_cluster: u32,
        size: u64,
        contiguous: bool,
    }

    impl Chain for TestNode {
        fn start_cluster(&self) -> u32 { self.start_cluster }
        fn set_start_cluster(&mut self, c: u32) { self.start_cluster = c; }
        fn size(&self) -> u64 { self.size }
        fn set_size(&mut self, size: u64) { self.size = size; }
        fn contiguous(&self) -> bool { self.contiguous }
        fn set_contiguous(&mut self, v: bool) { self.contiguous = v; }
    }

    fn test_sb() -> SuperBlock {
        SuperBlock {
            sector_bits: 9,
            block_bits: 9,
            sectors_per_cluster_bits: 3, // 4096-byte clusters
            fat_sector_start: 8,
            fat_sector_count: 8,
            cluster_sector_start: 32,
            cluster_count: 128,
            rootdir_cluster: cluster::FIRST_DATA_CLUSTER,
            volume_serial: 0,
            version: (1, 0),
            volume_state: 0,
            fat_count: 1,
            drive_no: 0x80,
            allocated_percent: 0,
        }
    }

    fn test_dev(sb: &SuperBlock) -> Vec<u8> {
        vec![0u8; (sb.cluster_heap_byte_offset() + sb.cluster_size() * sb.cluster_count as u64) as usize]
    }

    #[test]
    fn grow_from_empty_allocates_and_trips_the_adjacency_check() {
        let sb = test_sb();
        let mut dev = test_dev(&sb);
        let mut cmap = ClusterMap { start_cluster: cluster::FIRST_DATA_CLUSTER, size: sb.cluster_count - 2, chunk: vec![0u8; 16], dirty: false };
        let zero_block = vec![0u8; sb.sector_size() as usize];
        let mut node = TestNode { start_cluster: CLUSTER_FREE, size: 0, contiguous: false };

        truncate(&sb, &mut cmap, &mut dev, &zero_block, &mut node, sb.cluster_size() * 4).unwrap();

        // A first-fit allocator hands out ascending clusters, so `next` is
        // always `previous + 1`, never `previous - 1` — the adjacency check
        // trips on the very first additional cluster and the chain goes
        // non-contiguous, exactly as it would with the original C source.
        assert_eq!(node.start_cluster, cluster::FIRST_DATA_CLUSTER);
        assert!(!node.contiguous);
        assert_eq!(node.size, sb.cluster_size() * 4);
        assert_eq!(cmap.count_free(), sb.cluster_count - 2 - 4);
    }

    #[test]
    fn grow_by_single_cluster_stays_contiguous() {
        let sb = test_sb();
        let mut dev = test_dev(&sb);
        let mut cmap = ClusterMap { start_cluster: cluster::FIRST_DATA_CLUSTER, size: sb.cluster_count - 2, chunk: vec![0u8; 16], dirty: false };
        let zero_block = vec![0u8; sb.sector_size() as usize];
        let mut node = TestNode { start_cluster: CLUSTER_FREE, size: 0, contiguous: false };

        truncate(&sb, &mut cmap, &mut dev, &zero_block, &mut node, sb.cluster_size()).unwrap();

        assert_eq!(node.start_cluster, cluster::FIRST_DATA_CLUSTER);
        assert!(node.contiguous);
        assert_eq!(node.size, sb.cluster_size());
    }

    #[test]
    fn shrink_frees_clusters_and_terminates_chain() {
        let sb = test_sb();
        let mut dev = test_dev(&sb);
        let mut cmap = ClusterMap { start_cluster: cluster::FIRST_DATA_CLUSTER, size: sb.cluster_count - 2, chunk: vec![0u8; 16], dirty: false };
        let zero_block = vec![0u8; sb.sector_size() as usize];
        let mut node = TestNode { start_cluster: CLUSTER_FREE, size: 0, contiguous: false };

        truncate(&sb, &mut cmap, &mut dev, &zero_block, &mut node, sb.cluster_size() * 4).unwrap();
        let free_before_shrink = cmap.count_free();
        truncate(&sb, &mut cmap, &mut dev, &zero_block, &mut node, sb.cluster_size() * 2).unwrap();

        assert_eq!(node.size, sb.cluster_size() * 2);
        assert_eq!(cmap.count_free(), free_before_shrink + 2);
    }

    #[test]
    fn truncate_to_zero_frees_every_cluster() {
        let sb = test_sb();
        let mut dev = test_dev(&sb);
        let mut cmap = ClusterMap { start_cluster: cluster::FIRST_DATA_CLUSTER, size: sb.cluster_count - 2, chunk: vec![0u8; 16], dirty: false };
        let zero_block = vec![0u8; sb.sector_size() as usize];
        let mut node = TestNode { start_cluster: CLUSTER_FREE, size: 0, contiguous: false };

        truncate(&sb, &mut cmap, &mut dev, &zero_block, &mut node, sb.cluster_size() * 3).unwrap();
        truncate(&sb, &mut cmap, &mut dev, &zero_block, &mut node, 0).unwrap();

        assert_eq!(node.size, 0);
        assert_eq!(node.start_cluster, CLUSTER_FREE);
        assert_eq!(cmap.count_free(), sb.cluster_count - 2);
    }
}
