//! exFAT filesystem core: cluster allocator, FAT-chain manager, directory
//! entry stream, and an in-memory reference-counted node cache.
//!
//! ```text
//! .                     |offs| size (sectors)
//! boot sector (aka sb)  | 0  | 1
//! extended boot sectors | 1  | 8
//! oem parameters        | 9  | 1
//! reserved              | 10 | 1
//! boot checksum         | 11 | 1
//!
//! Immediately followed by a "backup boot region" of the same layout.
//!
//! fat alignment         | 24
//! first fat             | fat_offs            | fat_len
//! second fat            | fat_offs + fat_len   | fat_len  (unused here; primary FAT only)
//! cluster heap          | cluster_heap_offs    | cluster_count * sectors_per_cluster
//! ```
//!
//! The block device, UTF-16 name/upcase comparison, timestamp codec, and
//! the POSIX-style path-based facade are external collaborators; this
//! crate only implements the on-disk state engine they sit on top of.

pub mod block;
pub mod cluster;
pub mod dirent;
pub mod error;
pub mod fat;
pub mod log;
pub mod node;
pub mod superblock;
pub mod truncate;

pub use block::BlockDevice;
pub use error::{error_count, Error, Result};
pub use node::{NodeData, NodeFlags, NodeRef, SideEffects};
pub use superblock::{BootSector, SuperBlock};

use std::cell::RefCell;
use std::rc::Rc;

use crate::block::read_raw;
use crate::cluster::ClusterMap;
use crate::dirent::{
    next_entry_position, read_entry_at, write_entry_at, ENAME_MAX, ENTRY_EOD, ENTRY_LABEL, ENTRY_SIZE,
};

/// Mount-time tunables. The only one the core itself interprets is
/// `read_only`, which turns every mutating operation into `Error::ReadOnly`
/// (§7's error taxonomy names this case explicitly).
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub read_only: bool,
}

/// A mounted volume: owns the block device, the superblock, the cluster
/// map, the zero-block scratch buffer, and the node tree rooted at the
/// volume's root directory. Every public operation listed in §6 is a
/// method here, delegating to the free functions in the other modules.
pub struct Fs<D> {
    sb: SuperBlock,
    dev: D,
    cmap: ClusterMap,
    zero_block: Vec<u8>,
    root: NodeRef,
    side: SideEffects,
    options: MountOptions,
}

impl<D: BlockDevice> Fs<D> {
    /// Read the boot sector, validate it, cache the root directory (which
    /// also locates the bitmap and upcase table as side effects), and load
    /// the cluster map.
    pub fn mount(dev: D, options: MountOptions) -> Result<Self> {
        let mut raw = [0u8; 512];
        read_raw(&dev, &mut raw, 0);
        let bs = BootSector::from_bytes(raw)?;
        let sb = SuperBlock::from_boot_sector(&bs);

        let root = node::new_root(sb.rootdir_cluster);
        let mut side = SideEffects::default();
        node::cache_directory(&sb, &dev, &root, &mut side)?;

        let (bitmap_start, bitmap_size) =
            side.bitmap.ok_or_else(|| Error::format("volume is missing its allocation bitmap entry"))?;
        let cmap = ClusterMap::load(&sb, &dev, bitmap_start, sb.cluster_count - 2, bitmap_size as usize);
        let zero_block = vec![0u8; sb.sector_size() as usize];

        Ok(Fs { sb, dev, cmap, zero_block, root, side, options })
    }

    /// Tear down the node cache (flushing and freeing as needed) and
    /// return the underlying device. Mirrors `exfat_reset_cache` at
    /// unmount.
    pub fn unmount(mut self) -> Result<D> {
        node::reset_cache(&self.sb, &mut self.cmap, &mut self.dev, &self.zero_block, &self.root)?;
        if self.cmap.dirty {
            self.cmap.flush(&self.sb, &mut self.dev);
        }
        Ok(self.dev)
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn root(&self) -> NodeRef {
        self.root.clone()
    }

    pub fn get_node(&self, node: &NodeRef) -> NodeRef {
        node::get_node(node)
    }

    pub fn put_node(&mut self, node: &NodeRef) -> Result<()> {
        node::put_node(&self.sb, &mut self.cmap, &mut self.dev, &self.zero_block, node)
    }

    pub fn cache_directory(&mut self, dir: &NodeRef) -> Result<()> {
        node::cache_directory(&self.sb, &self.dev, dir, &mut self.side)
    }

    pub fn lookup_child<F: Fn(&[u16]) -> bool>(&self, dir: &NodeRef, matches: F) -> Option<NodeRef> {
        node::lookup_child(dir, matches)
    }

    fn check_writable(&self) -> Result<()> {
        if self.options.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn truncate(&mut self, node: &NodeRef, size: u64) -> Result<()> {
        self.check_writable()?;
        let changed = node.borrow().size != size;
        truncate::truncate(&self.sb, &mut self.cmap, &mut self.dev, &self.zero_block, &mut *node.borrow_mut(), size)?;
        if !changed {
            return Ok(());
        }
        node.borrow_mut().flags.insert(NodeFlags::DIRTY);
        node::flush_node(&self.sb, &mut self.dev, node)
    }

    pub fn unlink(&mut self, node: &NodeRef) -> Result<()> {
        self.check_writable()?;
        node::unlink(&self.sb, &mut self.dev, node)
    }

    pub fn rmdir(&mut self, node: &NodeRef) -> Result<()> {
        self.check_writable()?;
        node::rmdir(&self.sb, &mut self.dev, &mut self.side, node)
    }

    pub fn flush_node(&mut self, node: &NodeRef) -> Result<()> {
        node::flush_node(&self.sb, &mut self.dev, node)
    }

    pub fn next_cluster(&self, node: &NodeRef, cluster: u32) -> u32 {
        let contiguous = node.borrow().flags.contains(NodeFlags::CONTIGUOUS);
        fat::next_cluster(&self.sb, &self.dev, contiguous, cluster)
    }

    pub fn cluster_to_offset(&self, cluster: u32) -> u64 {
        cluster::cluster_to_byte_offset(&self.sb, cluster)
    }

    pub fn count_free_clusters(&self) -> u32 {
        self.cmap.count_free()
    }

    /// Every sector number currently backing an allocated cluster, in
    /// ascending order. An ambient convenience for `fsck`-style tooling;
    /// not part of the read/write hot path.
    pub fn used_sectors(&self) -> Vec<u64> {
        let sectors_per_cluster = 1u64 << self.sb.sectors_per_cluster_bits;
        (0..self.cmap.size)
            .filter(|&bit| self.cmap.is_allocated(bit + cluster::FIRST_DATA_CLUSTER))
            .flat_map(|bit| {
                let first_sector = self.sb.cluster_sector_start as u64 + bit as u64 * sectors_per_cluster;
                (0..sectors_per_cluster).map(move |i| first_sector + i)
            })
            .collect()
    }

    pub fn get_volume_label(&self) -> Option<String> {
        self.side.label.as_ref().map(|units| String::from_utf16_lossy(units))
    }

    /// Overwrite the volume's existing LABEL entry. Creating a label entry
    /// from scratch on a volume that has none is out of scope: the MS
    /// exFAT spec reserves that slot in the root directory at format
    /// time, and this core never allocates new directory entries on its
    /// own (see DESIGN.md).
    pub fn set_volume_label(&mut self, label: &[u16]) -> Result<()> {
        self.check_writable()?;
        if label.len() > ENAME_MAX {
            return Err(Error::format(format!("label too long ({} chars)", label.len())));
        }

        let (mut cluster, contiguous) = {
            let root = self.root.borrow();
            (root.start_cluster, root.flags.contains(NodeFlags::CONTIGUOUS))
        };
        let mut offset = 0u64;
        loop {
            let entry = read_entry_at(&self.sb, &self.dev, cluster, offset);
            if entry[0] == ENTRY_EOD {
                return Err(Error::format("volume has no label entry to update"));
            }
            if entry[0] == ENTRY_LABEL {
                let mut raw = [0u8; ENTRY_SIZE];
                raw[0] = ENTRY_LABEL;
                raw[1] = label.len() as u8;
                for (i, &unit) in label.iter().enumerate() {
                    raw[2 + i * 2..4 + i * 2].copy_from_slice(&unit.to_le_bytes());
                }
                write_entry_at(&self.sb, &mut self.dev, cluster, offset, &raw);
                self.side.label = Some(label.to_vec());
                return Ok(());
            }
            next_entry_position(&self.sb, &self.dev, contiguous, &mut cluster, &mut offset);
        }
    }
}

/// A freestanding node not attached to any parent, useful to tests and to
/// the demo binary that want to exercise [`node`]'s primitives without a
/// full mounted image.
pub fn detached_node() -> NodeRef {
    Rc::new(RefCell::new(NodeData {
        flags: NodeFlags::empty(),
        name: Vec::new(),
        size: 0,
        start_cluster: 0,
        fptr_cluster: 0,
        mtime: Default::default(),
        atime: Default::default(),
        entry_cluster: 0,
        entry_offset: 0,
        references: 0,
        parent: None,
        children: Vec::new(),
    }))
}
