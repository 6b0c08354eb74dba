//! The in-memory node cache: reference-counted nodes mirroring directories
//! that have been traversed (§4.5, §3 "Node").
//!
//! Grounded in `node.c`'s `exfat_get_node`/`exfat_put_node`,
//! `exfat_cache_directory`/`reset_cache`, and `exfat_flush_node`/
//! `erase_entry`/`delete`/`exfat_unlink`/`exfat_rmdir`. The parent link is
//! non-owning (`Weak`), matching the design note in §9: children are owned
//! by their parent's `children` list, and the parent back-pointer is for
//! navigation only.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bitflags::bitflags;

use crate::block::{read_raw, BlockDevice};
use crate::cluster::{cluster_invalid, cluster_to_byte_offset, ClusterMap};
use crate::dirent::{
    accumulate_checksum, next_entry_position, read_entry_at, write_entry_at, write_file_name, BitmapEntry,
    EntryCursor, FileInfo, FileName, FilePrimary, LabelEntry, RawTimestamp, UpcaseEntry, ENAME_MAX, ENTRY_BITMAP,
    ENTRY_EOD, ENTRY_FILE, ENTRY_FILE_INFO, ENTRY_FILE_NAME, ENTRY_LABEL, ENTRY_SIZE, ENTRY_UPCASE, ENTRY_VALID,
    FLAG_CONTIGUOUS, LABEL_MAX,
};
use crate::error::{Error, Result};
use crate::superblock::SuperBlock;
use crate::truncate::{self, Chain};

bitflags! {
    /// On-disk attribute bits (low byte and a half) plus the three internal
    /// bits §3 calls out (CONTIGUOUS/DIRTY/UNLINKED) and the fourth,
    /// CACHED, that only applies to directories.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        const READ_ONLY    = 0x0001;
        const HIDDEN       = 0x0002;
        const SYSTEM       = 0x0004;
        const VOLUME_LABEL = 0x0008;
        const DIRECTORY    = 0x0010;
        const ARCHIVE      = 0x0020;

        const CONTIGUOUS = 0x0001_0000;
        const DIRTY      = 0x0002_0000;
        const UNLINKED   = 0x0004_0000;
        const CACHED     = 0x0008_0000;
    }
}

const ATTRIB_MASK: u32 = NodeFlags::READ_ONLY.bits()
    | NodeFlags::HIDDEN.bits()
    | NodeFlags::SYSTEM.bits()
    | NodeFlags::VOLUME_LABEL.bits()
    | NodeFlags::DIRECTORY.bits()
    | NodeFlags::ARCHIVE.bits();

pub struct NodeData {
    pub flags: NodeFlags,
    pub name: Vec<u16>,
    pub size: u64,
    pub start_cluster: u32,
    pub fptr_cluster: u32,
    pub mtime: RawTimestamp,
    pub atime: RawTimestamp,
    pub entry_cluster: u32,
    pub entry_offset: u64,
    pub references: i64,
    pub parent: Option<Weak<RefCell<NodeData>>>,
    pub children: Vec<NodeRef>,
}

pub type NodeRef = Rc<RefCell<NodeData>>;

impl Chain for NodeData {
    fn start_cluster(&self) -> u32 {
        self.start_cluster
    }
    fn set_start_cluster(&mut self, c: u32) {
        self.start_cluster = c;
        self.fptr_cluster = c;
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn set_size(&mut self, size: u64) {
        self.size = size;
    }
    fn contiguous(&self) -> bool {
        self.flags.contains(NodeFlags::CONTIGUOUS)
    }
    fn set_contiguous(&mut self, v: bool) {
        self.flags.set(NodeFlags::CONTIGUOUS, v);
    }
}

impl NodeData {
    fn name_string(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }
}

/// The root directory node has no parent and no on-disk entry of its own;
/// its existence is implied by the superblock's `rootdir_cluster`.
pub fn new_root(rootdir_cluster: u32) -> NodeRef {
    Rc::new(RefCell::new(NodeData {
        flags: NodeFlags::DIRECTORY,
        name: Vec::new(),
        size: 0,
        start_cluster: rootdir_cluster,
        fptr_cluster: rootdir_cluster,
        mtime: RawTimestamp::default(),
        atime: RawTimestamp::default(),
        entry_cluster: rootdir_cluster,
        entry_offset: 0,
        references: 0,
        parent: None,
        children: Vec::new(),
    }))
}

/// Side effects picked up in passing while scanning a directory: the
/// volume-wide upcase table, the allocation bitmap's location, and the
/// volume label. Populated at most once each (subsequent BITMAP/UPCASE
/// entries are ignored, matching `ef->upcase != NULL` / similar guards in
/// the source).
#[derive(Default)]
pub struct SideEffects {
    pub upcase: Option<Vec<u16>>,
    pub bitmap: Option<(u32, u64)>,
    pub label: Option<Vec<u16>>,
}

pub fn get_node(node: &NodeRef) -> NodeRef {
    node.borrow_mut().references += 1;
    node.clone()
}

pub fn put_node<D: BlockDevice>(
    sb: &SuperBlock,
    cmap: &mut ClusterMap,
    dev: &mut D,
    zero_block: &[u8],
    node: &NodeRef,
) -> Result<()> {
    let refs = {
        let mut n = node.borrow_mut();
        n.references -= 1;
        n.references
    };
    if refs < 0 {
        let name = node.borrow().name_string();
        crate::log::bug(format!("reference counter of `{name}' is below zero"));
    }
    if refs == 0 {
        if node.borrow().flags.contains(NodeFlags::DIRTY) {
            flush_node(sb, dev, node)?;
        }
        if node.borrow().flags.contains(NodeFlags::UNLINKED) {
            truncate::truncate(sb, cmap, dev, zero_block, &mut *node.borrow_mut(), 0)?;
        }
        if cmap.dirty {
            cmap.flush(sb, dev);
        }
    }
    Ok(())
}

fn name_entry_count(name_len: usize) -> usize {
    name_len.div_ceil(ENAME_MAX).max(1)
}

fn name_to_entries(name: &[u16]) -> Vec<[u8; ENTRY_SIZE]> {
    let count = name_entry_count(name.len());
    (0..count)
        .map(|i| {
            let start = i * ENAME_MAX;
            let end = (start + ENAME_MAX).min(name.len());
            let mut padded = [0u16; ENAME_MAX];
            padded[..end - start].copy_from_slice(&name[start..end]);
            let mut raw = [0u8; ENTRY_SIZE];
            write_file_name(&mut raw, &padded);
            raw
        })
        .collect()
}

/// Read one entry group (primary + info + names) starting at the cursor's
/// current position, advancing past it. Returns `Ok(None)` at EOD. Mirrors
/// `readdir` in `node.c`, folding in the BITMAP/UPCASE/LABEL side-effect
/// handling that the same loop performs.
fn read_one_entry_group<D: BlockDevice>(
    sb: &SuperBlock,
    dev: &D,
    cursor: &mut EntryCursor,
    side: &mut SideEffects,
) -> Result<Option<NodeData>> {
    loop {
        let entry = *cursor.entry();
        match entry[0] {
            ENTRY_EOD => return Ok(None),

            ENTRY_FILE => {
                let primary = FilePrimary(&entry);
                let continuations = primary.continuations();
                if continuations < 2 {
                    return Err(Error::format(format!("too few continuations ({continuations})")));
                }
                let reference_checksum = primary.checksum();
                let mut running = accumulate_checksum(&entry, 0, true);
                let attrib = primary.attrib();
                let mtime = primary.mtime();
                let atime = primary.atime();
                let entry_cluster = cursor.cluster;
                let entry_offset = cursor.offset % sb.cluster_size();
                cursor.advance(sb, dev)?;

                let info_entry = *cursor.entry();
                if info_entry[0] != ENTRY_FILE_INFO {
                    return Err(Error::format(format!(
                        "unexpected continuation (expected FILE_INFO, got {:#x})",
                        info_entry[0]
                    )));
                }
                let info = FileInfo(&info_entry);
                running = accumulate_checksum(&info_entry, running, false);
                let size = info.size();
                let is_dir = attrib & (NodeFlags::DIRECTORY.bits() as u16) != 0;
                if is_dir && size % sb.cluster_size() != 0 {
                    return Err(Error::format(format!("directory has invalid size {size} bytes")));
                }
                let start_cluster = info.start_cluster();
                let contiguous = info.flag() == FLAG_CONTIGUOUS;
                cursor.advance(sb, dev)?;

                let mut remaining = continuations - 1;
                let mut name = Vec::with_capacity(remaining as usize * ENAME_MAX);
                loop {
                    let name_entry = *cursor.entry();
                    if name_entry[0] != ENTRY_FILE_NAME {
                        return Err(Error::format("unexpected continuation (expected FILE_NAME)"));
                    }
                    running = accumulate_checksum(&name_entry, running, false);
                    name.extend_from_slice(&FileName(&name_entry).units());
                    remaining -= 1;
                    cursor.advance(sb, dev)?;
                    if remaining == 0 {
                        break;
                    }
                }
                if running != reference_checksum {
                    return Err(Error::format(format!(
                        "invalid checksum (0x{running:x} != 0x{reference_checksum:x})"
                    )));
                }
                while name.last() == Some(&0) {
                    name.pop();
                }

                let mut flags = NodeFlags::from_bits_truncate((attrib as u32) & ATTRIB_MASK);
                flags.set(NodeFlags::CONTIGUOUS, contiguous);

                return Ok(Some(NodeData {
                    flags,
                    name,
                    size,
                    start_cluster,
                    fptr_cluster: start_cluster,
                    mtime,
                    atime,
                    entry_cluster,
                    entry_offset,
                    references: 0,
                    parent: None,
                    children: Vec::new(),
                }));
            }

            ENTRY_BITMAP => {
                if side.bitmap.is_none() {
                    let b = BitmapEntry(&entry);
                    if cluster_invalid(sb, b.start_cluster()) {
                        return Err(Error::format("invalid cluster in clusters bitmap"));
                    }
                    let expected = sb.bitmap_byte_len() as u64;
                    if b.size() != expected {
                        return Err(Error::format(format!(
                            "invalid bitmap size: {} (expected {expected})",
                            b.size()
                        )));
                    }
                    side.bitmap = Some((b.start_cluster(), b.size()));
                }
                cursor.advance(sb, dev)?;
            }

            ENTRY_UPCASE => {
                if side.upcase.is_none() {
                    let u = UpcaseEntry(&entry);
                    if cluster_invalid(sb, u.start_cluster()) {
                        return Err(Error::format("invalid cluster in upcase table"));
                    }
                    if u.size() == 0 || u.size() > 0xffff * 2 || u.size() % 2 != 0 {
                        return Err(Error::format(format!("bad upcase table size ({} bytes)", u.size())));
                    }
                    let mut buf = vec![0u8; u.size() as usize];
                    read_raw(dev, &mut buf, cluster_to_byte_offset(sb, u.start_cluster()));
                    side.upcase = Some(buf.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect());
                }
                cursor.advance(sb, dev)?;
            }

            ENTRY_LABEL => {
                let l = LabelEntry(&entry);
                if l.length() as usize > LABEL_MAX {
                    return Err(Error::format(format!("too long label ({} chars)", l.length())));
                }
                side.label = Some(l.units()[..l.length() as usize].to_vec());
                cursor.advance(sb, dev)?;
            }

            t => {
                if t & ENTRY_VALID != 0 {
                    return Err(Error::format(format!("unknown entry type {t:#x}")));
                }
                cursor.advance(sb, dev)?;
            }
        }
    }
}

/// Cache `dir`'s immediate children. A no-op if already cached. On any
/// parse error the newly read (not-yet-attached) children are simply
/// dropped, leaving `dir` exactly as it was before the call — matching the
/// rollback in `exfat_cache_directory`.
pub fn cache_directory<D: BlockDevice>(sb: &SuperBlock, dev: &D, dir: &NodeRef, side: &mut SideEffects) -> Result<()> {
    if dir.borrow().flags.contains(NodeFlags::CACHED) {
        return Ok(());
    }

    let (start_cluster, contiguous) = {
        let d = dir.borrow();
        (d.start_cluster, d.flags.contains(NodeFlags::CONTIGUOUS))
    };
    let mut cursor = EntryCursor::open(sb, dev, start_cluster, contiguous);
    let mut children = Vec::new();
    loop {
        match read_one_entry_group(sb, dev, &mut cursor, side)? {
            None => break,
            Some(data) => {
                let child = Rc::new(RefCell::new(data));
                child.borrow_mut().parent = Some(Rc::downgrade(dir));
                children.push(child);
            }
        }
    }

    dir.borrow_mut().children = children;
    dir.borrow_mut().flags.insert(NodeFlags::CACHED);
    Ok(())
}

/// Depth-first post-order teardown of the cache rooted at `node`, used at
/// unmount. Any node still referenced is logged and has its references
/// forced to zero via [`put_node`], which is how an unlinked-but-pinned
/// node's clusters finally get released.
pub fn reset_cache<D: BlockDevice>(
    sb: &SuperBlock,
    cmap: &mut ClusterMap,
    dev: &mut D,
    zero_block: &[u8],
    node: &NodeRef,
) -> Result<()> {
    let children: Vec<NodeRef> = node.borrow().children.clone();
    for child in &children {
        reset_cache(sb, cmap, dev, zero_block, child)?;
    }
    node.borrow_mut().children.clear();

    let refs = node.borrow().references;
    if refs != 0 {
        let name = node.borrow().name_string();
        crate::log::warn(format!("non-zero reference counter ({refs}) for `{name}'"));
    }
    while node.borrow().references > 0 {
        put_node(sb, cmap, dev, zero_block, node)?;
    }
    node.borrow_mut().flags.remove(NodeFlags::CACHED);
    Ok(())
}

/// Look up an already-cached child by a caller-supplied name predicate.
/// Name comparison (case folding via the upcase table) is an external
/// collaborator's job (§1 Non-goals); this only walks the in-memory list.
pub fn lookup_child<F: Fn(&[u16]) -> bool>(dir: &NodeRef, matches: F) -> Option<NodeRef> {
    dir.borrow().children.iter().find(|c| matches(&c.borrow().name)).cloned()
}

/// Write a node's primary and info entries back to disk, then recompute
/// and store the group checksum. Mirrors `exfat_flush_node`: a no-op for an
/// already-unlinked node (no parent to flush into).
pub fn flush_node<D: BlockDevice>(sb: &SuperBlock, dev: &mut D, node: &NodeRef) -> Result<()> {
    let parent = match node.borrow().parent.as_ref().and_then(Weak::upgrade) {
        Some(p) => p,
        None => return Ok(()),
    };
    let parent_contiguous = parent.borrow().flags.contains(NodeFlags::CONTIGUOUS);

    let mut cluster = node.borrow().entry_cluster;
    let mut offset = node.borrow().entry_offset;
    let (meta1_cluster, meta1_offset) = (cluster, offset);
    next_entry_position(sb, dev, parent_contiguous, &mut cluster, &mut offset);
    let (meta2_cluster, meta2_offset) = (cluster, offset);

    let mut meta1 = read_entry_at(sb, dev, meta1_cluster, meta1_offset);
    if meta1[0] != ENTRY_FILE {
        crate::log::bug(format!("invalid type of meta1: {:#x}", meta1[0]));
    }
    let mut meta2 = read_entry_at(sb, dev, meta2_cluster, meta2_offset);
    if meta2[0] != ENTRY_FILE_INFO {
        crate::log::bug(format!("invalid type of meta2: {:#x}", meta2[0]));
    }

    {
        let n = node.borrow();
        meta1[4..6].copy_from_slice(&((n.flags.bits() & ATTRIB_MASK) as u16).to_le_bytes());
        meta1[8..10].copy_from_slice(&n.mtime.time.to_le_bytes());
        meta1[10..12].copy_from_slice(&n.mtime.date.to_le_bytes());
        meta1[12..14].copy_from_slice(&n.atime.time.to_le_bytes());
        meta1[14..16].copy_from_slice(&n.atime.date.to_le_bytes());

        meta2[24..32].copy_from_slice(&n.size.to_le_bytes());
        meta2[20..24].copy_from_slice(&n.start_cluster.to_le_bytes());
        meta2[1] = if n.contiguous() { FLAG_CONTIGUOUS } else { 1 };

        let mut sum = accumulate_checksum(&meta1, 0, true);
        sum = accumulate_checksum(&meta2, sum, false);
        for name_entry in name_to_entries(&n.name) {
            sum = accumulate_checksum(&name_entry, sum, false);
        }
        meta1[2..4].copy_from_slice(&sum.to_le_bytes());
    }

    write_entry_at(sb, dev, meta1_cluster, meta1_offset, &meta1);
    write_entry_at(sb, dev, meta2_cluster, meta2_offset, &meta2);

    node.borrow_mut().flags.remove(NodeFlags::DIRTY);
    Ok(())
}

/// Clear the in-use bit of the primary entry, then the info entry, then
/// every name entry, walking the parent's chain between them. Mirrors
/// `erase_entry`: the primary-first order means a crash midway leaves the
/// group unreachable from a scan.
fn erase_entry<D: BlockDevice>(sb: &SuperBlock, dev: &mut D, node: &NodeRef) {
    let parent = node.borrow().parent.as_ref().and_then(Weak::upgrade).expect("erase_entry requires a linked node");
    let parent_contiguous = parent.borrow().flags.contains(NodeFlags::CONTIGUOUS);
    let (mut cluster, mut offset) = {
        let n = node.borrow();
        (n.entry_cluster, n.entry_offset)
    };
    let name_entries = name_entry_count(node.borrow().name.len());

    let mut entry = read_entry_at(sb, dev, cluster, offset);
    entry[0] &= !ENTRY_VALID;
    write_entry_at(sb, dev, cluster, offset, &entry);

    next_entry_position(sb, dev, parent_contiguous, &mut cluster, &mut offset);
    let mut entry = read_entry_at(sb, dev, cluster, offset);
    entry[0] &= !ENTRY_VALID;
    write_entry_at(sb, dev, cluster, offset, &entry);

    for _ in 0..name_entries {
        next_entry_position(sb, dev, parent_contiguous, &mut cluster, &mut offset);
        let mut entry = read_entry_at(sb, dev, cluster, offset);
        entry[0] &= !ENTRY_VALID;
        write_entry_at(sb, dev, cluster, offset, &entry);
    }
}

fn delete<D: BlockDevice>(sb: &SuperBlock, dev: &mut D, node: &NodeRef) {
    erase_entry(sb, dev, node);
    if let Some(parent) = node.borrow().parent.as_ref().and_then(Weak::upgrade) {
        parent.borrow_mut().children.retain(|c| !Rc::ptr_eq(c, node));
    }
    node.borrow_mut().parent = None;
    node.borrow_mut().flags.insert(NodeFlags::UNLINKED);
}

/// Unlink a file. Rejects directories; actual cluster release is deferred
/// to the node's final `put_node`.
pub fn unlink<D: BlockDevice>(sb: &SuperBlock, dev: &mut D, node: &NodeRef) -> Result<()> {
    if node.borrow().flags.contains(NodeFlags::DIRECTORY) {
        return Err(Error::IsDir);
    }
    delete(sb, dev, node);
    Ok(())
}

/// Remove an empty directory; rejects files and non-empty directories.
pub fn rmdir<D: BlockDevice>(sb: &SuperBlock, dev: &mut D, side: &mut SideEffects, node: &NodeRef) -> Result<()> {
    if !node.borrow().flags.contains(NodeFlags::DIRECTORY) {
        return Err(Error::NotDir);
    }
    cache_directory(sb, dev, node, side)?;
    if !node.borrow().children.is_empty() {
        return Err(Error::NotEmpty);
    }
    delete(sb, dev, node);
    Ok(())
}
