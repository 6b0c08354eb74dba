//! The exFAT boot sector (§3 "Superblock", §6 "Superblock requirements").
//!
//! Mirrors the teacher crate's `BootSector`: we keep the entire 512-byte
//! sector around (block devices don't allow byte-granular writes, so any
//! in-place update needs the whole sector anyway) and expose validated,
//! named accessors over it instead of parsing into a `#[repr(C)]` struct —
//! matching the original `libexfat` approach of reading fields directly out
//! of the raw sector by offset.

use fmt_extra::AsciiStr;
use index_fixed::index_fixed;

use crate::error::{Error, Result};

const BOOT_SECTOR_SIZE: usize = 512;
const EXFAT_MAGIC: &[u8; 8] = b"EXFAT   ";

fn read_u16(src: &[u8]) -> u16 {
    u16::from_le_bytes(*index_fixed!(&src; 0, ..2))
}

fn read_u32(src: &[u8]) -> u32 {
    u32::from_le_bytes(*index_fixed!(&src; 0, ..4))
}

/// Raw boot sector contents plus cheap, validated accessors.
///
/// Fields and offsets per the exFAT specification's "Main Boot Sector"
/// table; see the teacher crate's `BootSector` for the original field-by-
/// field commentary this mirrors.
pub struct BootSector {
    raw: [u8; BOOT_SECTOR_SIZE],
}

impl BootSector {
    pub fn from_bytes(raw: [u8; BOOT_SECTOR_SIZE]) -> Result<Self> {
        BootSector { raw }.validate()
    }

    pub fn raw(&self) -> &[u8; BOOT_SECTOR_SIZE] {
        &self.raw
    }

    /// offset: 3, size: 8. Must equal `"EXFAT   "` (3 trailing spaces).
    pub fn magic(&self) -> &[u8; 8] {
        index_fixed!(&self.raw; 3, ..11)
    }

    /// offset: 80, size: 4. Volume-relative sector offset of the First FAT.
    pub fn fat_offs(&self) -> u32 {
        read_u32(&self.raw[80..])
    }

    /// offset: 84, size: 4. Length in sectors of one FAT table.
    pub fn fat_len(&self) -> u32 {
        read_u32(&self.raw[84..])
    }

    /// offset: 88, size: 4. Volume-relative sector offset of the cluster heap.
    pub fn cluster_heap_offs(&self) -> u32 {
        read_u32(&self.raw[88..])
    }

    /// offset: 92, size: 4. Number of clusters in the cluster heap.
    pub fn cluster_count(&self) -> u32 {
        read_u32(&self.raw[92..])
    }

    /// offset: 96, size: 4. First cluster of the root directory.
    pub fn first_cluster_of_root_dir(&self) -> u32 {
        read_u32(&self.raw[96..])
    }

    /// offset: 100, size: 4.
    pub fn volume_serial_num(&self) -> u32 {
        read_u32(&self.raw[100..])
    }

    /// offset: 104, size: 2. High byte major, low byte minor.
    pub fn file_system_rev(&self) -> u16 {
        read_u16(&self.raw[104..])
    }

    /// offset: 106, size: 2. Bit 1 is the "volume dirty" flag.
    pub fn volume_flags(&self) -> u16 {
        read_u16(&self.raw[106..])
    }

    /// offset: 108, size: 1. `log2` of the sector size, range [9, 12].
    pub fn bytes_per_sector_shift(&self) -> u8 {
        self.raw[108]
    }

    /// offset: 109, size: 1. `log2` of sectors-per-cluster.
    pub fn sectors_per_cluster_shift(&self) -> u8 {
        self.raw[109]
    }

    /// offset: 110, size: 1. 1 (single FAT) or 2 (TexFAT).
    pub fn number_of_fats(&self) -> u8 {
        self.raw[110]
    }

    /// offset: 111, size: 1. INT 13h drive number.
    pub fn drive_select(&self) -> u8 {
        self.raw[111]
    }

    /// offset: 112, size: 1. Percentage of the cluster heap in use, or 0xff.
    pub fn percent_in_use(&self) -> u8 {
        self.raw[112]
    }

    fn validate(self) -> Result<Self> {
        let magic = self.magic();
        if magic != EXFAT_MAGIC {
            return Err(Error::format(format!(
                "bad exFAT magic: {}",
                AsciiStr(&magic[..])
            )));
        }

        let zeroed = &self.raw[11..11 + 53];
        if zeroed.iter().any(|&b| b != 0) {
            return Err(Error::format("reserved BIOS-parameter-block region is non-zero"));
        }

        if self.fat_offs() < 24 {
            return Err(Error::format(format!(
                "FAT offset {} is smaller than the boot region ({} sectors)",
                self.fat_offs(),
                24
            )));
        }

        let shift = self.bytes_per_sector_shift();
        if !(9..=12).contains(&shift) {
            return Err(Error::format(format!(
                "bytes-per-sector shift {shift} out of range [9, 12]"
            )));
        }

        let spc_shift = self.sectors_per_cluster_shift();
        if spc_shift as u32 + shift as u32 > 25 {
            return Err(Error::format(format!(
                "sectors-per-cluster shift {spc_shift} too large for sector shift {shift}"
            )));
        }

        let fats = self.number_of_fats();
        if fats != 1 && fats != 2 {
            return Err(Error::format(format!("number of FATs {fats} must be 1 or 2")));
        }

        let heap_min = self.fat_offs() + self.fat_len() * fats as u32;
        if self.cluster_heap_offs() < heap_min {
            return Err(Error::format(format!(
                "cluster heap offset {} precedes the end of the FAT region ({heap_min})",
                self.cluster_heap_offs()
            )));
        }

        let root = self.first_cluster_of_root_dir();
        if root < 2 || root > self.cluster_count() + 1 {
            return Err(Error::format(format!(
                "root directory cluster {root} out of range [2, {}]",
                self.cluster_count() + 1
            )));
        }

        Ok(self)
    }
}

/// A parsed, validated copy of the boot record, exposing exactly the fields
/// §3 names (and nothing else) to the rest of the core. Read-only after
/// mount.
#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub sector_bits: u8,
    pub block_bits: u8,
    pub sectors_per_cluster_bits: u8,
    pub fat_sector_start: u32,
    pub fat_sector_count: u32,
    pub cluster_sector_start: u32,
    pub cluster_count: u32,
    pub rootdir_cluster: u32,
    pub volume_serial: u32,
    pub version: (u8, u8),
    pub volume_state: u16,
    pub fat_count: u8,
    pub drive_no: u8,
    pub allocated_percent: u8,
}

impl SuperBlock {
    pub fn from_boot_sector(bs: &BootSector) -> Self {
        let rev = bs.file_system_rev();
        SuperBlock {
            sector_bits: bs.bytes_per_sector_shift(),
            block_bits: bs.bytes_per_sector_shift(),
            sectors_per_cluster_bits: bs.sectors_per_cluster_shift(),
            fat_sector_start: bs.fat_offs(),
            fat_sector_count: bs.fat_len(),
            cluster_sector_start: bs.cluster_heap_offs(),
            cluster_count: bs.cluster_count(),
            rootdir_cluster: bs.first_cluster_of_root_dir(),
            volume_serial: bs.volume_serial_num(),
            version: ((rev >> 8) as u8, (rev & 0xff) as u8),
            volume_state: bs.volume_flags(),
            fat_count: bs.number_of_fats(),
            drive_no: bs.drive_select(),
            allocated_percent: bs.percent_in_use(),
        }
    }

    pub fn sector_size(&self) -> u64 {
        1u64 << self.sector_bits
    }

    pub fn cluster_size(&self) -> u64 {
        1u64 << (self.sector_bits + self.sectors_per_cluster_bits)
    }

    pub fn fat_byte_offset(&self) -> u64 {
        (self.fat_sector_start as u64) << self.sector_bits
    }

    pub fn cluster_heap_byte_offset(&self) -> u64 {
        (self.cluster_sector_start as u64) << self.sector_bits
    }

    /// Volume-wide bitmap length in bytes: `ceil((cluster_count - 2) / 8)`.
    pub fn bitmap_byte_len(&self) -> usize {
        (self.cluster_count as usize).saturating_sub(2).div_ceil(8)
    }
}
