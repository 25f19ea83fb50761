//! Types and tools for the FAT Boot Sector and friends.
//!
//! Majority of the field docs here are sourced from
//! [this page](https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system).

use crate::Error;
use crate::storage::SectorBuf;

use core::convert::TryInto;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    // Offset: 0x003
    pub oem_name: [u8; 8],

    pub bpb: BiosParameterBlock,

    /// From the extended boot record. The label/type strings live at
    /// different offsets on FAT16 and FAT32 EBPBs; which one applies is
    /// picked by the same heuristic everything else uses (a nonzero 16-bit
    /// FAT size means the short EBPB).
    pub volume_id: u32,
    /// Advisory; never validated.
    pub volume_label: [u8; 11],
    /// Advisory; never validated ("FAT16   ", "FAT32   ", ...).
    pub file_system_type: [u8; 8],
}

/// The BIOS Parameter Block: DOS 2.0 + 3.31 fields plus the FAT32 extension.
///
/// The FAT32-only fields decode to garbage on a FAT16 volume; nothing reads
/// them before the volume is classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosParameterBlock {
    /// Bytes per logical sector in powers of two; the most common value is
    /// 512 and the only one this driver takes.
    // Offset: 0x00B
    pub bytes_per_sector: u16,

    /// Logical sectors per cluster. Allowed values are 1, 2, 4, 8, 16, 32,
    /// 64, and 128.
    // Offset: 0x00D
    pub sectors_per_cluster: u8,

    // Offset: 0x00E
    pub reserved_sectors: u16,

    // Offset: 0x010
    pub num_fats: u8,

    /// Maximum number of root directory entries; 0 for FAT32 (whose root is
    /// an ordinary cluster chain).
    // Offset: 0x011
    pub max_root_dir_entries: u16,

    /// Total logical sectors; 0 means "use the 32-bit count at 0x020".
    // Offset: 0x013
    pub total_sectors_16: u16,

    // Offset: 0x015
    pub media_descriptor: u8,

    /// Logical sectors per FAT; 0 on FAT32 (use the 32-bit count at 0x024).
    // Offset: 0x016
    pub fat_size_16: u16,

    /// Physical sectors per track for INT 13h CHS geometry. Unused here.
    // Offset: 0x018
    pub sectors_per_track: u16,

    /// Number of heads for INT 13h CHS geometry. Unused here.
    // Offset: 0x01A
    pub num_heads: u16,

    /// Count of sectors preceding this partition.
    // Offset: 0x01C
    pub hidden_sectors: u32,

    /// Total logical sectors when the 16-bit count at 0x013 is zero.
    // Offset: 0x020
    pub total_sectors_32: u32,

    // The FAT32 EBPB:

    /// Logical sectors per FAT when the 16-bit count at 0x016 is zero.
    // Offset: 0x024
    pub fat_size_32: u32,

    /// Drive description / mirroring flags.
    // Offset: 0x028
    pub ext_flags: u16,

    /// FAT32 version (defined as 0.0).
    // Offset: 0x02A
    pub fs_version: u16,

    /// Cluster number of the root directory start, typically 2.
    // Offset: 0x02C
    pub root_dir_cluster: u32,

    /// Logical sector number of the FS Information Sector, typically 1.
    // Offset: 0x030
    pub fs_info_sector: u16,

    /// First sector of the backup boot record, typically 6; 0 means none.
    // Offset: 0x032
    pub backup_boot_sector: u16,
}

/// Which flavour of FAT a partition turned out to be, with the one field
/// that differs: FAT16 keeps its root directory in a fixed run of sectors in
/// front of the data area, FAT32's root is a cluster chain like any other
/// directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatVariant {
    Fat16 { root_dir_sector: u64 },
    Fat32 { root_dir_cluster: u32 },
}

/// Everything cluster arithmetic needs, derived once at mount. All sector
/// numbers are absolute LBAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatGeometry {
    pub variant: FatVariant,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub fat_size_in_sectors: u32,
    /// First sector of the (first) FAT.
    pub fat_start_sector: u64,
    /// Sectors occupied by the FAT16 root directory; 0 on FAT32.
    pub root_dir_sectors: u32,
    /// First sector of the data area (cluster 2 starts here).
    pub first_data_sector: u64,
    /// One past the highest usable cluster number, kept for the (future)
    /// allocator.
    pub num_clusters: u32,
}

macro_rules! e {
    ($sector:expr, $ty:tt, $offset:expr) => {
        $ty::from_le_bytes(
            $sector[$offset..($offset + core::mem::size_of::<$ty>())]
                .try_into()
                .unwrap(),
        )
    };
}

impl BootSector {
    /// Decodes a boot sector, checking the jump instruction and the `55 AA`
    /// signature first.
    pub fn read(sector: &SectorBuf) -> Result<Self, Error> {
        let sector = sector.as_slice();

        if sector[510..512] != [0x55, 0xAA] {
            log::warn!("boot sector lacks the 55 AA signature");
            return Err(Error::BadFormat);
        }

        // A BPB starts with a jump over itself: either JMP rel16 (0xE9 xx
        // xx) or JMP rel8 + NOP (0xEB xx 0x90).
        let valid_jump = sector[0] == 0xE9 || (sector[0] == 0xEB && sector[2] == 0x90);
        if !valid_jump {
            log::warn!(
                "boot sector starts with {:#04X} {:#04X} {:#04X}, not a BPB jump",
                sector[0], sector[1], sector[2],
            );
            return Err(Error::BadFormat);
        }

        let bpb = BiosParameterBlock {
            bytes_per_sector: e!(sector, u16, 0x00B),
            sectors_per_cluster: e!(sector, u8, 0x00D),
            reserved_sectors: e!(sector, u16, 0x00E),
            num_fats: e!(sector, u8, 0x010),
            max_root_dir_entries: e!(sector, u16, 0x011),
            total_sectors_16: e!(sector, u16, 0x013),
            media_descriptor: e!(sector, u8, 0x015),
            fat_size_16: e!(sector, u16, 0x016),
            sectors_per_track: e!(sector, u16, 0x018),
            num_heads: e!(sector, u16, 0x01A),
            hidden_sectors: e!(sector, u32, 0x01C),
            total_sectors_32: e!(sector, u32, 0x020),
            fat_size_32: e!(sector, u32, 0x024),
            ext_flags: e!(sector, u16, 0x028),
            fs_version: e!(sector, u16, 0x02A),
            root_dir_cluster: e!(sector, u32, 0x02C),
            fs_info_sector: e!(sector, u16, 0x030),
            backup_boot_sector: e!(sector, u16, 0x032),
        };

        // The short (FAT12/16) EBPB puts the id/label/type strings right
        // after the DOS 3.31 block; FAT32 pushes them past its extension.
        let ebpb = if bpb.fat_size_16 != 0 { 0x027 } else { 0x043 };

        Ok(Self {
            oem_name: sector[3..(3 + 8)].try_into().unwrap(),
            bpb,
            volume_id: e!(sector, u32, ebpb),
            volume_label: sector[(ebpb + 4)..(ebpb + 4 + 11)].try_into().unwrap(),
            file_system_type: sector[(ebpb + 15)..(ebpb + 15 + 8)].try_into().unwrap(),
        })
    }

    /// Validates the geometry fields and derives the mount-time constants,
    /// classifying the volume as FAT16 or FAT32 by its cluster count.
    ///
    /// `first_lba` is where this boot sector lives (the partition start);
    /// everything in the result is absolute.
    pub fn geometry(&self, first_lba: u64) -> Result<FatGeometry, Error> {
        let bpb = &self.bpb;

        if bpb.bytes_per_sector != 512 {
            log::warn!(
                "{} bytes per sector is unsupported (only 512 is)",
                bpb.bytes_per_sector,
            );
            return Err(Error::BadFormat);
        }

        let spc = bpb.sectors_per_cluster;
        if !spc.is_power_of_two() {
            log::warn!("{} sectors per cluster is not a power of two", spc);
            return Err(Error::BadFormat);
        }

        if bpb.num_fats == 0 {
            log::warn!("volume claims zero FATs");
            return Err(Error::BadFormat);
        }

        let total_sectors = if bpb.total_sectors_16 != 0 {
            bpb.total_sectors_16 as u32
        } else {
            bpb.total_sectors_32
        };

        let fat_size = if bpb.fat_size_16 != 0 {
            bpb.fat_size_16 as u32
        } else {
            bpb.fat_size_32
        };

        if total_sectors == 0 || fat_size == 0 {
            log::warn!("volume claims zero total sectors or a zero-length FAT");
            return Err(Error::BadFormat);
        }

        let root_dir_sectors = ((bpb.max_root_dir_entries as u32) * 32 + 511) / 512;

        let data_start = bpb.reserved_sectors as u32
            + bpb.num_fats as u32 * fat_size
            + root_dir_sectors;

        let data_sectors = match total_sectors.checked_sub(data_start) {
            Some(s) => s,
            None => {
                log::warn!("FATs and root directory overrun the volume");
                return Err(Error::BadFormat);
            }
        };

        let count_of_clusters = data_sectors / spc as u32;
        let first_data_sector = first_lba + data_start as u64;

        let variant = if count_of_clusters < 4085 {
            // FAT12 territory.
            log::warn!(
                "volume has {} clusters, which makes it FAT12; unsupported",
                count_of_clusters,
            );
            return Err(Error::BadFormat);
        } else if count_of_clusters < 65525 {
            FatVariant::Fat16 {
                root_dir_sector: first_data_sector - root_dir_sectors as u64,
            }
        } else {
            FatVariant::Fat32 {
                root_dir_cluster: bpb.root_dir_cluster,
            }
        };

        Ok(FatGeometry {
            variant,
            sectors_per_cluster: spc,
            reserved_sectors: bpb.reserved_sectors,
            num_fats: bpb.num_fats,
            fat_size_in_sectors: fat_size,
            fat_start_sector: first_lba + bpb.reserved_sectors as u64,
            root_dir_sectors,
            first_data_sector,
            num_clusters: count_of_clusters + 1,
        })
    }
}
