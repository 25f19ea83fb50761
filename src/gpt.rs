//! GUID Partition Table reading.
//!
//! Only the pieces partition discovery needs: the header at LBA 1 and the
//! partition entry array it points at. Entries are surfaced raw-ish (type
//! GUID, LBA range, attribute bits); deciding what is and is not a FAT
//! partition is the mount path's call.

use crate::{Error, Storage};

use generic_array::GenericArray;
use typenum::consts::U512;

use core::convert::TryInto;
use core::fmt::{self, Debug};

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// The partition type GUID Windows stamps on plain data partitions
/// (`EBD0A0A2-B9E5-4433-87C0-68B6B72699C7`); FAT volumes on GPT disks carry
/// this type.
pub const BASIC_DATA: Guid = Guid::from_bytes([
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44,
    0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
]);

/// A 128-bit GUID, stored in the "middle-endian" on-disk byte order GPT uses
/// (first three groups little-endian, the rest big-endian).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Guid([u8; 16]);

impl Guid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Builds a `Guid` from the canonical textual value (the number GUIDs
    /// are usually written as), swizzling into on-disk order.
    pub fn from_canonical_u128(u: u128) -> Self {
        let b = u.to_be_bytes();

        Self([
            b[3], b[2], b[1], b[0],
            b[5], b[4],
            b[7], b[6],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        ])
    }

    pub const fn to_bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl Debug for Guid {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;

        write!(
            fmt,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            b[3], b[2], b[1], b[0],
            b[5], b[4],
            b[7], b[6],
            b[8], b[9],
            b[10], b[11], b[12], b[13], b[14], b[15],
        )
    }
}

/// The GPT header from LBA 1.
///
/// Field descriptions sourced from
/// [here](https://en.wikipedia.org/wiki/GUID_Partition_Table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    /// Header size (usually 92 bytes).
    pub header_size: u32,
    /// CRC32 of the start of the header up to `header_size`, with this field
    /// zeroed during computation.
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    /// First usable LBA for partitions (primary partition table last LBA + 1).
    pub first_usable_lba: u64,
    /// Last usable LBA (secondary partition table first LBA − 1).
    pub last_usable_lba: u64,
    /// Disk GUID in mixed endian.
    pub disk_guid: Guid,
    /// Starting LBA of the array of partition entries (always 2 in the
    /// primary copy).
    pub entries_lba: u64,
    /// Number of partition entries in the array.
    pub num_entries: u32,
    /// Size of a single partition entry (usually 128 bytes).
    pub entry_size: u32,
    /// CRC32 of the partition entries array.
    pub entries_crc32: u32,
}

/// One entry out of the partition array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub partition_type: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
    pub attributes: u64,
}

impl PartitionEntry {
    /// An all-zero type GUID marks an unused slot.
    pub fn is_unused(&self) -> bool {
        self.partition_type.to_bytes() == [0; 16]
    }

    pub fn is_basic_data(&self) -> bool {
        self.partition_type == BASIC_DATA
    }

    /// Attribute bit 2: legacy BIOS firmware can boot from this partition.
    pub fn legacy_bios_bootable(&self) -> bool {
        self.attributes & 0x04 != 0
    }

    pub fn num_sectors(&self) -> u64 {
        (self.last_lba + 1).saturating_sub(self.first_lba)
    }
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

impl GptHeader {
    /// Reads LBA 1 and decodes the header. `Ok(None)` when there is no GPT
    /// signature there (i.e. the disk is MBR-partitioned or bare).
    pub fn read<S: Storage<SECTOR_SIZE = U512>>(storage: &mut S) -> Result<Option<Self>, Error> {
        let mut sector = GenericArray::default();
        storage.read_sector(1, &mut sector).map_err(|e| {
            log::warn!("GPT probe failed to read LBA 1: {:?}", e);
            Error::Io
        })?;

        let sector = sector.as_slice();

        if sector[0..8] != GPT_SIGNATURE {
            return Ok(None);
        }

        let header = Self {
            revision: e!(sector, u32, 8),
            header_size: e!(sector, u32, 12),
            header_crc32: e!(sector, u32, 16),
            current_lba: e!(sector, u64, 24),
            backup_lba: e!(sector, u64, 32),
            first_usable_lba: e!(sector, u64, 40),
            last_usable_lba: e!(sector, u64, 48),
            disk_guid: Guid::from_bytes(sector[56..72].try_into().unwrap()),
            entries_lba: e!(sector, u64, 72),
            num_entries: e!(sector, u32, 80),
            entry_size: e!(sector, u32, 84),
            entries_crc32: e!(sector, u32, 88),
        };

        // The header CRC is advisory here: a mismatch is logged and the
        // header is used anyway, since everything we consume out of it gets
        // validated again further down (BPB signatures, cluster counts).
        if !header.crc_matches(sector) {
            log::warn!(
                "GPT header CRC mismatch (stored {:#010X}); continuing anyway",
                header.header_crc32,
            );
        }

        // Entry layout sanity; a zero size would make the scan spin forever.
        if header.entry_size == 0
            || header.entry_size > 512
            || 512 % header.entry_size != 0
        {
            log::warn!("GPT partition entry size {} is unusable", header.entry_size);
            return Err(Error::BadFormat);
        }

        Ok(Some(header))
    }

    fn crc_matches(&self, sector: &[u8]) -> bool {
        let len = (self.header_size as usize).min(512);
        if len < 92 {
            return false;
        }

        let mut header = [0u8; 512];
        header[..len].copy_from_slice(&sector[..len]);
        // The CRC field itself counts as zero.
        header[16..20].copy_from_slice(&[0; 4]);

        crc::crc32::checksum_ieee(&header[..len]) == self.header_crc32
    }

    /// Fetches the `idx`th partition entry.
    ///
    /// Entries whose starting LBA does not fit in 32 bits are out of this
    /// driver's contract (everything downstream does 32-bit LBA arithmetic
    /// against the BPB), but they're surfaced as-is; the caller's geometry
    /// validation will reject them.
    pub fn partition_entry<S: Storage<SECTOR_SIZE = U512>>(
        &self,
        storage: &mut S,
        idx: u32,
    ) -> Result<PartitionEntry, Error> {
        if idx >= self.num_entries {
            return Err(Error::BadPartition);
        }

        let byte_offset = idx as u64 * self.entry_size as u64;
        let lba = self.entries_lba + byte_offset / 512;
        let offset = (byte_offset % 512) as usize;

        let mut sector = GenericArray::default();
        storage.read_sector(lba, &mut sector).map_err(|e| {
            log::warn!("failed to read GPT entry sector {}: {:?}", lba, e);
            Error::Io
        })?;

        let entry = &sector.as_slice()[offset..offset + self.entry_size as usize];

        Ok(PartitionEntry {
            partition_type: Guid::from_bytes(entry[0..16].try_into().unwrap()),
            unique_guid: Guid::from_bytes(entry[16..32].try_into().unwrap()),
            first_lba: e!(entry, u64, 32),
            last_lba: e!(entry, u64, 40),
            attributes: e!(entry, u64, 48),
        })
    }
}
