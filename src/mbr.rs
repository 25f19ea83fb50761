//! Master Boot Record reading.
//!
//! The classic four-slot table at LBA 0. As with [`crate::gpt`], this module
//! only reports what is on disk; the mount path decides which entries to
//! chase for a BPB.

use crate::{Error, Storage};

use generic_array::GenericArray;
use typenum::consts::U512;

use core::convert::TryInto;

pub const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
pub const NUM_ENTRIES: usize = 4;

/// One of the four primary partition slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbrPartition {
    /// Bit 7 of the status byte.
    pub boot: bool,
    /// The raw type byte.
    pub partition_type: u8,
    pub first_lba: u32,
    pub num_sectors: u32,
}

impl MbrPartition {
    /// Type bytes that announce a FAT filesystem: FAT16 (0x04, 0x06, 0x0E
    /// with LBA addressing) and FAT32 (0x0B, 0x0C with LBA addressing).
    ///
    /// The byte is only tentative; the partition still has to produce a
    /// valid BPB.
    pub fn is_fat(&self) -> bool {
        matches!(self.partition_type, 0x04 | 0x06 | 0x0B | 0x0C | 0x0E)
    }

    pub fn is_unused(&self) -> bool {
        self.partition_type == 0x00
    }

    fn from_slice(entry: &[u8]) -> Self {
        Self {
            boot: entry[0] & 0x80 != 0,
            partition_type: entry[4],
            first_lba: u32::from_le_bytes(entry[8..12].try_into().unwrap()),
            num_sectors: u32::from_le_bytes(entry[12..16].try_into().unwrap()),
        }
    }
}

/// The decoded table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mbr {
    pub partitions: [MbrPartition; NUM_ENTRIES],
}

impl Mbr {
    /// Reads LBA 0 and decodes the table. `Ok(None)` when the boot signature
    /// is missing.
    ///
    /// Note that a bare FAT volume ("superfloppy") carries the same `55 AA`
    /// signature at the same offset, so a decoded `Mbr` whose slots name no
    /// FAT partition may really be a BPB; see the discovery path.
    pub fn read<S: Storage<SECTOR_SIZE = U512>>(storage: &mut S) -> Result<Option<Self>, Error> {
        let mut sector = GenericArray::default();
        storage.read_sector(0, &mut sector).map_err(|e| {
            log::warn!("MBR probe failed to read LBA 0: {:?}", e);
            Error::Io
        })?;

        let sector = sector.as_slice();

        if sector[510..512] != MBR_SIGNATURE {
            return Ok(None);
        }

        let mut partitions = [MbrPartition::default(); NUM_ENTRIES];
        for (i, slot) in partitions.iter_mut().enumerate() {
            let offset = TABLE_OFFSET + i * ENTRY_SIZE;
            *slot = MbrPartition::from_slice(&sector[offset..offset + ENTRY_SIZE]);
        }

        Ok(Some(Self { partitions }))
    }

    /// True when at least one slot is typed as FAT.
    pub fn has_fat_partition(&self) -> bool {
        self.partitions.iter().any(|p| p.is_fat())
    }
}
