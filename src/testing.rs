//! A tiny fault-injectable in-memory disk for unit tests, plus a hand-built
//! FAT16 volume on top of it.

use crate::FatFs;
use crate::fat::{Partition, PartitionKind, MAX_OPEN_FILES, MAX_PARTITIONS};
use crate::fat::boot_sector::{FatGeometry, FatVariant};
use crate::fat::cache::SectorCache;
use crate::fat::file::FileDesc;
use crate::storage::{ReadError, SectorBuf, Storage, WriteError};

use typenum::consts::{U4, U512};

pub(crate) struct TestDisk {
    pub bytes: Vec<u8>,
    pub reads: usize,
    pub writes: usize,
    pub fail_read_of: Option<u64>,
    pub fail_writes: bool,
}

impl TestDisk {
    pub fn new(capacity_in_sectors: u64) -> Self {
        Self {
            bytes: vec![0; (capacity_in_sectors * 512) as usize],
            reads: 0,
            writes: 0,
            fail_read_of: None,
            fail_writes: false,
        }
    }

    pub fn sector(&self, lba: u64) -> &[u8] {
        let offset = (lba * 512) as usize;
        &self.bytes[offset..offset + 512]
    }

    pub fn fill_sector(&mut self, lba: u64, value: u8) {
        let offset = (lba * 512) as usize;
        for b in &mut self.bytes[offset..offset + 512] {
            *b = value;
        }
    }
}

impl Storage for TestDisk {
    type SECTOR_SIZE = U512;

    type ReadErr = &'static str;
    type WriteErr = &'static str;

    fn capacity(&self) -> u64 {
        (self.bytes.len() / 512) as u64
    }

    fn read_sector(
        &mut self,
        lba: u64,
        buffer: &mut SectorBuf,
    ) -> Result<(), ReadError<&'static str>> {
        if self.fail_read_of == Some(lba) {
            return Err(ReadError::Other("injected read failure"));
        }

        let offset = (lba * 512) as usize;
        if offset + 512 > self.bytes.len() {
            return Err(ReadError::OutOfRange {
                requested_sector: lba,
                capacity: self.capacity(),
            });
        }

        self.reads += 1;
        buffer
            .as_mut_slice()
            .copy_from_slice(&self.bytes[offset..offset + 512]);
        Ok(())
    }

    fn write_sector(
        &mut self,
        lba: u64,
        buffer: &SectorBuf,
    ) -> Result<(), WriteError<&'static str>> {
        if self.fail_writes {
            return Err(WriteError::Other("injected write failure"));
        }

        let offset = (lba * 512) as usize;
        if offset + 512 > self.bytes.len() {
            return Err(WriteError::OutOfRange {
                requested_sector: lba,
                capacity: self.capacity(),
            });
        }

        self.writes += 1;
        self.bytes[offset..offset + 512].copy_from_slice(buffer.as_slice());
        Ok(())
    }
}

pub(crate) fn pattern(i: usize) -> u8 {
    (i % 251) as u8
}

pub(crate) fn sample_geometry() -> FatGeometry {
    FatGeometry {
        variant: FatVariant::Fat16 { root_dir_sector: 68 },
        sectors_per_cluster: 2,
        reserved_sectors: 1,
        num_fats: 1,
        fat_size_in_sectors: 64,
        fat_start_sector: 1,
        root_dir_sectors: 3,
        first_data_sector: 71,
        num_clusters: 10_000,
    }
}

pub(crate) fn dir_entry_bytes(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[0..11].copy_from_slice(name);
    e[11] = attr;
    e[14..16].copy_from_slice(&0x6E6Du16.to_le_bytes()); // creation 13:51:26
    e[16..18].copy_from_slice(&0x52E9u16.to_le_bytes()); // creation 2021-07-09
    e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    e[22..24].copy_from_slice(&0x6CBDu16.to_le_bytes()); // write 13:37:58
    e[24..26].copy_from_slice(&0x52E9u16.to_le_bytes()); // write 2021-07-09
    e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    e[28..32].copy_from_slice(&size.to_le_bytes());
    e
}

/// A ready-made FAT16 volume, assembled directly (no partition table):
/// 1 reserved sector, one 64-sector FAT, 3 root directory sectors at 68,
/// data from sector 71, 2 sectors (1 KiB) per cluster. Cluster `n` sits at
/// sector `71 + (n - 2) * 2`.
///
/// Contents:
/// - `HELLO.TXT`: 13 bytes, "Hello, world!", cluster 5
/// - `BIG.BIN`: 3000 patterned bytes over clusters 2 -> 3 -> 4
/// - `SUBDIR`: a directory at cluster 8 (empty)
/// - `LOCKED.TXT`: read-only attribute, shares cluster 5
/// - `SIZELIE.BIN`: claims 4096 bytes but its chain (6 -> 7 -> free) only
///   holds 2048
/// - `EXACT.BIN`: exactly one cluster (1024 bytes), shares cluster 5
pub(crate) fn sample_volume() -> FatFs<TestDisk, U4> {
    let mut d = TestDisk::new(256);

    let fat16 = |d: &mut TestDisk, cluster: u32, value: u16| {
        let offset = 512 + cluster as usize * 2;
        d.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    };
    fat16(&mut d, 2, 3);
    fat16(&mut d, 3, 4);
    fat16(&mut d, 4, 0xFFFF);
    fat16(&mut d, 5, 0xFFFF);
    fat16(&mut d, 6, 7);
    fat16(&mut d, 7, 0x0000);
    fat16(&mut d, 8, 0xFFFF);

    let put = |d: &mut TestDisk, slot: usize, e: &[u8; 32]| {
        let offset = 68 * 512 + slot * 32;
        d.bytes[offset..offset + 32].copy_from_slice(e);
    };
    put(&mut d, 0, &dir_entry_bytes(b"HELLO   TXT", 0x20, 5, 13));
    put(&mut d, 1, &dir_entry_bytes(b"BIG     BIN", 0x20, 2, 3000));
    put(&mut d, 2, &dir_entry_bytes(b"SUBDIR     ", 0x10, 8, 0));
    put(&mut d, 3, &dir_entry_bytes(b"LOCKED  TXT", 0x21, 5, 13));
    put(&mut d, 4, &dir_entry_bytes(b"SIZELIE BIN", 0x20, 6, 4096));
    put(&mut d, 5, &dir_entry_bytes(b"EXACT   BIN", 0x20, 5, 1024));

    // Cluster 5 (sector 77): the hello file.
    d.bytes[77 * 512..77 * 512 + 13].copy_from_slice(b"Hello, world!");

    // Clusters 2..=4 (sectors 71..77): 3000 patterned bytes.
    for i in 0..3000 {
        d.bytes[71 * 512 + i] = pattern(i);
    }

    // Clusters 6, 7 (sectors 79..83): pattern for the size liar.
    for i in 0..2048 {
        d.bytes[79 * 512 + i] = pattern(i);
    }

    let mut partitions = [Partition::default(); MAX_PARTITIONS];
    partitions[0] = Partition {
        first_sector: 0,
        num_sectors: 256,
        boot: false,
        kind: PartitionKind::Fat(sample_geometry()),
    };

    FatFs {
        storage: d,
        partitions,
        active: 0,
        files: [FileDesc::default(); MAX_OPEN_FILES],
        data_cache: SectorCache::new(),
        fat_cache: SectorCache::new(),
    }
}
