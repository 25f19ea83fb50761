//! The file allocation table itself: chain traversal and the cluster/sector
//! arithmetic around it.
//!
//! FAT16 and FAT32 encode their sentinels in different numeric ranges; the
//! walker normalizes FAT16 values up into the FAT32 space so everything
//! downstream checks one set of constants.

use crate::Error;
use crate::storage::Storage;

use super::{FatGeometry, FatVariant, VolumeIo};
use super::cache::CacheSize;

use typenum::consts::U512;

use core::convert::TryInto;

pub type Cluster = u32;
pub type Lba = u64;

/// An unallocated cluster. Never a valid link in a chain.
pub const FREE: Cluster = 0x0000_0000;
/// A cluster marked bad. Never a valid link either.
pub const BAD: Cluster = 0x0FFF_FFF7;
/// The lowest end-of-chain value (after normalization).
pub const END_OF_CHAIN: Cluster = 0x0FFF_FFF8;

pub fn is_end_of_chain(cluster: Cluster) -> bool {
    cluster >= END_OF_CHAIN
}

impl FatGeometry {
    pub fn cluster_size_in_bytes(&self) -> u32 {
        self.sectors_per_cluster as u32 * 512
    }

    /// Bytes one FAT entry occupies on disk.
    pub fn fat_entry_size(&self) -> u32 {
        match self.variant {
            FatVariant::Fat16 { .. } => 2,
            FatVariant::Fat32 { .. } => 4,
        }
    }

    /// Absolute sector where `cluster`'s data begins. Cluster numbering
    /// starts at 2.
    pub fn first_sector_of_cluster(&self, cluster: Cluster) -> Lba {
        self.first_data_sector + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }
}

impl<'a, S, N> VolumeIo<'a, S, N>
where
    S: Storage<SECTOR_SIZE = U512>,
    N: CacheSize,
{
    /// Follows one link: the FAT entry for `cluster`, normalized.
    ///
    /// End-of-chain values are returned (the caller decides whether hitting
    /// the end is fine or a corruption); free and bad values are never
    /// legitimate inside a chain and fail right here.
    ///
    /// `cluster` itself must be a real cluster number: not free, bad, or
    /// end-of-chain.
    pub fn next_cluster(&mut self, cluster: Cluster) -> Result<Cluster, Error> {
        debug_assert!(cluster != FREE && cluster != BAD && !is_end_of_chain(cluster));

        let entry_offset = cluster as u64 * self.geom.fat_entry_size() as u64;
        let lba = self.geom.fat_start_sector + entry_offset / 512;
        let offset = (entry_offset % 512) as usize;

        let slot = self.fat_cache.get(self.storage, lba)?;
        let bytes = slot.bytes();

        let next = match self.geom.variant {
            FatVariant::Fat32 { .. } => {
                // The top nibble is reserved.
                u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
                    & 0x0FFF_FFFF
            }
            FatVariant::Fat16 { .. } => {
                let raw = u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap());

                // Lift FAT16's BAD/EOC range (0xFFF7..) into the FAT32
                // numeric space.
                if raw >= 0xFFF7 {
                    raw as u32 | 0x0FFF_0000
                } else {
                    raw as u32
                }
            }
        };

        if next == FREE || next == BAD {
            log::warn!(
                "FAT entry for cluster {} is {:#010X}; chain is corrupt",
                cluster, next,
            );
            return Err(Error::CorruptChain);
        }

        Ok(next)
    }

    /// Follows the chain `steps` links forward. Fails if the chain ends
    /// before then.
    pub fn walk_chain(&mut self, mut cluster: Cluster, steps: u64) -> Result<Cluster, Error> {
        for _ in 0..steps {
            if is_end_of_chain(cluster) {
                log::warn!("cluster chain ends early");
                return Err(Error::CorruptChain);
            }

            cluster = self.next_cluster(cluster)?;
        }

        Ok(cluster)
    }

    /// Moves a cursor one sector forward, hopping the chain at cluster
    /// boundaries.
    pub fn advance(&mut self, cursor: &mut ClusterCursor) -> Result<(), Error> {
        cursor.sector_in_cluster += 1;

        if cursor.sector_in_cluster == self.geom.sectors_per_cluster as u32 {
            let next = self.next_cluster(cursor.cluster)?;

            cursor.cluster = next;
            cursor.sector_in_cluster = 0;
            cursor.cluster_start = if is_end_of_chain(next) {
                // No data behind an end marker; `sector()` must not be
                // used until the caller has checked.
                0
            } else {
                self.geom.first_sector_of_cluster(next)
            };
        }

        Ok(())
    }

    /// Moves a directory cursor one sector forward.
    pub fn advance_dir(&mut self, cursor: &mut DirCursor) -> Result<(), Error> {
        match cursor {
            DirCursor::Linear { sector, remaining } => {
                if *remaining > 0 {
                    *sector += 1;
                    *remaining -= 1;
                }
                Ok(())
            }
            DirCursor::Chained(c) => self.advance(c),
        }
    }
}

/// A position inside a cluster chain, one sector at a time.
///
/// The absolute sector is `cluster_start + sector_in_cluster`; `cluster` is
/// carried along so the chain can be followed without re-deriving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterCursor {
    pub cluster: Cluster,
    pub sector_in_cluster: u32,
    pub cluster_start: Lba,
}

impl ClusterCursor {
    /// Positions a cursor on the sector holding `byte_offset`, given the
    /// cluster that contains that offset.
    pub fn new(geom: &FatGeometry, cluster: Cluster, byte_offset: u64) -> Self {
        let within = byte_offset % geom.cluster_size_in_bytes() as u64;

        Self {
            cluster,
            sector_in_cluster: (within / 512) as u32,
            cluster_start: geom.first_sector_of_cluster(cluster),
        }
    }

    pub fn sector(&self) -> Lba {
        self.cluster_start + self.sector_in_cluster as u64
    }
}

/// Where directory entries come from. The FAT16 root directory is a plain
/// run of sectors with no chain behind it; everything else is a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirCursor {
    Linear { sector: Lba, remaining: u32 },
    Chained(ClusterCursor),
}

impl DirCursor {
    pub fn root(geom: &FatGeometry) -> Self {
        match geom.variant {
            FatVariant::Fat16 { root_dir_sector } => DirCursor::Linear {
                sector: root_dir_sector,
                remaining: geom.root_dir_sectors,
            },
            FatVariant::Fat32 { root_dir_cluster } => {
                DirCursor::Chained(ClusterCursor::new(geom, root_dir_cluster, 0))
            }
        }
    }

    pub fn at_cluster(geom: &FatGeometry, cluster: Cluster) -> Self {
        DirCursor::Chained(ClusterCursor::new(geom, cluster, 0))
    }

    /// The sector to scan next; `None` once the directory is exhausted.
    pub fn sector(&self) -> Option<Lba> {
        match self {
            DirCursor::Linear { remaining: 0, .. } => None,
            DirCursor::Linear { sector, .. } => Some(*sector),
            DirCursor::Chained(c) if is_end_of_chain(c.cluster) => None,
            DirCursor::Chained(c) => Some(c.sector()),
        }
    }
}
