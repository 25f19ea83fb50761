//! FAT filesystem things!
//!
//! [`FatFs`] is the mounted-volume handle: it owns the storage, the decoded
//! partition records, the two sector caches, and the descriptor table. The
//! submodules hold the layers underneath: the boot sector decoder, the
//! sector caches, FAT chain traversal, directory walking, and the
//! descriptor operations.

use crate::{Error, Storage};
use crate::gpt::GptHeader;
use crate::mbr::Mbr;

use typenum::consts::{U4, U512};

pub mod boot_sector;
pub mod cache;
pub mod dir;
pub mod file;
pub mod table;

pub use boot_sector::{BiosParameterBlock, BootSector, FatGeometry, FatVariant};

use cache::{CacheSize, SectorCache};
use file::FileDesc;

/// Partition records decoded at mount.
pub const MAX_PARTITIONS: usize = 4;

/// Descriptor table slots.
pub const MAX_OPEN_FILES: usize = 8;

/// What a partition slot turned out to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// Not FAT (or nothing at all).
    Unknown,
    /// The partition table flagged it as FAT but the BPB hasn't been
    /// decoded yet; this state never survives `mount`.
    Undecided,
    /// A FAT16 or FAT32 volume with validated geometry.
    Fat(FatGeometry),
}

/// One partition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Absolute LBA of the partition's first sector.
    pub first_sector: u64,
    pub num_sectors: u64,
    /// The partition table's bootable flag; advisory, only used to pick the
    /// initially active partition.
    pub boot: bool,
    pub kind: PartitionKind,
}

impl Default for Partition {
    fn default() -> Self {
        Self {
            first_sector: 0,
            num_sectors: 0,
            boot: false,
            kind: PartitionKind::Unknown,
        }
    }
}

impl Partition {
    pub fn is_fat(&self) -> bool {
        matches!(self.kind, PartitionKind::Fat(_))
    }
}

/// A mounted volume.
///
/// `N` sizes each of the two sector caches (a handful of slots is plenty;
/// one cache serves file and directory data, the other FAT metadata).
///
/// Everything is `&mut self`: the driver is strictly single-threaded and it
/// is the caller's job to serialize access ([`crate::SharedFatFs`] does that
/// when std is around).
///
/// ```no_run
/// # fn demo(disk: fatvol::storage::FileBackedStorage) -> Result<(), fatvol::Error> {
/// use fatvol::{FatFs, OpenFlags};
///
/// let mut fs: FatFs<_> = FatFs::mount(disk)?;
/// let fd = fs.open("/LOGS/BOOT.TXT", OpenFlags::RDONLY)?;
/// let mut buf = [0u8; 128];
/// let n = fs.read(fd, &mut buf)?;
/// # let _ = n;
/// fs.close(fd)?;
/// fs.unmount()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FatFs<S, N = U4>
where
    S: Storage<SECTOR_SIZE = U512>,
    N: CacheSize,
{
    pub(crate) storage: S,
    pub(crate) partitions: [Partition; MAX_PARTITIONS],
    pub(crate) active: usize,
    pub(crate) files: [FileDesc; MAX_OPEN_FILES],
    pub(crate) data_cache: SectorCache<N>,
    pub(crate) fat_cache: SectorCache<N>,
}

/// The working set of a single operation: the storage plus both caches,
/// split-borrowed out of the handle, and a copy of the active partition's
/// geometry. Lets the lower layers (chain walking, directory scans, file
/// reads) borrow what they need without fighting over `&mut FatFs`.
pub(crate) struct VolumeIo<'a, S, N>
where
    S: Storage<SECTOR_SIZE = U512>,
    N: CacheSize,
{
    pub storage: &'a mut S,
    pub data_cache: &'a mut SectorCache<N>,
    pub fat_cache: &'a mut SectorCache<N>,
    pub geom: FatGeometry,
}

impl<S, N> FatFs<S, N>
where
    S: Storage<SECTOR_SIZE = U512>,
    N: CacheSize,
{
    /// Discovers partitions (GPT, then MBR, then a bare volume), decodes
    /// their BPBs, and selects the initially active partition: the first
    /// bootable FAT partition, else the first FAT partition.
    ///
    /// Fails with [`Error::NoFatVolume`] when nothing usable is found; the
    /// storage is consumed either way.
    pub fn mount(mut storage: S) -> Result<Self, Error> {
        let partitions = discover(&mut storage)?;

        let active = partitions
            .iter()
            .position(|p| p.boot && p.is_fat())
            .or_else(|| partitions.iter().position(|p| p.is_fat()))
            .ok_or(Error::NoFatVolume)?;

        log::debug!(
            "mounted; active partition {} starts at sector {}",
            active,
            partitions[active].first_sector,
        );

        Ok(Self {
            storage,
            partitions,
            active,
            files: [FileDesc::default(); MAX_OPEN_FILES],
            data_cache: SectorCache::new(),
            fat_cache: SectorCache::new(),
        })
    }

    /// Flushes both caches and hands the storage back.
    pub fn unmount(mut self) -> Result<S, Error> {
        self.sync()?;

        Ok(self.storage)
    }

    /// Writes every dirty cached sector back to the device.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.fat_cache.flush(&mut self.storage)?;
        self.data_cache.flush(&mut self.storage)?;

        Ok(())
    }

    /// The decoded partition records, in table order.
    pub fn partitions(&self) -> &[Partition; MAX_PARTITIONS] {
        &self.partitions
    }

    /// Index of the partition path operations currently run against.
    pub fn active_partition(&self) -> usize {
        self.active
    }

    /// Makes partition `idx` the active one.
    ///
    /// Open descriptors hold per-partition state (cluster positions,
    /// directory entry locations), so switching is refused while any
    /// descriptor is open.
    pub fn select_partition(&mut self, idx: usize) -> Result<(), Error> {
        if self.files.iter().any(|f| f.open) {
            return Err(Error::PartitionBusy);
        }

        match self.partitions.get(idx) {
            Some(p) if p.is_fat() => {
                self.active = idx;
                Ok(())
            }
            _ => Err(Error::BadPartition),
        }
    }

    /// Re-reads and decodes the boot sector of FAT partition `idx`; the
    /// advisory fields (OEM name, volume label and id, filesystem-type
    /// string) live there.
    pub fn boot_sector(&mut self, idx: usize) -> Result<BootSector, Error> {
        let part = self.partitions.get(idx).copied().ok_or(Error::BadPartition)?;
        if !part.is_fat() {
            return Err(Error::BadPartition);
        }

        let mut sector = generic_array::GenericArray::default();
        self.storage.read_sector(part.first_sector, &mut sector).map_err(|e| {
            log::warn!("failed to re-read boot sector at {}: {:?}", part.first_sector, e);
            Error::Io
        })?;

        BootSector::read(&sector)
    }

    pub(crate) fn geometry_of(&self, idx: usize) -> Result<FatGeometry, Error> {
        match self.partitions.get(idx).map(|p| p.kind) {
            Some(PartitionKind::Fat(geom)) => Ok(geom),
            _ => Err(Error::BadPartition),
        }
    }

    pub(crate) fn active_geometry(&self) -> Result<FatGeometry, Error> {
        self.geometry_of(self.active)
    }

    pub(crate) fn io(&mut self, geom: FatGeometry) -> VolumeIo<'_, S, N> {
        VolumeIo {
            storage: &mut self.storage,
            data_cache: &mut self.data_cache,
            fat_cache: &mut self.fat_cache,
            geom,
        }
    }
}

/// Builds the partition records: GPT first, then MBR, then the table-less
/// single-volume layout. Whatever the tables tentatively flag as FAT gets
/// its BPB decoded and validated here too.
fn discover<S: Storage<SECTOR_SIZE = U512>>(
    storage: &mut S,
) -> Result<[Partition; MAX_PARTITIONS], Error> {
    let mut partitions = [Partition::default(); MAX_PARTITIONS];

    if let Some(gpt) = GptHeader::read(storage)? {
        log::debug!(
            "GPT with {} entries of {} bytes at sector {}",
            gpt.num_entries, gpt.entry_size, gpt.entries_lba,
        );

        let n = gpt.num_entries.min(MAX_PARTITIONS as u32);
        for i in 0..n {
            let entry = gpt.partition_entry(storage, i)?;
            if entry.is_unused() {
                continue;
            }

            partitions[i as usize] = Partition {
                first_sector: entry.first_lba,
                num_sectors: entry.num_sectors(),
                boot: entry.legacy_bios_bootable(),
                kind: if entry.is_basic_data() {
                    PartitionKind::Undecided
                } else {
                    PartitionKind::Unknown
                },
            };
        }
    } else {
        match Mbr::read(storage)? {
            Some(mbr) if mbr.has_fat_partition() => {
                log::debug!("MBR partition table");

                for (slot, entry) in partitions.iter_mut().zip(mbr.partitions.iter()) {
                    if entry.is_unused() {
                        continue;
                    }

                    *slot = Partition {
                        first_sector: entry.first_lba as u64,
                        num_sectors: entry.num_sectors as u64,
                        boot: entry.boot,
                        kind: if entry.is_fat() {
                            PartitionKind::Undecided
                        } else {
                            PartitionKind::Unknown
                        },
                    };
                }
            }

            // No table, or a 55 AA signature that really belongs to a bare
            // volume's BPB (a superfloppy's boot sector looks exactly like
            // an MBR with no FAT slots). Either way: try sector 0 as a BPB.
            _ => {
                log::debug!("no partition table; probing sector 0 as a BPB");

                partitions[0] = Partition {
                    first_sector: 0,
                    num_sectors: storage.capacity(),
                    boot: false,
                    kind: PartitionKind::Undecided,
                };
            }
        }
    }

    for (i, part) in partitions.iter_mut().enumerate() {
        if part.kind != PartitionKind::Undecided {
            continue;
        }

        part.kind = match decode_bpb(storage, part.first_sector) {
            Ok(geom) => {
                log::debug!(
                    "partition {}: {:?}, {} clusters of {} sectors",
                    i, geom.variant, geom.num_clusters - 1, geom.sectors_per_cluster,
                );
                PartitionKind::Fat(geom)
            }
            Err(e) => {
                log::warn!("partition {} at sector {}: {:?}", i, part.first_sector, e);
                PartitionKind::Unknown
            }
        };
    }

    Ok(partitions)
}

fn decode_bpb<S: Storage<SECTOR_SIZE = U512>>(
    storage: &mut S,
    first_lba: u64,
) -> Result<FatGeometry, Error> {
    let mut sector = generic_array::GenericArray::default();
    storage.read_sector(first_lba, &mut sector).map_err(|e| {
        log::warn!("failed to read boot sector at {}: {:?}", first_lba, e);
        Error::Io
    })?;

    BootSector::read(&sector)?.geometry(first_lba)
}
