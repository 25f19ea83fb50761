//! The descriptor layer: POSIX-flavoured open/read/lseek/close/stat over
//! resolved files.

use crate::{Error, Storage};

use super::FatFs;
use super::cache::CacheSize;
use super::dir::{self, DirEntry};
use super::table::{self, Cluster, ClusterCursor, Lba};

use generic_array::GenericArray;
use typenum::consts::U512;

use core::ops::BitOr;

/// Open flags, POSIX-style bits.
///
/// `open` needs at least one of [`RDONLY`](OpenFlags::RDONLY) /
/// [`WRONLY`](OpenFlags::WRONLY). The write-side flags are recognized but,
/// like the write path itself, not implemented yet: asking for write access
/// fails with [`Error::ReadOnly`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct OpenFlags(u8);

impl OpenFlags {
    pub const RDONLY: Self = Self(0x01);
    pub const WRONLY: Self = Self(0x02);
    pub const RDWR: Self = Self(0x03);
    pub const APPEND: Self = Self(0x04);
    pub const CREAT: Self = Self(0x08);
    pub const DIRECTORY: Self = Self(0x10);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn readable(self) -> bool {
        self.0 & Self::RDONLY.0 != 0
    }

    pub fn writable(self) -> bool {
        self.0 & Self::WRONLY.0 != 0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file.
    Set,
    /// From the descriptor's current offset.
    Cur,
    /// From the end of the file.
    End,
}

/// A calendar timestamp decoded from FAT's packed date/time words.
///
/// FAT time has two-second resolution and no time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    /// Date word: years-since-1980 in bits 15..9, month in 8..5, day in
    /// 4..0. Time word: hours in bits 15..11, minutes in 10..5, two-second
    /// units in 4..0.
    pub fn from_fat(date: u16, time: u16) -> Self {
        Self {
            year: 1980 + (date >> 9),
            month: ((date >> 5) & 0x0F) as u8,
            day: (date & 0x1F) as u8,
            hour: (time >> 11) as u8,
            minute: ((time >> 5) & 0x3F) as u8,
            second: ((time & 0x1F) * 2) as u8,
        }
    }
}

pub const S_IFREG: u32 = 0x8000;
pub const S_IFDIR: u32 = 0x4000;

/// What `stat`/`fstat` report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u32,
    /// `S_IFREG`/`S_IFDIR` plus rwx bits mirroring POSIX: read and execute
    /// are always granted, write unless the entry is marked read-only.
    pub mode: u32,
    pub modified: Timestamp,
    pub created: Timestamp,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR != 0
    }

    pub(crate) fn from_entry(entry: &DirEntry) -> Self {
        Self {
            size: entry.file_size,
            mode: mode_bits(entry.attributes.is_dir(), entry.attributes.is_read_only()),
            modified: Timestamp::from_fat(entry.write_date, entry.write_time),
            created: Timestamp::from_fat(entry.creation_date, entry.creation_time),
        }
    }
}

fn mode_bits(is_dir: bool, read_only: bool) -> u32 {
    let mut mode = if is_dir { S_IFDIR } else { S_IFREG };
    mode |= 0o555;
    if !read_only {
        mode |= 0o222;
    }
    mode
}

/// Everything recorded about a file when it was resolved.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FileInfo {
    pub partition: usize,
    pub size: u32,
    pub first_cluster: Cluster,
    /// Where the directory entry itself sits, for the (future) paths that
    /// update it.
    pub entry_sector: Lba,
    pub entry_offset: u16,
    pub read_only: bool,
    pub write_time: u16,
    pub write_date: u16,
    pub creation_time: u16,
    pub creation_date: u16,
}

/// One descriptor table slot.
///
/// While open, `current_cluster` is the cluster holding byte `offset`: the
/// chain head followed `offset / cluster_size` times. At the exact end of a
/// file whose size is a whole number of clusters that walk lands on the end
/// marker itself, which is fine: nothing dereferences it without checking.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FileDesc {
    pub open: bool,
    pub flags: OpenFlags,
    pub offset: u64,
    pub current_cluster: Cluster,
    pub info: FileInfo,
}

impl<S, N> FatFs<S, N>
where
    S: Storage<SECTOR_SIZE = U512>,
    N: CacheSize,
{
    fn descriptor(&self, fd: usize) -> Result<FileDesc, Error> {
        match self.files.get(fd) {
            Some(desc) if desc.open => Ok(*desc),
            _ => Err(Error::BadDescriptor),
        }
    }

    /// Opens a file on the active partition. Returns the lowest free
    /// descriptor.
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<usize, Error> {
        if !flags.readable() && !flags.writable() {
            return Err(Error::BadFlags);
        }

        if flags.writable() {
            log::warn!("open for writing refused; the write path is not implemented");
            return Err(Error::ReadOnly);
        }

        let fd = self
            .files
            .iter()
            .position(|desc| !desc.open)
            .ok_or(Error::OutOfDescriptors)?;

        let geom = self.active_geometry()?;
        let resolved = {
            let mut io = self.io(geom);
            dir::resolve(&mut io, path)?
        };

        if !resolved.exists {
            // CREAT is recognized but creation rides on the write path.
            log::debug!(
                "{:?} not found; scan ended in directory sector {}",
                path, resolved.dir_sector,
            );
            return Err(Error::NotFound);
        }

        let entry = resolved.entry;
        if entry.attributes.is_dir() {
            return Err(Error::IsDirectory);
        }

        self.files[fd] = FileDesc {
            open: true,
            flags,
            offset: 0,
            current_cluster: entry.first_cluster(),
            info: FileInfo {
                partition: self.active,
                size: entry.file_size,
                first_cluster: entry.first_cluster(),
                entry_sector: resolved.entry_sector,
                entry_offset: resolved.entry_offset,
                read_only: entry.attributes.is_read_only(),
                write_time: entry.write_time,
                write_date: entry.write_date,
                creation_time: entry.creation_time,
                creation_date: entry.creation_date,
            },
        };

        log::debug!("opened {:?} as descriptor {}", path, fd);

        Ok(fd)
    }

    /// Closes a descriptor. A descriptor that was opened for writing gets
    /// the caches flushed on the way out.
    pub fn close(&mut self, fd: usize) -> Result<(), Error> {
        let desc = self.descriptor(fd)?;

        if desc.flags.writable() {
            self.sync()?;
        }

        self.files[fd] = FileDesc::default();

        log::debug!(
            "closed descriptor {} (entry at sector {} offset {})",
            fd, desc.info.entry_sector, desc.info.entry_offset,
        );

        Ok(())
    }

    /// Reads up to `buf.len()` bytes from the descriptor's current offset.
    /// Short only at end of file.
    ///
    /// The position is committed only when the whole call succeeds; a
    /// failure mid-read leaves the descriptor where it was.
    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let desc = self.descriptor(fd)?;

        if !desc.flags.readable() {
            return Err(Error::PermissionDenied);
        }

        let geom = self.geometry_of(desc.info.partition)?;

        let mut want = buf.len().min((desc.info.size as u64 - desc.offset) as usize);
        if want == 0 {
            return Ok(0);
        }

        if desc.current_cluster == table::FREE || table::is_end_of_chain(desc.current_cluster) {
            log::warn!("file has {} bytes left but no cluster to read them from", want);
            return Err(Error::CorruptChain);
        }

        let mut io = self.io(geom);
        let mut cursor = ClusterCursor::new(&geom, desc.current_cluster, desc.offset);
        let mut offset = desc.offset;
        let mut done = 0;

        // Head: an unaligned start is served through the cache.
        let head = (offset % 512) as usize;
        if head != 0 {
            let take = want.min(512 - head);

            let slot = io.data_cache.get(io.storage, cursor.sector())?;
            buf[..take].copy_from_slice(&slot.bytes()[head..head + take]);

            done += take;
            offset += take as u64;
            want -= take;

            if head + take == 512 {
                io.advance(&mut cursor)?;
            }
        }

        // Body: aligned whole sectors go straight into the caller's buffer,
        // skipping the copy through the cache. The bypassed sectors are not
        // inserted, so the cache stays consistent.
        while want >= 512 {
            if table::is_end_of_chain(cursor.cluster) {
                log::warn!("file size extends past its cluster chain");
                return Err(Error::CorruptChain);
            }

            let sector = cursor.sector();
            let dst = GenericArray::from_mut_slice(&mut buf[done..done + 512]);
            io.storage.read_sector(sector, dst).map_err(|e| {
                log::warn!("read of sector {} failed: {:?}", sector, e);
                Error::Io
            })?;

            done += 512;
            offset += 512;
            want -= 512;

            io.advance(&mut cursor)?;
        }

        // Tail: the remainder is served through the cache too.
        if want > 0 {
            if table::is_end_of_chain(cursor.cluster) {
                log::warn!("file size extends past its cluster chain");
                return Err(Error::CorruptChain);
            }

            let slot = io.data_cache.get(io.storage, cursor.sector())?;
            buf[done..done + want].copy_from_slice(&slot.bytes()[..want]);

            done += want;
            offset += want as u64;
        }

        let desc = &mut self.files[fd];
        desc.offset = offset;
        desc.current_cluster = cursor.cluster;

        Ok(done)
    }

    /// Reserved. Always fails with [`Error::ReadOnly`] for now (and since
    /// nothing can be opened writable, usually with
    /// [`Error::PermissionDenied`] before that).
    pub fn write(&mut self, fd: usize, _buf: &[u8]) -> Result<usize, Error> {
        let desc = self.descriptor(fd)?;

        if !desc.flags.writable() {
            return Err(Error::PermissionDenied);
        }

        Err(Error::ReadOnly)
    }

    /// Repositions the descriptor. Targets outside `0..=size` are refused.
    ///
    /// Seeks forward walk the chain from the current cluster; seeks behind
    /// the current cluster restart from the head of the chain (FAT links
    /// only point forward).
    pub fn lseek(&mut self, fd: usize, offset: i64, whence: Whence) -> Result<u64, Error> {
        let desc = self.descriptor(fd)?;

        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => desc.offset as i64,
            Whence::End => desc.info.size as i64,
        };

        let target = base.checked_add(offset).ok_or(Error::SeekOutOfRange)?;
        if target < 0 || target as u64 > desc.info.size as u64 {
            return Err(Error::SeekOutOfRange);
        }
        let target = target as u64;

        let geom = self.geometry_of(desc.info.partition)?;
        let cluster_bytes = geom.cluster_size_in_bytes() as u64;

        let current_index = desc.offset / cluster_bytes;
        let target_index = target / cluster_bytes;

        let (start, steps) = if target_index >= current_index {
            (desc.current_cluster, target_index - current_index)
        } else {
            (desc.info.first_cluster, target_index)
        };

        let cluster = if steps > 0 {
            self.io(geom).walk_chain(start, steps)?
        } else {
            start
        };

        let desc = &mut self.files[fd];
        desc.offset = target;
        desc.current_cluster = cluster;

        Ok(target)
    }

    /// Stats a path on the active partition. Works for directories too.
    pub fn stat(&mut self, path: &str) -> Result<Stat, Error> {
        let geom = self.active_geometry()?;

        let resolved = {
            let mut io = self.io(geom);
            dir::resolve(&mut io, path)?
        };

        if !resolved.exists {
            return Err(Error::NotFound);
        }

        Ok(Stat::from_entry(&resolved.entry))
    }

    /// Stats an open descriptor (from the entry as it looked at `open`).
    pub fn fstat(&self, fd: usize) -> Result<Stat, Error> {
        let info = self.descriptor(fd)?.info;

        Ok(Stat {
            size: info.size,
            mode: mode_bits(false, info.read_only),
            modified: Timestamp::from_fat(info.write_date, info.write_time),
            created: Timestamp::from_fat(info.creation_date, info.creation_time),
        })
    }
}

#[cfg(test)]
mod fd_tests {
    use super::*;
    use crate::fat::MAX_OPEN_FILES;
    use crate::testing::{pattern, sample_volume as volume};

    #[test]
    fn open_needs_an_access_mode() {
        let mut fs = volume();

        assert_eq!(
            fs.open("/HELLO.TXT", OpenFlags::from_bits(0)),
            Err(Error::BadFlags),
        );
        assert_eq!(
            fs.open("/HELLO.TXT", OpenFlags::CREAT),
            Err(Error::BadFlags),
        );
    }

    #[test]
    fn open_for_writing_is_refused() {
        let mut fs = volume();

        assert_eq!(fs.open("/HELLO.TXT", OpenFlags::WRONLY), Err(Error::ReadOnly));
        assert_eq!(fs.open("/HELLO.TXT", OpenFlags::RDWR), Err(Error::ReadOnly));
        assert_eq!(
            fs.open("/NEW.TXT", OpenFlags::WRONLY | OpenFlags::CREAT),
            Err(Error::ReadOnly),
        );
    }

    #[test]
    fn open_misses_and_directories() {
        let mut fs = volume();

        assert_eq!(fs.open("/NOPE.TXT", OpenFlags::RDONLY), Err(Error::NotFound));
        assert_eq!(fs.open("/SUBDIR", OpenFlags::RDONLY), Err(Error::IsDirectory));
    }

    #[test]
    fn descriptors_are_handed_out_lowest_first() {
        let mut fs = volume();

        assert_eq!(fs.open("/HELLO.TXT", OpenFlags::RDONLY), Ok(0));
        assert_eq!(fs.open("/BIG.BIN", OpenFlags::RDONLY), Ok(1));

        fs.close(0).unwrap();
        assert_eq!(fs.open("/HELLO.TXT", OpenFlags::RDONLY), Ok(0));
    }

    #[test]
    fn the_descriptor_table_is_finite() {
        let mut fs = volume();

        for _ in 0..MAX_OPEN_FILES {
            fs.open("/HELLO.TXT", OpenFlags::RDONLY).unwrap();
        }

        assert_eq!(
            fs.open("/HELLO.TXT", OpenFlags::RDONLY),
            Err(Error::OutOfDescriptors),
        );
    }

    #[test]
    fn reads_are_clamped_to_the_file() {
        let mut fs = volume();
        let fd = fs.open("/HELLO.TXT", OpenFlags::RDONLY).unwrap();

        let mut buf = [0u8; 100];
        assert_eq!(fs.read(fd, &mut buf), Ok(13));
        assert_eq!(&buf[..13], b"Hello, world!");

        // And at the end there's nothing left.
        assert_eq!(fs.read(fd, &mut buf), Ok(0));
    }

    #[test]
    fn one_big_read_crosses_clusters() {
        let mut fs = volume();
        let fd = fs.open("/BIG.BIN", OpenFlags::RDONLY).unwrap();

        let mut buf = vec![0u8; 4000];
        assert_eq!(fs.read(fd, &mut buf), Ok(3000));

        for (i, b) in buf[..3000].iter().enumerate() {
            assert_eq!(*b, pattern(i), "byte {}", i);
        }
    }

    #[test]
    fn chunked_reads_see_the_same_bytes() {
        let mut fs = volume();
        let fd = fs.open("/BIG.BIN", OpenFlags::RDONLY).unwrap();

        let mut all = Vec::new();
        // Deliberately awkward chunk sizes: unaligned heads and tails.
        for chunk in &[1usize, 511, 513, 700, 100, 2000] {
            let mut buf = vec![0u8; *chunk];
            let n = fs.read(fd, &mut buf).unwrap();
            all.extend_from_slice(&buf[..n]);
        }

        assert_eq!(all.len(), 3000);
        for (i, b) in all.iter().enumerate() {
            assert_eq!(*b, pattern(i), "byte {}", i);
        }
    }

    #[test]
    fn seek_set_cur_end() {
        let mut fs = volume();
        let fd = fs.open("/BIG.BIN", OpenFlags::RDONLY).unwrap();

        assert_eq!(fs.lseek(fd, 1500, Whence::Set), Ok(1500));
        assert_eq!(fs.lseek(fd, 0, Whence::Cur), Ok(1500));
        assert_eq!(fs.lseek(fd, -500, Whence::Cur), Ok(1000));
        assert_eq!(fs.lseek(fd, 0, Whence::End), Ok(3000));
        assert_eq!(fs.lseek(fd, -3000, Whence::End), Ok(0));
    }

    #[test]
    fn seeks_outside_the_file_are_refused() {
        let mut fs = volume();
        let fd = fs.open("/BIG.BIN", OpenFlags::RDONLY).unwrap();

        assert_eq!(fs.lseek(fd, -1, Whence::Set), Err(Error::SeekOutOfRange));
        assert_eq!(fs.lseek(fd, 3001, Whence::Set), Err(Error::SeekOutOfRange));
        assert_eq!(fs.lseek(fd, 1, Whence::End), Err(Error::SeekOutOfRange));

        // The failed seeks moved nothing.
        assert_eq!(fs.lseek(fd, 0, Whence::Cur), Ok(0));
    }

    #[test]
    fn reads_after_seeks_land_in_the_right_cluster() {
        let mut fs = volume();
        let fd = fs.open("/BIG.BIN", OpenFlags::RDONLY).unwrap();

        // Third cluster, a little in.
        fs.lseek(fd, 2 * 1024 + 10, Whence::Set).unwrap();
        let mut buf = [0u8; 20];
        assert_eq!(fs.read(fd, &mut buf), Ok(20));
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, pattern(2 * 1024 + 10 + i));
        }

        // Back to the start: the chain walk has to restart from the head.
        fs.lseek(fd, 0, Whence::Set).unwrap();
        let mut buf = vec![0u8; 1024];
        assert_eq!(fs.read(fd, &mut buf), Ok(1024));
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, pattern(i));
        }
    }

    #[test]
    fn a_chain_shorter_than_the_size_field_fails_the_read() {
        let mut fs = volume();
        let fd = fs.open("/SIZELIE.BIN", OpenFlags::RDONLY).unwrap();

        let mut buf = vec![0u8; 4096];
        assert_eq!(fs.read(fd, &mut buf), Err(Error::CorruptChain));

        // The failed read committed nothing.
        assert_eq!(fs.lseek(fd, 0, Whence::Cur), Ok(0));

        // Stopping short of the broken link still works; landing exactly on
        // the cluster boundary has to follow it (the position invariant
        // needs the next cluster) and fails too.
        let mut buf = vec![0u8; 2047];
        assert_eq!(fs.read(fd, &mut buf), Ok(2047));
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, pattern(i), "byte {}", i);
        }

        fs.lseek(fd, 0, Whence::Set).unwrap();
        let mut buf = vec![0u8; 2048];
        assert_eq!(fs.read(fd, &mut buf), Err(Error::CorruptChain));
    }

    #[test]
    fn reading_to_a_cluster_aligned_end_parks_on_the_end_marker() {
        let mut fs = volume();
        let fd = fs.open("/EXACT.BIN", OpenFlags::RDONLY).unwrap();

        let mut buf = vec![0u8; 1024];
        assert_eq!(fs.read(fd, &mut buf), Ok(1024));
        assert_eq!(fs.read(fd, &mut buf), Ok(0));

        // Seeking backward from the end marker restarts from the head.
        assert_eq!(fs.lseek(fd, 512, Whence::Set), Ok(512));
        assert_eq!(fs.read(fd, &mut buf[..512]), Ok(512));
    }

    #[test]
    fn write_is_reserved() {
        let mut fs = volume();
        let fd = fs.open("/HELLO.TXT", OpenFlags::RDONLY).unwrap();

        assert_eq!(fs.write(fd, b"nope"), Err(Error::PermissionDenied));
    }

    #[test]
    fn closed_descriptors_stop_working() {
        let mut fs = volume();
        let fd = fs.open("/HELLO.TXT", OpenFlags::RDONLY).unwrap();
        fs.close(fd).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(fs.read(fd, &mut buf), Err(Error::BadDescriptor));
        assert_eq!(fs.close(fd), Err(Error::BadDescriptor));
        assert_eq!(fs.close(99), Err(Error::BadDescriptor));
    }

    #[test]
    fn stat_reports_size_mode_and_times() {
        let mut fs = volume();

        let st = fs.stat("/HELLO.TXT").unwrap();
        assert_eq!(st.size, 13);
        assert_eq!(st.mode, S_IFREG | 0o777);
        assert!(!st.is_dir());
        assert_eq!(
            st.modified,
            Timestamp { year: 2021, month: 7, day: 9, hour: 13, minute: 37, second: 58 },
        );
        assert_eq!(
            st.created,
            Timestamp { year: 2021, month: 7, day: 9, hour: 13, minute: 51, second: 26 },
        );

        let st = fs.stat("/SUBDIR").unwrap();
        assert!(st.is_dir());
        assert_eq!(st.mode, S_IFDIR | 0o777);

        // The read-only attribute drops the write bits.
        let st = fs.stat("/LOCKED.TXT").unwrap();
        assert_eq!(st.mode, S_IFREG | 0o555);
    }

    #[test]
    fn fstat_matches_stat() {
        let mut fs = volume();
        let fd = fs.open("/HELLO.TXT", OpenFlags::RDONLY).unwrap();

        assert_eq!(fs.fstat(fd).unwrap(), fs.stat("/HELLO.TXT").unwrap());
    }

    #[test]
    fn select_partition_is_pinned_by_open_descriptors() {
        let mut fs = volume();
        let fd = fs.open("/HELLO.TXT", OpenFlags::RDONLY).unwrap();

        assert_eq!(fs.select_partition(0), Err(Error::PartitionBusy));

        fs.close(fd).unwrap();
        assert_eq!(fs.select_partition(0), Ok(()));
        assert_eq!(fs.select_partition(1), Err(Error::BadPartition));
        assert_eq!(fs.select_partition(99), Err(Error::BadPartition));
    }
}
