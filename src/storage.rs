//! The storage interface the driver runs on top of.
//!
//! A `Storage` implementation moves exactly one sector per call; the driver
//! never asks for partial or unaligned transfers. Everything else (caching,
//! cluster arithmetic, retry policy if you want one) is somebody else's job.

use core::fmt::Debug;

use generic_array::{ArrayLength, GenericArray};
use typenum::consts::U512;

/// A 512-byte sector buffer.
pub type SectorBuf = GenericArray<u8, U512>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ReadError<T> {
    /// The requested sector is past the end of the medium.
    OutOfRange { requested_sector: u64, capacity: u64 },
    Other(T),
}

impl<T> From<T> for ReadError<T> {
    fn from(other: T) -> Self {
        ReadError::Other(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WriteError<T> {
    /// The requested sector is past the end of the medium.
    OutOfRange { requested_sector: u64, capacity: u64 },
    Other(T),
}

impl<T> From<T> for WriteError<T> {
    fn from(other: T) -> Self {
        WriteError::Other(other)
    }
}

/// Implementors of this trait provide sector-granularity access to some
/// random-access medium: an SD card, a disk image file, a flash partition.
pub trait Storage {
    #[allow(non_camel_case_types)]
    type SECTOR_SIZE: ArrayLength<u8>;

    type ReadErr: Debug;
    type WriteErr: Debug;

    /// Number of sectors on the medium.
    fn capacity(&self) -> u64;

    /// Reads one entire sector.
    ///
    /// This function should never panic but can return errors for the
    /// appropriate cases (i.e. out of range).
    fn read_sector(
        &mut self,
        lba: u64,
        buffer: &mut GenericArray<u8, Self::SECTOR_SIZE>,
    ) -> Result<(), ReadError<Self::ReadErr>>;

    /// Writes one entire sector.
    ///
    /// This function should never panic but can return errors for the
    /// appropriate cases (i.e. out of range).
    fn write_sector(
        &mut self,
        lba: u64,
        buffer: &GenericArray<u8, Self::SECTOR_SIZE>,
    ) -> Result<(), WriteError<Self::WriteErr>>;
}

using_std! {
    use std::fmt::{self, Display};

    macro_rules! display_using_debug {
        ($ty:tt) => { impl<T: Debug> Display for $ty<T> {
            fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
                Debug::fmt(self, fmt)
            }
        }};
    }

    macro_rules! err {
        ($ty:tt) => {
            display_using_debug!($ty);

            impl<T: Debug> std::error::Error for $ty<T> { }
        };
    }

    err!(WriteError);
    err!(ReadError);

    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::Path;

    /// A disk image file (or a raw block device node) as `Storage`.
    ///
    /// Device nodes report a zero metadata length on some platforms; use
    /// [`FileBackedStorage::with_explicit_capacity`] for those.
    #[derive(Debug)]
    pub struct FileBackedStorage {
        file: File,
        capacity: u64,
    }

    impl FileBackedStorage {
        pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let capacity = file.metadata()?.len() / 512;

            Ok(Self { file, capacity })
        }

        pub fn with_explicit_capacity<P: AsRef<Path>>(
            path: P,
            capacity_in_sectors: u64,
        ) -> Result<Self, std::io::Error> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;

            Ok(Self { file, capacity: capacity_in_sectors })
        }
    }

    impl Storage for FileBackedStorage {
        type SECTOR_SIZE = U512;

        type ReadErr = std::io::Error;
        type WriteErr = std::io::Error;

        fn capacity(&self) -> u64 {
            self.capacity
        }

        fn read_sector(
            &mut self,
            lba: u64,
            buffer: &mut SectorBuf,
        ) -> Result<(), ReadError<std::io::Error>> {
            if lba >= self.capacity {
                return Err(ReadError::OutOfRange {
                    requested_sector: lba,
                    capacity: self.capacity,
                });
            }

            self.file.seek(SeekFrom::Start(lba * 512))?;
            self.file.read_exact(buffer.as_mut_slice())?;

            Ok(())
        }

        fn write_sector(
            &mut self,
            lba: u64,
            buffer: &SectorBuf,
        ) -> Result<(), WriteError<std::io::Error>> {
            if lba >= self.capacity {
                return Err(WriteError::OutOfRange {
                    requested_sector: lba,
                    capacity: self.capacity,
                });
            }

            self.file.seek(SeekFrom::Start(lba * 512))?;
            self.file.write_all(buffer.as_slice())?;

            Ok(())
        }
    }

    /// An in-memory medium. Handy for tests and benches.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RamStorage {
        bytes: Vec<u8>,
    }

    impl RamStorage {
        pub fn new(capacity_in_sectors: u64) -> Self {
            Self { bytes: vec![0; (capacity_in_sectors * 512) as usize] }
        }

        /// Takes ownership of an image; the length is rounded up to a whole
        /// number of sectors.
        pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
            let rem = bytes.len() % 512;
            if rem != 0 {
                bytes.resize(bytes.len() + (512 - rem), 0);
            }

            Self { bytes }
        }

        pub fn as_bytes(&self) -> &[u8] {
            &self.bytes
        }
    }

    impl Storage for RamStorage {
        type SECTOR_SIZE = U512;

        type ReadErr = core::convert::Infallible;
        type WriteErr = core::convert::Infallible;

        fn capacity(&self) -> u64 {
            (self.bytes.len() / 512) as u64
        }

        fn read_sector(
            &mut self,
            lba: u64,
            buffer: &mut SectorBuf,
        ) -> Result<(), ReadError<Self::ReadErr>> {
            let offset = (lba * 512) as usize;
            if offset + 512 > self.bytes.len() {
                return Err(ReadError::OutOfRange {
                    requested_sector: lba,
                    capacity: self.capacity(),
                });
            }

            buffer.as_mut_slice().copy_from_slice(&self.bytes[offset..offset + 512]);
            Ok(())
        }

        fn write_sector(
            &mut self,
            lba: u64,
            buffer: &SectorBuf,
        ) -> Result<(), WriteError<Self::WriteErr>> {
            let offset = (lba * 512) as usize;
            if offset + 512 > self.bytes.len() {
                return Err(WriteError::OutOfRange {
                    requested_sector: lba,
                    capacity: self.capacity(),
                });
            }

            self.bytes[offset..offset + 512].copy_from_slice(buffer.as_slice());
            Ok(())
        }
    }
}
